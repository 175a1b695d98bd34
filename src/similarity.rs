use crate::config::files_handling::{self, CENTROIDS_FILE, DOCUMENTS_FILE};
use crate::config::Params;
use crate::embedding::EmbeddingTable;
use crate::error::Result;
use crate::kmeans::{nearest_centroid, Centroid};
use crate::text::Analyzer;

use ndarray::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// characters kept on each side of a text match
const SNIPPET_RADIUS: usize = 120;

/// A crawled page with the vector derived from its text and, once clustered, its cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub url: String,
    #[serde(default)]
    pub text: String,
    pub vector: Vec<f64>,
    #[serde(default)]
    pub cluster: Option<usize>,
}

/// Score given to a vector without direction, below any real cosine.
pub const DISSIMILAR: f64 = f64::NEG_INFINITY;

/// Cosine similarity in [-1, 1].
///
/// A zero vector (a text with no known lemma) or vectors of different lengths score
/// [`DISSIMILAR`], so they rank after every document with an actual direction.
pub fn cosine(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    if a.len() != b.len() {
        return DISSIMILAR;
    }
    let norm = a.dot(&a).sqrt() * b.dot(&b).sqrt();
    if norm == 0.0 {
        DISSIMILAR
    } else {
        a.dot(&b) / norm
    }
}

pub fn squared_euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    squared_euclidean(a, b).sqrt()
}

/// How a query is matched against the corpus.
#[derive(Debug, Clone, PartialEq)]
pub enum RankMode {
    /// Cosine against every document.
    WholeCorpus,
    /// Only the documents of the cluster nearest to the query. With `rerank`, documents
    /// whose text contains that string come first.
    ClusterRouted { rerank: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub url: String,
    pub score: f64,
    pub snippet: Option<String>,
}

fn snippet(text: &str, needle: &str) -> Option<String> {
    if needle.is_empty() {
        return None;
    }
    let idx = text.find(needle)?;
    let start = text[..idx].char_indices().rev().take(SNIPPET_RADIUS).last().map(|(i, _)| i).unwrap_or(idx);
    let end_from = idx + needle.len();
    let end = text[end_from..].char_indices().nth(SNIPPET_RADIUS).map(|(i, _)| end_from + i).unwrap_or(text.len());
    Some(text[start..end].to_string())
}

/// Query side of the engine: encodes text and ranks documents.
pub struct Similarity {
    table: EmbeddingTable,
    analyzer: Analyzer,
    documents: Vec<Document>,
    centroids: Array2<f64>,
    cluster_ids: Vec<usize>,
}

impl Similarity {

    pub fn new(table: EmbeddingTable, analyzer: Analyzer, documents: Vec<Document>, centroids: &[Centroid]) -> Similarity {
        let dim = centroids.first().map(|c| c.vector.len()).unwrap_or(0);
        let values: Vec<f64> = centroids.iter().flat_map(|c| c.vector.iter().copied()).collect();
        let centroid_rows = Array2::from_shape_vec((centroids.len(), dim), values).unwrap_or_else(|e| {
            warn!(clusters = centroids.len(), error = %e, "centroids have different dimensions, cluster routing is off");
            Array2::zeros((0, dim))
        });

        Self {
            table,
            analyzer,
            documents,
            centroids: centroid_rows,
            cluster_ids: centroids.iter().map(|c| c.cluster).collect(),
        }
    }

    /// Loads the model, documents and centroids written by a pipeline run.
    pub fn open(params: &Params) -> Result<Similarity> {
        let analyzer = Analyzer::from_params(params)?;
        let table = EmbeddingTable::load(&params.model_path(), params.train.embedding_dim)?;
        let documents = files_handling::read_input::<Vec<Document>>(&format!("{}/{}", params.output_dir, DOCUMENTS_FILE))?;
        let centroids = files_handling::read_input::<Vec<Centroid>>(&format!("{}/{}", params.output_dir, CENTROIDS_FILE))?;
        info!(words = table.len(), documents = documents.len(), clusters = centroids.len(), "search index opened");
        Ok(Self::new(table, analyzer, documents, &centroids))
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn encode(&self, text: &str) -> Array1<f64> {
        self.table.encode(&self.analyzer, text)
    }

    /// Vocabulary words nearest to `query` by cosine.
    pub fn most_similar(&self, query: ArrayView1<f64>, k: usize) -> Vec<(String, f64)> {
        self.table.most_similar(query, k)
    }

    /// Cluster id of the centroid closest to `query`, `None` without centroids.
    pub fn nearest_cluster(&self, query: ArrayView1<f64>) -> Option<usize> {
        if self.centroids.nrows() == 0 || self.centroids.ncols() != query.len() {
            return None;
        }
        Some(self.cluster_ids[nearest_centroid(query, self.centroids.view())])
    }

    fn score(&self, query: ArrayView1<f64>, document: &Document) -> f64 {
        cosine(query, ArrayView1::from(document.vector.as_slice()))
    }

    /// Best `top_n` documents for `query`, highest score first.
    pub fn rank(&self, query: ArrayView1<f64>, mode: &RankMode, top_n: usize) -> Vec<Hit> {
        match mode {
            RankMode::WholeCorpus => {
                let mut scored: Vec<(usize, f64)> = self
                    .documents
                    .par_iter()
                    .enumerate()
                    .map(|(i, doc)| (i, self.score(query, doc)))
                    .collect();
                scored.sort_by(|(_i, s), (_j, t)| t.total_cmp(s));
                scored
                    .into_iter()
                    .take(top_n)
                    .map(|(i, score)| Hit { url: self.documents[i].url.to_owned(), score, snippet: None })
                    .collect()
            }
            RankMode::ClusterRouted { rerank } => {
                let cluster = match self.nearest_cluster(query) {
                    Some(cluster) => cluster,
                    None => return Vec::new(),
                };

                // (text match, score, document)
                let mut scored: Vec<(bool, f64, &Document)> = self
                    .documents
                    .iter()
                    .filter(|doc| doc.cluster == Some(cluster))
                    .map(|doc| {
                        let matched = rerank.as_deref().map_or(false, |q| !q.is_empty() && doc.text.contains(q));
                        (matched, self.score(query, doc), doc)
                    })
                    .collect();
                scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.total_cmp(&a.1)));

                scored
                    .into_iter()
                    .take(top_n)
                    .map(|(_, score, doc)| Hit {
                        url: doc.url.to_owned(),
                        score,
                        snippet: rerank.as_deref().and_then(|q| snippet(&doc.text, q)),
                    })
                    .collect()
            }
        }
    }

    pub fn search(&self, text: &str, mode: &RankMode, top_n: usize) -> Vec<Hit> {
        let query = self.encode(text);
        self.rank(query.view(), mode, top_n)
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use ndarray::array;

    fn doc(url: &str, text: &str, vector: Vec<f64>, cluster: Option<usize>) -> Document {
        Document { url: url.to_string(), text: text.to_string(), vector, cluster }
    }

    fn index() -> Similarity {
        let table = EmbeddingTable::from_parts(
            vec!["cat".to_string(), "dog".to_string(), "fish".to_string()],
            array![[1.0, 0.0], [0.9, 0.1], [0.0, 1.0]],
        );
        let documents = vec![
            doc("http://cats", "all about the cat", vec![1.0, 0.0], Some(0)),
            doc("http://dogs", "a dog is not a cat", vec![0.8, 0.3], Some(0)),
            doc("http://fish", "fish live in water", vec![0.0, 1.0], Some(1)),
            doc("http://empty", "", vec![0.0, 0.0], None),
        ];
        let centroids = vec![
            Centroid { cluster: 0, vector: vec![0.9, 0.15] },
            Centroid { cluster: 1, vector: vec![0.0, 1.0] },
        ];
        Similarity::new(table, Analyzer::default(), documents, &centroids)
    }

    #[test]
    fn cosine_of_a_vector_with_itself_is_one() {
        for v in [array![1.0, 2.0, 3.0], array![-0.5, 0.0, 1e-3], array![7.0]] {
            assert!((cosine(v.view(), v.view()) - 1.0).abs() < 1e-12);
        }
        let zero = array![0.0, 0.0];
        assert_eq!(cosine(zero.view(), array![1.0, 0.0].view()), DISSIMILAR);
        assert_eq!(cosine(array![1.0].view(), array![1.0, 0.0].view()), DISSIMILAR);
        assert!(DISSIMILAR < cosine(array![-1.0, 0.0].view(), array![1.0, 0.0].view()));
    }

    #[test]
    fn empty_documents_rank_below_opposite_ones() {
        let table = EmbeddingTable::from_parts(vec!["cat".to_string()], array![[1.0, 0.0]]);
        let documents = vec![
            doc("http://empty", "", vec![0.0, 0.0], None),
            doc("http://anti", "", vec![-1.0, 0.0], None),
        ];
        let index = Similarity::new(table, Analyzer::default(), documents, &[]);
        let hits = index.search("cat", &RankMode::WholeCorpus, 2);
        let order: Vec<&str> = hits.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(order, vec!["http://anti", "http://empty"]);
        assert_eq!(hits[0].score, -1.0);
    }

    #[test]
    fn ragged_centroids_turn_routing_off() {
        let centroids = vec![
            Centroid { cluster: 0, vector: vec![1.0, 0.0] },
            Centroid { cluster: 1, vector: vec![1.0] },
        ];
        let index = Similarity::new(EmbeddingTable::new(2), Analyzer::default(), Vec::new(), &centroids);
        assert_eq!(index.nearest_cluster(array![1.0, 0.0].view()), None);
    }

    #[test]
    fn euclidean_distance() {
        assert_eq!(euclidean(array![0.0, 0.0].view(), array![3.0, 4.0].view()), 5.0);
    }

    #[test]
    fn whole_corpus_ranking_is_descending() {
        let index = index();
        let hits = index.search("cat", &RankMode::WholeCorpus, 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].url, "http://cats");
        assert_eq!(hits[1].url, "http://dogs");
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn unknown_query_scores_zero_everywhere() {
        let index = index();
        let query = index.encode("zebra");
        assert_eq!(query, Array1::<f64>::zeros(2));
        let hits = index.rank(query.view(), &RankMode::WholeCorpus, 10);
        assert_eq!(hits.len(), 4);
        assert!(hits.iter().all(|h| h.score == DISSIMILAR));
    }

    #[test]
    fn routing_picks_the_nearest_centroid() {
        let index = index();
        assert_eq!(index.nearest_cluster(index.encode("fish").view()), Some(1));
        assert_eq!(index.nearest_cluster(index.encode("cat dog").view()), Some(0));

        let hits = index.search("fish", &RankMode::ClusterRouted { rerank: None }, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "http://fish");
    }

    #[test]
    fn rerank_puts_text_matches_first() {
        let index = index();
        let mode = RankMode::ClusterRouted { rerank: Some("dog".to_string()) };
        let hits = index.search("cat", &mode, 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "http://dogs");
        assert_eq!(hits[0].snippet.as_deref(), Some("a dog is not a cat"));
        assert_eq!(hits[1].url, "http://cats");
        assert_eq!(hits[1].snippet, None);
    }

    #[test]
    fn no_centroids_means_no_routing() {
        let index = Similarity::new(EmbeddingTable::new(2), Analyzer::default(), Vec::new(), &[]);
        assert_eq!(index.nearest_cluster(array![1.0, 0.0].view()), None);
        assert!(index.rank(array![1.0, 0.0].view(), &RankMode::ClusterRouted { rerank: None }, 5).is_empty());
    }

    #[test]
    fn snippet_is_cut_on_char_boundaries() {
        let text = format!("{}match{}", "я".repeat(200), "ж".repeat(200));
        let cut = snippet(&text, "match").unwrap();
        assert_eq!(cut.chars().count(), 2 * SNIPPET_RADIUS + 5);
        assert!(cut.starts_with('я') && cut.ends_with('ж'));
        assert_eq!(snippet("short text", "text").as_deref(), Some("short text"));
        assert_eq!(snippet("short text", "absent"), None);
    }
}
