// imports
use crate::config::files_handling::{self, RawDocument, CENTROIDS_FILE, COOC_FILE, DOCUMENTS_FILE, MODEL_FILE};
use crate::config::Params;
use crate::cooccurrence::{CoocCache, Vocabulary};
use crate::embedding::EmbeddingTable;
use crate::error::Result;
use crate::kmeans::{KMeans, KMeansResult};
use crate::similarity::Document;
use crate::text::{strip_markup, Analyzer};
use crate::train::{Train, TrainReport};

use ndarray::Array2;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::time::Instant;
use tracing::{info, warn};

/// What a run produced, mostly for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub documents: usize,
    pub vocabulary: usize,
    pub report: TrainReport,
    pub clusters: usize,
    pub converged: bool,
}

pub struct Pipeline {}

impl Pipeline {

    // runs the whole offline procedure:
    // -> corpus loading and analysis
    // -> co-occurrence counting (or cached counts)
    // -> training, refining the saved model when there is one
    // -> document vectors and clustering
    pub fn run(params: &Params) -> Result<PipelineSummary> {

        info!("using hyper-params: {}", params);
        let pool = ThreadPoolBuilder::new().num_threads(params.num_threads).build()?;
        pool.install(|| Pipeline::run_stages(params))
    }

    fn run_stages(params: &Params) -> Result<PipelineSummary> {

        let timer = Instant::now();
        let analyzer = Analyzer::from_params(params)?;
        let corpus = files_handling::read_input::<Vec<RawDocument>>(&params.corpus_file)?;
        let texts: Vec<&str> = corpus.iter().map(|d| d.text.as_str()).collect();
        let sequences = analyzer.analyze_corpus(&texts);
        info!(documents = corpus.len(), seconds = timer.elapsed().as_secs(), "corpus analyzed");

        // training part
        let timer = Instant::now();
        let existing = if params.refine {
            EmbeddingTable::load(&params.model_path(), params.train.embedding_dim)?
        } else {
            EmbeddingTable::new(params.train.embedding_dim)
        };
        let mut trainer = Train::with_table(params.train.clone(), existing);

        let cached = if params.saved_counts { Pipeline::saved_counts(params, &sequences)? } else { None };
        match cached {
            Some(cache) => {
                info!(words = cache.words.len(), "using saved co-occurrence counts");
                let (vocab, matrix) = cache.restore(params.train.num_shards);
                trainer.with_counts(vocab, matrix)?;
            }
            None => {
                trainer.build_vocabulary(&sequences)?;
                trainer.build_matrix(&sequences)?;
                let cache = CoocCache::new(trainer.vocabulary(), trainer.matrix());
                files_handling::save_output(&params.output_dir, COOC_FILE, &cache)?;
            }
        }
        let vocabulary = trainer.vocabulary().len();

        trainer.initialize()?;
        let report = trainer.train(params.train.max_iter)?;
        let table = trainer.stop()?;
        table.save(&params.output_dir, MODEL_FILE)?;
        info!(seconds = timer.elapsed().as_secs(), "finished training, saved vectors");

        // document vectors and clusters
        let timer = Instant::now();
        let mut documents: Vec<Document> = corpus
            .into_par_iter()
            .map(|raw| {
                let vector = table.encode(&analyzer, &raw.text).to_vec();
                Document { url: raw.url, text: strip_markup(&raw.text), vector, cluster: None }
            })
            .collect();

        let (clusters, converged) = match Pipeline::cluster(params, &documents)? {
            Some(result) => {
                for (doc, cluster) in documents.iter_mut().zip(&result.assignments) {
                    doc.cluster = Some(*cluster);
                }
                files_handling::save_output(&params.output_dir, CENTROIDS_FILE, result.centroids.as_slice())?;
                (result.centroids.len(), result.converged)
            }
            None => (0, false),
        };
        files_handling::save_output(&params.output_dir, DOCUMENTS_FILE, documents.as_slice())?;
        info!(documents = documents.len(), clusters, seconds = timer.elapsed().as_secs(), "documents clustered and saved");

        Ok(PipelineSummary { documents: documents.len(), vocabulary, report, clusters, converged })
    }

    // cached counts only stand in for counting when they were made from this corpus,
    // i.e. the cached words are exactly the vocabulary the corpus builds
    fn saved_counts(params: &Params, sequences: &[Vec<String>]) -> Result<Option<CoocCache>> {
        let cache_path = format!("{}/{}", params.output_dir, COOC_FILE);
        let cache = match files_handling::read_input::<CoocCache>(&cache_path)? {
            Some(cache) => cache,
            None => {
                warn!(path = %cache_path, "no saved co-occurrence counts, counting from the corpus");
                return Ok(None);
            }
        };

        let vocab = Vocabulary::build(sequences);
        if vocab.words() != cache.words.as_slice() {
            warn!(
                path = %cache_path,
                cached = cache.words.len(),
                corpus = vocab.len(),
                "saved co-occurrence counts belong to another corpus, counting again"
            );
            return Ok(None);
        }
        Ok(Some(cache))
    }

    // fewer documents than clusters leaves every document unclustered
    fn cluster(params: &Params, documents: &[Document]) -> Result<Option<KMeansResult>> {
        let dim = params.train.embedding_dim;
        if documents.len() < params.clusters {
            warn!(documents = documents.len(), clusters = params.clusters, "not enough documents to cluster");
            return Ok(None);
        }
        let values: Vec<f64> = documents.iter().flat_map(|d| d.vector.iter().copied()).collect();
        let data = Array2::from_shape_vec((documents.len(), dim), values)
            .map_err(|e| crate::error::PersistError::malformed(&params.output_dir, e))?;
        let mut kmeans = KMeans::new(params.clusters, params.max_cluster_iter, params.train.seed);
        Ok(Some(kmeans.cluster(data.view())?))
    }
}


#[cfg(test)]
mod tests {

    use super::*;
    use crate::config::{Config, TrainParams};
    use crate::similarity::{RankMode, Similarity};
    use std::fs;

    fn write_corpus(dir: &std::path::Path) -> String {
        let corpus = r#"[
            {"url": "http://a", "text": "The cat chased the mouse around the house."},
            {"url": "http://b", "text": "A cat and a kitten slept in the house."},
            {"url": "http://c", "text": "Stocks fell as the market closed lower."},
            {"url": "http://d", "text": "The market rallied and stocks rose."},
            {"url": "http://e", "text": ""}
        ]"#;
        let path = dir.join("corpus.json");
        fs::write(&path, corpus).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn params(dir: &std::path::Path) -> Params {
        Params {
            corpus_file: write_corpus(dir),
            output_dir: dir.join("out").to_str().unwrap().to_string(),
            lemma_file: None,
            saved_counts: false,
            refine: true,
            num_threads: 2,
            clusters: 2,
            max_cluster_iter: 100,
            top_n: 3,
            train: TrainParams { embedding_dim: 6, window_size: 2, max_iter: 5, num_blocks: 3, seed: Some(5), ..TrainParams::default() },
        }
    }

    #[test]
    fn full_run_writes_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let params = params(dir.path());
        let summary = Pipeline::run(&params).unwrap();

        assert_eq!(summary.documents, 5);
        assert_eq!(summary.clusters, 2);
        assert_eq!(summary.report.iterations_run, 5);
        for file in ["model.json", "centroids.json", "documents.json", "cooc.bin.gz"] {
            assert!(dir.path().join("out").join(file).exists(), "{} missing", file);
        }

        let index = Similarity::open(&params).unwrap();
        assert_eq!(index.documents().len(), 5);
        assert!(index.documents().iter().all(|d| d.vector.len() == 6 && d.cluster.map_or(false, |c| c < 2)));

        let hits = index.search("cat", &RankMode::WholeCorpus, 3);
        assert_eq!(hits.len(), 3);
        assert!(index.nearest_cluster(index.encode("market").view()).is_some());
    }

    #[test]
    fn second_run_reuses_counts_and_refines() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = params(dir.path());
        let first = Pipeline::run(&params).unwrap();

        params.saved_counts = true;
        let second = Pipeline::run(&params).unwrap();
        assert_eq!(second.vocabulary, first.vocabulary);
        assert!((second.report.loss_before - first.report.loss_after).abs() < 1e-9);
    }

    #[test]
    fn counts_of_another_corpus_are_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = params(dir.path());
        let first = Pipeline::run(&params).unwrap();

        let other = dir.path().join("other.txt");
        fs::write(&other, "<h1>zebras graze</h1> on open plains\nlions hunt zebras on plains\n").unwrap();
        params.corpus_file = other.to_str().unwrap().to_string();
        params.saved_counts = true;
        params.refine = false;
        let second = Pipeline::run(&params).unwrap();

        assert_ne!(second.vocabulary, first.vocabulary);
        let cache = files_handling::read_input::<CoocCache>(&format!("{}/{}", params.output_dir, COOC_FILE)).unwrap().unwrap();
        assert!(cache.words.contains(&"zebras".to_string()));
        assert!(!cache.words.contains(&"h1".to_string()));

        let documents = files_handling::read_input::<Vec<Document>>(&format!("{}/{}", params.output_dir, DOCUMENTS_FILE)).unwrap();
        assert_eq!(documents[0].text, " zebras graze  on open plains");
    }

    #[test]
    fn config_file_drives_a_run() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = write_corpus(dir.path());
        let out = dir.path().join("out");
        let config = dir.path().join("config.json");
        fs::write(&config, format!(
            r#"{{"corpus_file": {:?}, "output_dir": {:?}, "embedding_dim": 4, "max_iter": 2, "clusters": 3, "seed": 1}}"#,
            corpus, out.to_str().unwrap()
        )).unwrap();

        let args = vec!["glove_search".to_string(), config.to_str().unwrap().to_string()];
        let params = Config::new(&args).unwrap().get_params();
        let summary = Pipeline::run(&params).unwrap();
        assert_eq!(summary.clusters, 3);
    }
}
