use crate::config::files_handling;
use crate::error::PersistError;
use crate::text::Analyzer;

use ndarray::prelude::*;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Trained lemma vectors, one row of `dim` values per word.
///
/// Persisted as a single JSON object `{ lemma: [f64; dim] }`, rows written in id order.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    words: Vec<String>,
    t2i: HashMap<String, usize>,
    w: Array2<f64>,
}

impl EmbeddingTable {

    pub fn new(dim: usize) -> Self {
        Self { words: Vec::new(), t2i: HashMap::new(), w: Array2::zeros((0, dim)) }
    }

    /// `words[k]` owns row `k` of `w`. Duplicate words keep their first row.
    pub fn from_parts(words: Vec<String>, w: Array2<f64>) -> Self {
        debug_assert_eq!(words.len(), w.nrows(), "inconsistent number of words and rows");
        let mut t2i = HashMap::with_capacity(words.len());
        for (i, word) in words.iter().enumerate() {
            t2i.entry(word.to_owned()).or_insert(i);
        }
        Self { words, t2i, w }
    }

    pub fn dim(&self) -> usize {
        self.w.ncols()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn vectors(&self) -> ArrayView2<'_, f64> {
        self.w.view()
    }

    pub fn get(&self, lemma: &str) -> Option<ArrayView1<'_, f64>> {
        self.t2i.get(lemma).map(|i| self.w.row(*i))
    }

    /// Average of the vectors of every known lemma in `text`.
    ///
    /// Unknown lemmas are skipped; a text with no known lemma encodes to the zero vector.
    pub fn encode(&self, analyzer: &Analyzer, text: &str) -> Array1<f64> {
        let mut sum: Array1<f64> = Array1::zeros(self.dim());
        let mut found = 0usize;
        for lemma in analyzer.lemmas(text) {
            if let Some(vec) = self.get(&lemma) {
                sum += &vec;
                found += 1;
            }
        }
        if found > 0 {
            sum /= found as f64;
        }
        sum
    }

    /// The `k` words whose vectors have the highest cosine similarity with `vec`.
    pub fn most_similar(&self, vec: ArrayView1<f64>, k: usize) -> Vec<(String, f64)> {
        let mut indexed_scores: Vec<(usize, f64)> = self
            .w
            .outer_iter()
            .map(|row| crate::similarity::cosine(row, vec))
            .enumerate()
            .collect();

        // sort by most similar in descending order
        indexed_scores.sort_by(|(_i, s), (_j, t)| t.total_cmp(s));
        indexed_scores.truncate(k);
        indexed_scores.into_iter().map(|(i, score)| (self.words[i].to_owned(), score)).collect()
    }

    /// Loads `<path_stem>.json`; a missing file yields an empty table of dimension `dim`.
    pub fn load(path_stem: &str, dim: usize) -> Result<Self, PersistError> {
        let path = format!("{}.json", path_stem);
        if !Path::new(&path).exists() {
            warn!(path = %path, "no embedding table found, starting from an empty one");
            return Ok(Self::new(dim));
        }

        let table = files_handling::read_input::<EmbeddingTable>(path_stem)?;
        if table.is_empty() {
            return Ok(Self::new(dim));
        }
        if table.dim() != dim {
            return Err(PersistError::malformed(path, format!("vectors have {} dimensions, expected {}", table.dim(), dim)));
        }
        info!(words = table.len(), dim, "loaded embedding table");
        Ok(table)
    }

    pub fn save(&self, output_dir: &str, file_name: &str) -> Result<(), PersistError> {
        files_handling::save_output(output_dir, file_name, self)
    }
}

impl Serialize for EmbeddingTable {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer {

            let mut map = serializer.serialize_map(Some(self.words.len()))?;
            for (word, row) in self.words.iter().zip(self.w.outer_iter()) {
                map.serialize_entry(word, &row.to_vec())?;
            }
            map.end()
    }
}

struct TableVisitor;

impl<'de> Visitor<'de> for TableVisitor {

    type Value = EmbeddingTable;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map from lemma to an array of numbers of equal length")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>, {

                let mut words: Vec<String> = Vec::new();
                let mut values: Vec<f64> = Vec::new();
                let mut dim: Option<usize> = None;

                while let Some((word, row)) = access.next_entry::<String, Vec<f64>>()? {
                    match dim {
                        None => dim = Some(row.len()),
                        Some(d) if d != row.len() => {
                            return Err(serde::de::Error::custom(format!(
                                "'{}' has {} dimensions, previous rows have {}", word, row.len(), d
                            )));
                        }
                        Some(_) => {}
                    }
                    words.push(word);
                    values.extend(row);
                }

                let dim = dim.unwrap_or(0);
                let w = Array2::from_shape_vec((words.len(), dim), values).map_err(serde::de::Error::custom)?;
                Ok(EmbeddingTable::from_parts(words, w))
    }
}

impl<'de> Deserialize<'de> for EmbeddingTable {

    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de> {
            deserializer.deserialize_map(TableVisitor)
    }
}
