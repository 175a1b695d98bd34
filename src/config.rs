pub mod files_handling;

use crate::error::ConfigError;

use serde::Deserialize;
use std::fmt::Display;
use std::fs;
use std::path::PathBuf;

/// Hyper parameters of the embedding trainer.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainParams {
    pub embedding_dim: usize,
    pub window_size: usize,
    pub learning_rate: f64,
    pub alpha: f64,
    pub max_iter: usize,
    /// Contiguous id ranges the gradient schedule splits the vocabulary into.
    pub num_blocks: usize,
    /// Lock shards of the co-occurrence matrix.
    pub num_shards: usize,
    /// Pairs sampled to report the loss.
    pub loss_sample: usize,
    /// Stop early once the sampled loss improves by less than this.
    pub tolerance: Option<f64>,
    pub seed: Option<u64>,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            embedding_dim: 50,
            window_size: 2,
            learning_rate: 0.01,
            alpha: 0.75,
            max_iter: 30,
            num_blocks: 8,
            num_shards: 16,
            loss_sample: 10_000,
            tolerance: None,
            seed: None,
        }
    }
}

impl Display for TrainParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "embedding_dim: {}, window_size: {}, learning_rate: {}, alpha: {}, max_iter: {}, num_blocks: {}, num_shards: {}, loss_sample: {}, tolerance: {:?}, seed: {:?}",
        self.embedding_dim, self.window_size, self.learning_rate, self.alpha, self.max_iter, self.num_blocks, self.num_shards, self.loss_sample, self.tolerance, self.seed
        )
    }
}

/// Everything a pipeline run needs, read from one flat JSON object.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Params {
    pub corpus_file: String,
    pub output_dir: String,
    #[serde(default)]
    pub lemma_file: Option<String>,
    #[serde(default)]
    pub saved_counts: bool,
    #[serde(default = "default_true")]
    pub refine: bool,
    #[serde(default)]
    pub num_threads: usize,
    #[serde(default = "default_clusters")]
    pub clusters: usize,
    #[serde(default = "default_max_cluster_iter")]
    pub max_cluster_iter: usize,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(flatten)]
    pub train: TrainParams,
}

fn default_true() -> bool { true }
fn default_clusters() -> usize { 8 }
fn default_max_cluster_iter() -> usize { 300 }
fn default_top_n() -> usize { 10 }

impl Display for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "corpus_file: {}, output_dir: {}, lemma_file: {:?}, saved_counts: {}, refine: {}, num_threads: {}, clusters: {}, max_cluster_iter: {}, top_n: {}, training: [{}]",
        self.corpus_file, self.output_dir, self.lemma_file, self.saved_counts, self.refine, self.num_threads, self.clusters, self.max_cluster_iter, self.top_n, self.train)
    }
}

impl Params {

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| Err(ConfigError::Invalid { field, reason: reason.to_string() });
        if self.train.embedding_dim == 0 { return invalid("embedding_dim", "must be positive") }
        if self.train.window_size == 0 { return invalid("window_size", "must be positive") }
        if !(self.train.learning_rate > 0.0) { return invalid("learning_rate", "must be positive") }
        if self.train.num_blocks == 0 { return invalid("num_blocks", "must be positive") }
        if self.clusters == 0 { return invalid("clusters", "must be positive") }
        if matches!(self.train.tolerance, Some(t) if t < 0.0) { return invalid("tolerance", "must not be negative") }
        Ok(())
    }

    pub fn model_path(&self) -> String {
        format!("{}/{}", self.output_dir, files_handling::MODEL_FILE)
    }
}

pub struct Config {
    params: Params
}

impl Config {

    pub fn get_params(&self) -> Params {
        self.params.clone()
    }

    /// `args` are the process arguments, the only one expected is the path to the JSON config.
    pub fn new(args: &[String]) -> Result<Config, ConfigError> {

        if args.len() != 2 {
            return Err(ConfigError::Usage("input should be a path to json file only".to_string()));
        }
        Self::from_file(&args[1])
    }

    pub fn from_file(path: &str) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io { path: PathBuf::from(path), source })?;
        Self::from_json(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path: PathBuf::from(path), source },
            other => other,
        })
    }

    pub fn from_json(raw: &str) -> Result<Config, ConfigError> {
        let params: Params = serde_json::from_str(raw).map_err(|source| ConfigError::Parse { path: PathBuf::new(), source })?;
        params.validate()?;
        Ok(Self { params })
    }
}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let params = Config::from_json(r#"{"corpus_file": "c.json", "output_dir": "out"}"#).unwrap().get_params();
        assert_eq!(params.train, TrainParams::default());
        assert_eq!(params.clusters, 8);
        assert!(params.refine);
        assert!(!params.saved_counts);
        assert_eq!(params.model_path(), "out/model");
    }

    #[test]
    fn flat_training_fields_are_read() {
        let raw = r#"{"corpus_file": "c", "output_dir": "o", "embedding_dim": 300, "window_size": 20, "seed": 3, "tolerance": 0.001}"#;
        let params = Config::from_json(raw).unwrap().get_params();
        assert_eq!(params.train.embedding_dim, 300);
        assert_eq!(params.train.window_size, 20);
        assert_eq!(params.train.seed, Some(3));
        assert_eq!(params.train.tolerance, Some(0.001));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let raw = r#"{"corpus_file": "c", "output_dir": "o", "embedding_dim": 0}"#;
        assert!(matches!(Config::from_json(raw), Err(ConfigError::Invalid { field: "embedding_dim", .. })));
        let raw = r#"{"corpus_file": "c", "output_dir": "o", "learning_rate": -1.0}"#;
        assert!(matches!(Config::from_json(raw), Err(ConfigError::Invalid { field: "learning_rate", .. })));
        assert!(matches!(Config::from_json(r#"{"output_dir": "o"}"#), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn wrong_argument_count_is_a_usage_error() {
        let args = vec!["bin".to_string()];
        assert!(matches!(Config::new(&args), Err(ConfigError::Usage(_))));
    }
}
