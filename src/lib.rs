mod config;
mod cooccurrence;
mod embedding;
mod error;
mod kmeans;
mod pipeline;
mod similarity;
mod text;
mod train;

pub use config::{files_handling, Config, Params, TrainParams};
pub use cooccurrence::{CoEntry, CoocCache, Counts, SparseCoMatrix, Vocabulary};
pub use embedding::EmbeddingTable;
pub use error::{ClusterError, ConfigError, Error, PersistError, Result, TrainError};
pub use kmeans::{nearest_centroid, Centroid, KMeans, KMeansResult};
pub use pipeline::{Pipeline, PipelineSummary};
pub use similarity::{cosine, DISSIMILAR, euclidean, squared_euclidean, Document, Hit, RankMode, Similarity};
pub use text::{strip_markup, Analyzer, DictionaryLemmatizer, IdentityLemmatizer, Lemmatizer, PunctuationTokenizer, Tokenizer};
pub use train::{TrainReport, TrainStage, Train};
