// reading and writing of everything a run persists.
// each type knows its own file extension, callers pass paths without one.

use crate::cooccurrence::CoocCache;
use crate::embedding::EmbeddingTable;
use crate::error::PersistError;
use crate::kmeans::Centroid;
use crate::similarity::Document;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub const MODEL_FILE: &str = "model";
pub const CENTROIDS_FILE: &str = "centroids";
pub const DOCUMENTS_FILE: &str = "documents";
pub const COOC_FILE: &str = "cooc";

pub fn read_input<R: ReadFile>(file_path: &str) -> Result<<R as ReadFile>::Item, PersistError> {
    <R as ReadFile>::read_file(file_path)
}

pub fn save_output<S: SaveFile + ?Sized>(output_dir: &str, file_name: &str, item: &S) -> Result<(), PersistError> {

    // create output folder
    fs::create_dir_all(output_dir).map_err(|e| PersistError::io(output_dir, e))?;
    item.save_file(output_dir, file_name)
}

pub trait ReadFile {
    type Item;
    fn read_file(file_path: &str) -> Result<Self::Item, PersistError>;
}

pub trait SaveFile {
    fn save_file(&self, output_dir: &str, file_name: &str) -> Result<(), PersistError>;
}

fn read_json<T: DeserializeOwned>(path: &str) -> Result<T, PersistError> {
    let f = BufReader::new(File::open(path).map_err(|e| PersistError::io(path, e))?);
    serde_json::from_reader(f).map_err(|e| PersistError::malformed(path, e))
}

fn write_json<T: Serialize + ?Sized>(path: &str, item: &T) -> Result<(), PersistError> {
    let mut f = BufWriter::new(File::create(path).map_err(|e| PersistError::io(path, e))?);
    serde_json::to_writer(&mut f, item).map_err(|e| PersistError::codec(path, e))?;
    f.flush().map_err(|e| PersistError::io(path, e))
}

impl ReadFile for EmbeddingTable {
    type Item = Self;
    fn read_file(file_path: &str) -> Result<Self::Item, PersistError> {
        read_json(&format!("{}.json", file_path))
    }
}

impl SaveFile for EmbeddingTable {
    fn save_file(&self, output_dir: &str, file_name: &str) -> Result<(), PersistError> {
        write_json(&format!("{}/{}.json", output_dir, file_name), self)
    }
}

impl ReadFile for Vec<Centroid> {
    type Item = Self;
    fn read_file(file_path: &str) -> Result<Self::Item, PersistError> {
        let path = format!("{}.json", file_path);
        let centroids: Vec<Centroid> = read_json(&path)?;
        if let Some(first) = centroids.first() {
            let dim = first.vector.len();
            if centroids.iter().any(|c| c.vector.len() != dim) {
                return Err(PersistError::malformed(path, "centroids have different dimensions"));
            }
        }
        Ok(centroids)
    }
}

impl SaveFile for [Centroid] {
    fn save_file(&self, output_dir: &str, file_name: &str) -> Result<(), PersistError> {
        write_json(&format!("{}/{}.json", output_dir, file_name), self)
    }
}

impl ReadFile for Vec<Document> {
    type Item = Self;
    fn read_file(file_path: &str) -> Result<Self::Item, PersistError> {
        read_json(&format!("{}.json", file_path))
    }
}

impl SaveFile for [Document] {
    fn save_file(&self, output_dir: &str, file_name: &str) -> Result<(), PersistError> {
        write_json(&format!("{}/{}.json", output_dir, file_name), self)
    }
}

// word -> lemma dictionary, the path is taken as is
impl ReadFile for HashMap<String, String> {
    type Item = Self;
    fn read_file(file_path: &str) -> Result<Self::Item, PersistError> {
        read_json(file_path)
    }
}

// cached counts are bincode encoded and gzip compressed
impl ReadFile for CoocCache {
    type Item = Option<Self>;
    fn read_file(file_path: &str) -> Result<Self::Item, PersistError> {
        let path = format!("{}.bin.gz", file_path);
        if !Path::new(&path).exists() {
            return Ok(None);
        }
        let f = BufReader::new(File::open(&path).map_err(|e| PersistError::io(&path, e))?);
        let reader = GzDecoder::new(f);
        let cache: CoocCache = bincode::deserialize_from(reader).map_err(|e| PersistError::codec(&path, e))?;
        Ok(Some(cache))
    }
}

impl SaveFile for CoocCache {
    fn save_file(&self, output_dir: &str, file_name: &str) -> Result<(), PersistError> {
        let path = format!("{}/{}.bin.gz", output_dir, file_name);
        let f = BufWriter::new(File::create(&path).map_err(|e| PersistError::io(&path, e))?);
        let mut writer = GzEncoder::new(f, Compression::default());
        bincode::serialize_into(&mut writer, self).map_err(|e| PersistError::codec(&path, e))?;
        writer.finish().and_then(|mut f| f.flush()).map_err(|e| PersistError::io(&path, e))
    }
}

/// A crawled page before any vectors are derived from it.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct RawDocument {
    pub url: String,
    // crawler dumps call the page body `content`
    #[serde(alias = "content")]
    pub text: String,
}

/// A corpus is either a JSON array of `{url, text}` objects or plain text, one document
/// per line (urls are then `line:<n>`). The path is taken as is.
impl ReadFile for Vec<RawDocument> {
    type Item = Self;
    fn read_file(file_path: &str) -> Result<Self::Item, PersistError> {
        let raw = fs::read_to_string(file_path).map_err(|e| PersistError::io(file_path, e))?;
        if raw.trim_start().starts_with('[') {
            return serde_json::from_str(&raw).map_err(|e| PersistError::malformed(file_path, e));
        }
        let mut documents = Vec::new();
        for (n, line) in BufReader::new(raw.as_bytes()).lines().enumerate() {
            let line = line.map_err(|e| PersistError::io(file_path, e))?;
            if line.trim().is_empty() { continue }
            documents.push(RawDocument { url: format!("line:{}", n + 1), text: line });
        }
        Ok(documents)
    }
}
