// imports
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Distinct lemmas of a corpus, with dense ids assigned in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vocabulary {
    words: Vec<String>,
    t2i: HashMap<String, usize>,
}

impl Vocabulary {

    pub fn build(sequences: &[Vec<String>]) -> Self {
        let mut vocab = Self::default();
        for tok in sequences.iter().flatten() {
            if !vocab.t2i.contains_key(tok) {
                vocab.t2i.insert(tok.to_owned(), vocab.words.len());
                vocab.words.push(tok.to_owned());
            }
        }
        vocab
    }

    /// Rebuilds a vocabulary from words already in id order.
    pub fn from_words(words: Vec<String>) -> Self {
        let t2i = words.iter().enumerate().map(|(i, w)| (w.to_owned(), i)).collect();
        Self { words, t2i }
    }

    pub fn id(&self, token: &str) -> Option<usize> {
        self.t2i.get(token).copied()
    }

    pub fn word(&self, id: usize) -> Option<&str> {
        self.words.get(id).map(String::as_str)
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// One stored cell of the co-occurrence matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoEntry {
    pub i: usize,
    pub j: usize,
    pub count: u32,
}

type Shard = HashMap<(usize, usize), u32>;

/// Symmetric sparse count matrix keyed by ordered id pairs.
///
/// Cells live in `min(i, j) % shards` so both halves of a mirrored pair sit behind the
/// same lock, and an increment updates them together. Absent cells read as 0 and the
/// diagonal is never stored.
pub struct SparseCoMatrix {
    shards: Vec<Mutex<Shard>>,
}

impl Default for SparseCoMatrix {
    fn default() -> Self {
        Self::with_shards(1)
    }
}

impl SparseCoMatrix {

    pub fn with_shards(num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self { shards }
    }

    fn shard(&self, i: usize, j: usize) -> &Mutex<Shard> {
        &self.shards[i.min(j) % self.shards.len()]
    }

    pub fn get(&self, i: usize, j: usize) -> u32 {
        self.shard(i, j).lock().get(&(i, j)).copied().unwrap_or(0)
    }

    /// Adds one to (i, j) and (j, i) under a single lock. Diagonal pairs are ignored.
    pub fn increment(&self, i: usize, j: usize) {
        if i == j {
            return;
        }
        let mut shard = self.shard(i, j).lock();
        *shard.entry((i, j)).or_insert(0) += 1;
        *shard.entry((j, i)).or_insert(0) += 1;
    }

    /// Overwrites both halves of a pair, used when restoring cached counts.
    pub fn set(&self, i: usize, j: usize, count: u32) {
        if i == j {
            return;
        }
        let mut shard = self.shard(i, j).lock();
        if count == 0 {
            shard.remove(&(i, j));
            shard.remove(&(j, i));
        } else {
            shard.insert((i, j), count);
            shard.insert((j, i), count);
        }
    }

    /// Largest stored count, 0 for an empty matrix.
    ///
    /// Only meaningful once accumulation is over, which holds whenever the caller owns
    /// the matrix returned by [`Counts::count`].
    pub fn max(&self) -> u32 {
        self.shards.iter().map(|shard| shard.lock().values().copied().max().unwrap_or(0)).max().unwrap_or(0)
    }

    /// Number of stored cells, both halves of each pair included.
    pub fn nnz(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// All stored cells, both halves included, sorted by (i, j).
    pub fn entries(&self) -> Vec<CoEntry> {
        let mut entries: Vec<CoEntry> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard.lock().iter().map(|(&(i, j), &count)| CoEntry { i, j, count }).collect::<Vec<_>>()
            })
            .collect();
        entries.sort_unstable_by_key(|e| (e.i, e.j));
        entries
    }

    /// The upper triangle (i < j) only, enough to rebuild the matrix with [`SparseCoMatrix::set`].
    pub fn upper_entries(&self) -> Vec<CoEntry> {
        self.entries().into_iter().filter(|e| e.i < e.j).collect()
    }

    pub fn from_entries(entries: &[CoEntry], num_shards: usize) -> Self {
        let matrix = Self::with_shards(num_shards);
        for e in entries {
            matrix.set(e.i, e.j, e.count);
        }
        matrix
    }
}

pub struct Counts {}

impl Counts {

    // slides a window over one lemma sequence, pairs are (i, j) for j in (i, i + window_size].
    // positions of a single document are counted in parallel as well, every increment is
    // atomic for the mirrored pair so the shared matrix needs no further coordination.
    fn count_sequence(window_size: usize, sequence: &[String], vocab: &Vocabulary, matrix: &SparseCoMatrix) {

        let ids: Vec<Option<usize>> = sequence.iter().map(|tok| vocab.id(tok)).collect();
        let n = ids.len();

        (0..n).into_par_iter().for_each(|i| {
            let token_i = match ids[i] {
                Some(token_i) => token_i,
                None => return,
            };
            for j in i + 1..=i + window_size {
                if j >= n { break }
                if let Some(context_j) = ids[j] {
                    matrix.increment(token_i, context_j);
                }
            }
        });
    }

    /// Counts windowed co-occurrences over every sequence, documents in parallel.
    ///
    /// Sequences shorter than the window (or empty) simply contribute fewer pairs.
    pub fn count(window_size: usize, sequences: &[Vec<String>], vocab: &Vocabulary, num_shards: usize) -> SparseCoMatrix {

        let matrix = SparseCoMatrix::with_shards(num_shards);
        sequences.par_iter().enumerate().for_each(|(k, sequence)| {
            if k > 0 && k % 10_000 == 0 {
                debug!(documents = k, "counting co-occurrences");
            }
            Counts::count_sequence(window_size, sequence, vocab, &matrix);
        });

        info!(vocab = vocab.len(), cells = matrix.nnz(), max = matrix.max(), "co-occurrence counting done");
        matrix
    }
}

/// Cached counts, what `saved_counts` reloads instead of re-walking the corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoocCache {
    pub words: Vec<String>,
    pub entries: Vec<CoEntry>,
}

impl CoocCache {

    pub fn new(vocab: &Vocabulary, matrix: &SparseCoMatrix) -> Self {
        Self { words: vocab.words().to_vec(), entries: matrix.upper_entries() }
    }

    pub fn restore(self, num_shards: usize) -> (Vocabulary, SparseCoMatrix) {
        let matrix = SparseCoMatrix::from_entries(&self.entries, num_shards);
        (Vocabulary::from_words(self.words), matrix)
    }
}
