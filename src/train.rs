use crate::config::TrainParams;
use crate::cooccurrence::{CoEntry, Counts, SparseCoMatrix, Vocabulary};
use crate::embedding::EmbeddingTable;
use crate::error::TrainError;

use ndarray::prelude::*;
use ndarray::Array;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

/// Where a trainer is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainStage {
    Uninitialized,
    VocabularyBuilt,
    MatrixBuilt,
    Initialized,
    /// Total number of iterations run so far.
    Training(usize),
    Stopped,
}

/// Outcome of one [`Train::train`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainReport {
    pub iterations_run: usize,
    pub loss_before: f64,
    pub loss_after: f64,
    pub stopped_early: bool,
}

// (C / C_max) ^ alpha, capped at 1
fn weighting_x(x: f64, x_max: f64, alpha: f64) -> f64 {
    if x < x_max {
        (x / x_max).powf(alpha)
    } else {
        1.0
    }
}

/// Splits the vocabulary into contiguous id ranges and groups range pairs into waves.
///
/// Within a wave every range appears in at most one block, so blocks can update their
/// rows in parallel. Every unordered range pair, the diagonal included, is in exactly
/// one wave.
#[derive(Debug, Clone, PartialEq)]
struct Schedule {
    range_len: usize,
    waves: Vec<Vec<(usize, usize)>>,
    blocks: HashMap<(usize, usize), Vec<CoEntry>>,
}

impl Schedule {

    fn new(vocab_size: usize, num_blocks: usize, entries: Vec<CoEntry>) -> Self {

        let num_blocks = num_blocks.max(1);
        let range_len = ((vocab_size + num_blocks - 1) / num_blocks).max(1);
        let num_ranges = ((vocab_size + range_len - 1) / range_len).max(1);

        let mut blocks: HashMap<(usize, usize), Vec<CoEntry>> = HashMap::new();
        for entry in entries {
            let (a, b) = (entry.i / range_len, entry.j / range_len);
            blocks.entry((a.min(b), a.max(b))).or_default().push(entry);
        }

        Self { range_len, waves: Schedule::round_robin(num_ranges), blocks }
    }

    // circle method: the last player stays put while the others rotate, an odd count
    // gets a dummy player whose pairs are dropped. the diagonal blocks close the list.
    fn round_robin(num_ranges: usize) -> Vec<Vec<(usize, usize)>> {
        let players = num_ranges + num_ranges % 2;
        let rotating = players - 1;
        let mut waves = Vec::new();

        for round in 0..rotating {
            let mut wave = vec![(round, rotating)];
            for k in 1..players / 2 {
                let a = (round + k) % rotating;
                let b = (round + rotating - k) % rotating;
                wave.push((a.min(b), a.max(b)));
            }
            wave.retain(|&(a, b)| a < num_ranges && b < num_ranges);
            if !wave.is_empty() {
                waves.push(wave);
            }
        }

        waves.push((0..num_ranges).map(|r| (r, r)).collect());
        waves
    }
}

/// Rows a block may touch: one range, or two disjoint ones.
struct Block<'a> {
    lo_start: usize,
    lo: ArrayViewMut2<'a, f64>,
    hi_start: usize,
    hi: Option<ArrayViewMut2<'a, f64>>,
    entries: &'a [CoEntry],
}

impl<'a> Block<'a> {

    fn row(&self, id: usize) -> Option<ArrayView1<'_, f64>> {
        if id >= self.lo_start && id - self.lo_start < self.lo.nrows() {
            return Some(self.lo.row(id - self.lo_start));
        }
        let start = self.hi_start;
        self.hi.as_ref().filter(|hi| id >= start && id - start < hi.nrows()).map(|hi| hi.row(id - start))
    }

    fn row_mut(&mut self, id: usize) -> Option<ArrayViewMut1<'_, f64>> {
        if id >= self.lo_start && id - self.lo_start < self.lo.nrows() {
            return Some(self.lo.row_mut(id - self.lo_start));
        }
        let start = self.hi_start;
        self.hi.as_mut().filter(|hi| id >= start && id - start < hi.nrows()).map(|hi| hi.row_mut(id - start))
    }

    // plain sgd, each pair updates both rows immediately so later pairs see the change
    fn descend(&mut self, learning_rate: f64, x_max: f64, alpha: f64) {
        let entries = self.entries;
        for entry in entries {
            let (v_tok, v_context) = match (self.row(entry.i), self.row(entry.j)) {
                (Some(a), Some(b)) => (a.to_owned(), b.to_owned()),
                _ => continue,
            };
            let x = entry.count as f64;
            let diff = v_tok.dot(&v_context) - x.ln();
            let step = learning_rate * weighting_x(x, x_max, alpha) * diff;

            if let Some(mut row) = self.row_mut(entry.i) {
                row.scaled_add(-step, &v_context);
            }
            if let Some(mut row) = self.row_mut(entry.j) {
                row.scaled_add(-step, &v_tok);
            }
        }
    }
}

/// GloVe style trainer without bias terms.
///
/// The stages have to be walked in order: vocabulary, matrix, initialization, then any
/// number of `train` calls, and finally `stop`.
pub struct Train {
    params: TrainParams,
    stage: TrainStage,
    vocab: Vocabulary,
    matrix: SparseCoMatrix,
    schedule: Option<Schedule>,
    x_max: f64,
    probe: Vec<CoEntry>,
    w: Array2<f64>,
    prior: Option<EmbeddingTable>,
    rng: StdRng,
}

impl Train {

    pub fn new(params: TrainParams) -> Train {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            w: Array2::zeros((0, params.embedding_dim)),
            params,
            stage: TrainStage::Uninitialized,
            vocab: Vocabulary::default(),
            matrix: SparseCoMatrix::default(),
            schedule: None,
            x_max: 0.0,
            probe: Vec::new(),
            prior: None,
            rng,
        }
    }

    /// A trainer that refines `table`: words it already knows keep their vectors
    /// instead of being initialized at random.
    pub fn with_table(params: TrainParams, table: EmbeddingTable) -> Train {
        let mut trainer = Train::new(params);
        if !table.is_empty() {
            trainer.prior = Some(table);
        }
        trainer
    }

    pub fn stage(&self) -> TrainStage {
        self.stage
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn matrix(&self) -> &SparseCoMatrix {
        &self.matrix
    }

    fn expect_stage(&self, expected: &'static str, ok: bool) -> Result<(), TrainError> {
        if ok {
            Ok(())
        } else {
            Err(TrainError::InvalidState { expected, found: self.stage })
        }
    }

    pub fn build_vocabulary(&mut self, sequences: &[Vec<String>]) -> Result<(), TrainError> {
        self.expect_stage("Uninitialized", self.stage == TrainStage::Uninitialized)?;
        let vocab = Vocabulary::build(sequences);
        if vocab.is_empty() {
            return Err(TrainError::EmptyCorpus);
        }
        info!(words = vocab.len(), documents = sequences.len(), "vocabulary built");
        self.vocab = vocab;
        self.stage = TrainStage::VocabularyBuilt;
        Ok(())
    }

    pub fn build_matrix(&mut self, sequences: &[Vec<String>]) -> Result<(), TrainError> {
        self.expect_stage("VocabularyBuilt", self.stage == TrainStage::VocabularyBuilt)?;
        self.matrix = Counts::count(self.params.window_size, sequences, &self.vocab, self.params.num_shards);
        self.stage = TrainStage::MatrixBuilt;
        Ok(())
    }

    /// Skips counting with a vocabulary and matrix built earlier (cached counts).
    pub fn with_counts(&mut self, vocab: Vocabulary, matrix: SparseCoMatrix) -> Result<(), TrainError> {
        self.expect_stage("Uninitialized", self.stage == TrainStage::Uninitialized)?;
        if vocab.is_empty() {
            return Err(TrainError::EmptyCorpus);
        }
        self.vocab = vocab;
        self.matrix = matrix;
        self.stage = TrainStage::MatrixBuilt;
        Ok(())
    }

    /// Draws the random starting vectors and freezes the pair schedule.
    pub fn initialize(&mut self) -> Result<(), TrainError> {
        self.expect_stage("MatrixBuilt", self.stage == TrainStage::MatrixBuilt)?;

        let dim = self.params.embedding_dim;
        let vocab_size = self.vocab.len();

        // the prior stays in place on error so a retry fails the same way
        if let Some(prior) = self.prior.as_ref().filter(|prior| prior.dim() != dim) {
            let word = prior.words().first().cloned().unwrap_or_default();
            return Err(TrainError::DimensionMismatch { word, expected: dim, actual: prior.dim() });
        }
        self.w = Array::random_using((vocab_size, dim), Uniform::new(-0.5, 0.5), &mut self.rng) / dim as f64;

        if let Some(prior) = self.prior.take() {
            let mut kept = 0usize;
            for (i, word) in self.vocab.words().iter().enumerate() {
                if let Some(vec) = prior.get(word) {
                    self.w.row_mut(i).assign(&vec);
                    kept += 1;
                }
            }
            info!(kept, new = vocab_size - kept, "refining existing vectors");
        }

        let entries = self.matrix.entries();
        self.x_max = self.matrix.max() as f64;
        self.probe = if entries.len() > self.params.loss_sample {
            sample(&mut self.rng, entries.len(), self.params.loss_sample).into_iter().map(|k| entries[k]).collect()
        } else {
            entries.clone()
        };

        let schedule = Schedule::new(vocab_size, self.params.num_blocks, entries);
        debug!(waves = schedule.waves.len(), range_len = schedule.range_len, blocks = schedule.blocks.len(), "pair schedule ready");
        self.schedule = Some(schedule);
        self.stage = TrainStage::Initialized;
        Ok(())
    }

    /// Mean of `0.5 * (v_i . v_j - ln C)^2` over the sampled pairs.
    pub fn sampled_loss(&self) -> f64 {
        if self.probe.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .probe
            .par_iter()
            .map(|e| {
                let diff = self.w.row(e.i).dot(&self.w.row(e.j)) - (e.count as f64).ln();
                0.5 * diff * diff
            })
            .sum();
        total / self.probe.len() as f64
    }

    // one pass over every stored pair, wave by wave. the end of each wave is the barrier:
    // rayon's for_each returns only once every block of the wave is done.
    fn epoch(&mut self) {
        let schedule = match &self.schedule {
            Some(schedule) => schedule,
            None => return,
        };
        let (learning_rate, alpha, x_max) = (self.params.learning_rate, self.params.alpha, self.x_max);
        let range_len = schedule.range_len;

        for wave in &schedule.waves {
            let mut chunks: Vec<Option<ArrayViewMut2<f64>>> =
                self.w.axis_chunks_iter_mut(Axis(0), range_len).map(Some).collect();

            let mut blocks: Vec<Block> = Vec::with_capacity(wave.len());
            for &(a, b) in wave {
                let entries = match schedule.blocks.get(&(a, b)) {
                    Some(entries) if !entries.is_empty() => entries,
                    _ => continue,
                };
                let lo = match chunks.get_mut(a).and_then(Option::take) {
                    Some(lo) => lo,
                    None => continue,
                };
                let hi = if a == b { None } else { chunks.get_mut(b).and_then(Option::take) };
                blocks.push(Block { lo_start: a * range_len, lo, hi_start: b * range_len, hi, entries });
            }

            blocks.into_par_iter().for_each(|mut block| block.descend(learning_rate, x_max, alpha));
        }
    }

    /// Runs `iterations` passes, or fewer when a tolerance is configured and the loss
    /// stops improving by at least that much.
    pub fn train(&mut self, iterations: usize) -> Result<TrainReport, TrainError> {
        let done = match self.stage {
            TrainStage::Initialized => 0,
            TrainStage::Training(done) => done,
            found => return Err(TrainError::InvalidState { expected: "Initialized or Training", found }),
        };

        let loss_before = self.sampled_loss();
        let mut last_loss = loss_before;
        let mut iterations_run = 0;
        let mut stopped_early = false;
        info!(iterations, loss = loss_before, "starting training");

        for epoch in 0..iterations {
            let timer = Instant::now();
            self.epoch();
            iterations_run += 1;
            self.stage = TrainStage::Training(done + iterations_run);

            if let Some(tolerance) = self.params.tolerance {
                let loss = self.sampled_loss();
                debug!(epoch, loss, elapsed_ms = timer.elapsed().as_millis() as u64, "finished epoch");
                if last_loss - loss < tolerance {
                    stopped_early = epoch + 1 < iterations;
                    last_loss = loss;
                    break;
                }
                last_loss = loss;
            } else {
                debug!(epoch, elapsed_ms = timer.elapsed().as_millis() as u64, "finished epoch");
            }
        }

        if self.stage == TrainStage::Initialized {
            self.stage = TrainStage::Training(done);
        }
        let loss_after = if self.params.tolerance.is_some() && iterations_run > 0 { last_loss } else { self.sampled_loss() };
        info!(iterations_run, loss_before, loss_after, stopped_early, "training finished");

        Ok(TrainReport { iterations_run, loss_before, loss_after, stopped_early })
    }

    /// The current vectors as a table, training can continue afterwards.
    pub fn snapshot(&self) -> Result<EmbeddingTable, TrainError> {
        self.expect_stage("Initialized or Training", matches!(self.stage, TrainStage::Initialized | TrainStage::Training(_)))?;
        Ok(EmbeddingTable::from_parts(self.vocab.words().to_vec(), self.w.clone()))
    }

    /// Ends training, releasing the vocabulary and counts.
    pub fn stop(&mut self) -> Result<EmbeddingTable, TrainError> {
        self.expect_stage("Initialized or Training", matches!(self.stage, TrainStage::Initialized | TrainStage::Training(_)))?;
        let words = std::mem::take(&mut self.vocab).words().to_vec();
        let w = std::mem::replace(&mut self.w, Array2::zeros((0, self.params.embedding_dim)));
        self.matrix = SparseCoMatrix::default();
        self.schedule = None;
        self.probe.clear();
        self.stage = TrainStage::Stopped;
        Ok(EmbeddingTable::from_parts(words, w))
    }
}
