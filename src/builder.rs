//! Genome x k-mer matrix assembly
//!
//! Runs the vocabulary count once, then counts and resolves every genome in
//! list order, appending one CSR row per genome. Any oracle failure aborts
//! the build; a genome without vocabulary k-mers yields an empty row.

use crate::config::{MAX_KMER_SIZE, MIN_KMER_SIZE};
use crate::csr::{CsrAccumulator, CsrMatrix};
use crate::error::{KmxError, Result};
use crate::genome_list::GenomeList;
use crate::logging::{time_operation, MetricsCollector, ProgressReporter};
use crate::oracle::KmerCounter;
use crate::resolver::FrequencyResolver;
use crate::sparsity::{SparsityReport, SparsityTracker, DEFAULT_DENSITY};
use crate::vocabulary::{Vocabulary, VocabularyBuilder, VocabularyParams};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Parameters of one matrix build
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatrixParams {
    pub kmer_size: usize,
    pub min_count: u64,
    pub max_count: u64,
    /// Fold reverse complements together
    pub normalize: bool,
    pub initial_density: f64,
    pub progress_interval: usize,
}

impl MatrixParams {
    pub fn new(kmer_size: usize, min_count: u64, max_count: u64) -> Self {
        Self {
            kmer_size,
            min_count,
            max_count,
            normalize: true,
            initial_density: DEFAULT_DENSITY,
            progress_interval: 1000,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_KMER_SIZE..=MAX_KMER_SIZE).contains(&self.kmer_size) {
            return Err(KmxError::invalid_kmer_length(self.kmer_size, MIN_KMER_SIZE, MAX_KMER_SIZE));
        }
        if self.max_count < self.min_count {
            return Err(KmxError::InvalidThresholds {
                min: self.min_count,
                max: self.max_count,
            });
        }
        if !(self.initial_density > 0.0 && self.initial_density <= 1.0) {
            return Err(KmxError::config(format!(
                "Initial density must be in (0, 1], got {}",
                self.initial_density
            )));
        }
        if self.progress_interval == 0 {
            return Err(KmxError::config("Progress interval must be at least 1"));
        }
        Ok(())
    }

    /// `k{k}_min{min}_max{max}_d{0|1}`, shared by every output file name
    pub fn file_suffix(&self) -> String {
        format!(
            "k{}_min{}_max{}_d{}",
            self.kmer_size,
            self.min_count,
            self.max_count,
            if self.normalize { 0 } else { 1 }
        )
    }
}

/// Everything a finished build produces
#[derive(Debug, Clone)]
pub struct MatrixBuild {
    pub matrix: CsrMatrix,
    pub vocabulary: Vocabulary,
    pub sparsity: SparsityReport,
    pub stats: BuildStats,
}

/// Diagnostics collected while building
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildStats {
    pub genomes: usize,
    pub vocabulary_size: usize,
    pub initial_capacity: usize,
    pub final_capacity: usize,
    pub growth_events: usize,
    pub raw_kmers: u64,
    pub dropped_kmers: u64,
    pub empty_rows: usize,
    pub elapsed: Duration,
}

/// Drives vocabulary construction, per-genome resolution and CSR assembly
pub struct MatrixBuilder<'a, C: KmerCounter + ?Sized> {
    counter: &'a C,
    params: MatrixParams,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<'a, C: KmerCounter + ?Sized> MatrixBuilder<'a, C> {
    pub fn new(counter: &'a C, params: MatrixParams) -> Self {
        Self {
            counter,
            params,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn params(&self) -> &MatrixParams {
        &self.params
    }

    #[instrument(skip_all, fields(genomes = genomes.len(), k = self.params.kmer_size))]
    pub fn build(&self, genomes: &GenomeList) -> Result<MatrixBuild> {
        self.params.validate()?;
        let started = Instant::now();
        let metrics = self.metrics.as_deref();

        let vocabulary = time_operation(metrics, "vocabulary", || {
            VocabularyBuilder::new(
                self.counter,
                VocabularyParams {
                    kmer_size: self.params.kmer_size,
                    min_count: self.params.min_count,
                    max_count: self.params.max_count,
                    normalize: self.params.normalize,
                },
            )
            .build(genomes.source())
        })?;

        let tracker = SparsityTracker::new(self.params.initial_density, genomes.len(), vocabulary.len())?;
        let initial_capacity = tracker.initial_capacity();
        info!(
            vocabulary = vocabulary.len(),
            genomes = genomes.len(),
            estimated_size = initial_capacity,
            "Allocating CSR buffers"
        );

        let mut accumulator = CsrAccumulator::new(initial_capacity, vocabulary.len())?;
        let resolver = FrequencyResolver::new(self.counter, &vocabulary, self.params.kmer_size, self.params.normalize);
        let progress = ProgressReporter::new("genomes", Some(genomes.len() as u64));
        let mut stats = BuildStats {
            genomes: genomes.len(),
            vocabulary_size: vocabulary.len(),
            initial_capacity,
            ..Default::default()
        };

        for (genome_number, genome) in genomes.genomes().iter().enumerate() {
            let row = time_operation(metrics, "genome", || resolver.resolve(genome, genome_number))?;

            if row.is_empty() {
                warn!(
                    genome = genome_number,
                    path = %genome.display(),
                    "Genome shares no k-mers with the vocabulary; row is empty"
                );
                stats.empty_rows += 1;
            }
            stats.raw_kmers += row.raw_kmers() as u64;
            stats.dropped_kmers += row.dropped() as u64;

            accumulator.push_row(&row)?;
            progress.inc();

            if let Some(metrics) = metrics {
                metrics.inc_counter("genomes_processed");
                metrics.set_gauge("nnz", accumulator.nnz() as u64);
            }

            let done = genome_number + 1;
            if done % self.params.progress_interval == 0 && done < genomes.len() {
                info!(
                    processed = done,
                    nnz = accumulator.nnz(),
                    density = tracker.running_density(accumulator.nnz(), done),
                    "Processed {} genomes",
                    done
                );
            }
        }

        stats.final_capacity = accumulator.capacity();
        stats.growth_events = accumulator.growth_events();
        let matrix = accumulator.finish();
        let sparsity = tracker.report(matrix.nnz());
        stats.elapsed = started.elapsed();

        info!(
            rows = matrix.n_rows,
            cols = matrix.n_cols,
            nnz = matrix.nnz(),
            sparsity = sparsity.observed_sparsity_percent,
            growth_events = stats.growth_events,
            elapsed = ?stats.elapsed,
            "CSR matrix assembled"
        );

        Ok(MatrixBuild {
            matrix,
            vocabulary,
            sparsity,
            stats,
        })
    }
}
