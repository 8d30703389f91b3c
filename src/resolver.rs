//! Per-genome frequency resolution
//!
//! A genome's unfiltered k-mer table is joined against the vocabulary. The
//! join is anchored on the genome's table: every raw k-mer is a candidate and
//! only those present in the vocabulary survive, in table order.

use crate::error::Result;
use crate::oracle::{CountRequest, FrequencyTable, KmerCounter};
use crate::vocabulary::Vocabulary;
use std::path::Path;
use tracing::{debug, instrument};

/// One genome's (column, value) pairs, ready to append as a CSR row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedRow {
    columns: Vec<u32>,
    values: Vec<f32>,
    raw_kmers: usize,
}

impl ResolvedRow {
    pub fn from_pairs<I: IntoIterator<Item = (u32, f32)>>(pairs: I) -> Self {
        let (columns, values): (Vec<u32>, Vec<f32>) = pairs.into_iter().unzip();
        let raw_kmers = columns.len();
        Self {
            columns,
            values,
            raw_kmers,
        }
    }

    pub fn columns(&self) -> &[u32] {
        &self.columns
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Number of non-zero entries this row contributes
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// K-mers reported by the oracle before the join
    pub fn raw_kmers(&self) -> usize {
        self.raw_kmers
    }

    /// K-mers dropped because they are outside the vocabulary
    pub fn dropped(&self) -> usize {
        self.raw_kmers - self.columns.len()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (u32, f32)> + '_ {
        self.columns.iter().copied().zip(self.values.iter().copied())
    }
}

/// Join a raw frequency table against the vocabulary.
///
/// Frequencies are stored as `f32`; counts above 2^24 lose precision.
pub fn resolve_table(vocabulary: &Vocabulary, table: &FrequencyTable) -> ResolvedRow {
    let mut columns = Vec::with_capacity(table.len().min(vocabulary.len()));
    let mut values = Vec::with_capacity(columns.capacity());

    for (kmer, frequency) in table.iter() {
        if let Some(idx) = vocabulary.index_of(kmer) {
            columns.push(idx);
            values.push(frequency as f32);
        }
    }

    ResolvedRow {
        columns,
        values,
        raw_kmers: table.len(),
    }
}

/// Counts one genome and resolves it against the vocabulary
pub struct FrequencyResolver<'a, C: KmerCounter + ?Sized> {
    counter: &'a C,
    vocabulary: &'a Vocabulary,
    kmer_size: usize,
    normalize: bool,
}

impl<'a, C: KmerCounter + ?Sized> FrequencyResolver<'a, C> {
    pub fn new(counter: &'a C, vocabulary: &'a Vocabulary, kmer_size: usize, normalize: bool) -> Self {
        Self {
            counter,
            vocabulary,
            kmer_size,
            normalize,
        }
    }

    #[instrument(skip(self), level = "debug")]
    pub fn resolve(&self, genome: &Path, genome_number: usize) -> Result<ResolvedRow> {
        let request = CountRequest::single_genome(genome, genome_number, self.kmer_size, self.normalize);
        let table = self.counter.count(&request)?;
        let row = resolve_table(self.vocabulary, &table);

        debug!(
            genome = genome_number,
            raw = row.raw_kmers(),
            matched = row.len(),
            dropped = row.dropped(),
            "Genome resolved"
        );
        Ok(row)
    }
}
