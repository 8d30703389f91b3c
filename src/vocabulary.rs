//! Global k-mer vocabulary
//!
//! The vocabulary is built from a single oracle run over every genome with the
//! global occurrence thresholds. Each retained k-mer gets the index of its
//! first appearance in the oracle output; the mapping never changes after
//! construction, so every matrix row agrees on what a column means.

use crate::error::{KmxError, Result};
use crate::oracle::{CountRequest, KmerCounter};
use ahash::AHashMap;
use std::path::Path;
use tracing::{info, instrument, warn};

/// Ordered, deduplicated k-mers with their column indices
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    kmers: Vec<String>,
    index: AHashMap<String, u32>,
}

impl Vocabulary {
    /// Build from k-mers in oracle order, keeping the first occurrence of duplicates
    pub fn from_kmers<I>(kmers: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let iter = kmers.into_iter();
        let (lower, _) = iter.size_hint();
        let mut vocab = Self {
            kmers: Vec::with_capacity(lower),
            index: AHashMap::with_capacity(lower),
        };

        for kmer in iter {
            if vocab.index.contains_key(&kmer) {
                continue;
            }
            let idx = u32::try_from(vocab.kmers.len()).map_err(|_| KmxError::VocabularyTooLarge(vocab.kmers.len() + 1))?;
            vocab.index.insert(kmer.clone(), idx);
            vocab.kmers.push(kmer);
        }

        Ok(vocab)
    }

    pub fn len(&self) -> usize {
        self.kmers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kmers.is_empty()
    }

    /// Column index of a k-mer, if retained
    #[inline]
    pub fn index_of(&self, kmer: &str) -> Option<u32> {
        self.index.get(kmer).copied()
    }

    pub fn kmer(&self, index: u32) -> Option<&str> {
        self.kmers.get(index as usize).map(String::as_str)
    }

    pub fn kmers(&self) -> &[String] {
        &self.kmers
    }

    /// (index, k-mer) pairs in index order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.kmers.iter().enumerate().map(|(i, k)| (i as u32, k.as_str()))
    }
}

/// Parameters of the combined counting run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabularyParams {
    pub kmer_size: usize,
    pub min_count: u64,
    pub max_count: u64,
    pub normalize: bool,
}

/// Runs the oracle once over all genomes to obtain the vocabulary
pub struct VocabularyBuilder<'a, C: KmerCounter + ?Sized> {
    counter: &'a C,
    params: VocabularyParams,
}

impl<'a, C: KmerCounter + ?Sized> VocabularyBuilder<'a, C> {
    pub fn new(counter: &'a C, params: VocabularyParams) -> Self {
        Self { counter, params }
    }

    /// `genome_list` is the list file handed to the oracle as its input
    #[instrument(skip(self), fields(k = self.params.kmer_size, min = self.params.min_count, max = self.params.max_count))]
    pub fn build(&self, genome_list: &Path) -> Result<Vocabulary> {
        let request = CountRequest::combined(
            genome_list,
            self.params.kmer_size,
            self.params.min_count,
            self.params.max_count,
            self.params.normalize,
        );

        let table = self.counter.count(&request)?;
        let raw = table.len();
        let vocabulary = Vocabulary::from_kmers(table.into_kmers())?;

        if vocabulary.len() < raw {
            warn!(
                raw_rows = raw,
                unique = vocabulary.len(),
                "K-mer counter reported duplicate k-mers; keeping first occurrences"
            );
        }
        if vocabulary.is_empty() {
            warn!("No k-mers passed the global occurrence thresholds; every row will be empty");
        }

        info!(kmers = vocabulary.len(), "Set of all unique k-mers extracted");
        Ok(vocabulary)
    }
}
