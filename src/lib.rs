//! Genome x k-mer frequency matrices in CSR form
//!
//! A counting oracle (gerbil) produces the global k-mer vocabulary and each
//! genome's frequency table; this crate joins them and assembles the result
//! into a compressed sparse row matrix written out as NumPy arrays.

// Row pointers and buffer capacities routinely exceed 32-bit ranges
#[cfg(target_pointer_width = "32")]
compile_error!("KMX requires a 64-bit target to address large matrices.");

pub mod builder;
pub mod cli;
pub mod config;
pub mod csr;
pub mod error;
pub mod genome_list;
pub mod logging;
pub mod oracle;
pub mod output;
pub mod resolver;
pub mod sparsity;
pub mod system;
pub mod vocabulary;

pub use builder::{BuildStats, MatrixBuild, MatrixBuilder, MatrixParams};
pub use csr::{CsrAccumulator, CsrMatrix, GrowableBuffer};
pub use error::{KmxError, Result};
pub use genome_list::GenomeList;
pub use oracle::{CountRequest, FrequencyTable, GerbilCounter, KmerCounter};
pub use resolver::{FrequencyResolver, ResolvedRow};
pub use sparsity::{SparsityReport, SparsityTracker};
pub use vocabulary::{Vocabulary, VocabularyBuilder};
