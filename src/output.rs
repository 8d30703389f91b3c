//! Output files for a finished matrix build
//!
//! Writes the CSR arrays as NPY files, the vocabulary as CSV, a stats text
//! file, optional JSON run metadata and a SHA-256 checksum list. Every file
//! is first written under a `.partial` name; the set is renamed into place
//! only once all of them are complete, matrix files first and the stats and
//! checksum files last. A failure removes whatever was staged or renamed.

use crate::builder::{MatrixBuild, MatrixParams};
use crate::config::OutputSettings;
use crate::error::{KmxError, Result};
use crate::sparsity::SparsityReport;
use crate::system::bytes_to_gb;
use crate::vocabulary::Vocabulary;
use chrono::{DateTime, Utc};
use ndarray::ArrayView1;
use ndarray_npy::{WritableElement, WriteNpyExt};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Describes how the run was invoked, for the stats and metadata files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub command_line: String,
    pub genome_list: PathBuf,
    pub tmp_dir: PathBuf,
    pub gpu_enabled: bool,
    /// Which memory the peak refers to ("device" or "host")
    pub memory_source: String,
}

impl RunContext {
    pub fn new(genome_list: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>, gpu_enabled: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
            genome_list: genome_list.into(),
            tmp_dir: tmp_dir.into(),
            gpu_enabled,
            memory_source: if gpu_enabled { "device" } else { "host" }.to_string(),
        }
    }

    /// Report under an id issued elsewhere, e.g. the metrics collector's
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_memory_source(mut self, source: impl Into<String>) -> Self {
        self.memory_source = source.into();
        self
    }
}

/// Run-level measurements collected outside the build itself
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunMeasurements {
    pub elapsed: Duration,
    pub peak_memory_bytes: u64,
}

/// Metadata information for output files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputMetadata {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub command_line: String,
    pub genome_list: PathBuf,
    pub tmp_dir: PathBuf,
    pub gpu_enabled: bool,
    pub parameters: MatrixParams,
    pub statistics: OutputStatistics,
}

/// Statistics from the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputStatistics {
    pub genomes: usize,
    pub vocabulary_size: usize,
    pub nnz: usize,
    pub sparsity: SparsityReport,
    pub growth_events: usize,
    pub empty_rows: usize,
    pub dropped_kmers: u64,
    pub processing_time_seconds: f64,
    pub peak_memory_bytes: u64,
}

/// Checksum information for an output file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChecksum {
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Paths written by [`OutputManager::write_all`]
#[derive(Debug, Clone, Default)]
pub struct OutputReport {
    pub files: Vec<PathBuf>,
    pub checksums: Vec<FileChecksum>,
    pub checksum_file: Option<PathBuf>,
}

/// Write a one-dimensional little-endian NPY array
pub fn write_npy<A: WritableElement, W: Write>(writer: W, values: &[A]) -> Result<()> {
    ArrayView1::from(values)
        .write_npy(writer)
        .map_err(|e| KmxError::io_error(format!("Failed to write NPY array: {}", e)))
}

/// `index,K-mer` CSV of the vocabulary in column order
pub fn write_vocabulary_csv<W: Write>(writer: &mut W, vocabulary: &Vocabulary) -> Result<()> {
    writeln!(writer, "index,K-mer")?;
    for (index, kmer) in vocabulary.iter() {
        writeln!(writer, "{},{}", index, kmer)?;
    }
    Ok(())
}

/// `H:MM:SS.ffffff`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!(
        "{}:{:02}:{:02}.{:06}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60,
        elapsed.subsec_micros()
    )
}

/// Human-readable stats file body
pub fn stats_text(
    params: &MatrixParams,
    sparsity: &SparsityReport,
    context: &RunContext,
    measurements: &RunMeasurements,
) -> String {
    format!(
        "Sparsity: {}%\n\
         K-mer size: {}\n\
         Temporary directory: {}\n\
         Min value: {}\n\
         Max value: {}\n\
         Normalization disabled: {}\n\
         GPU enabled: {}\n\
         Processing time: {}\n\
         Peak {} memory used: {:.2} GB\n",
        sparsity.observed_sparsity_percent,
        params.kmer_size,
        context.tmp_dir.display(),
        params.min_count,
        params.max_count,
        !params.normalize,
        context.gpu_enabled,
        format_elapsed(measurements.elapsed),
        context.memory_source,
        bytes_to_gb(measurements.peak_memory_bytes),
    )
}

/// Writes the output file set of one run into a directory
pub struct OutputManager {
    settings: OutputSettings,
    output_dir: PathBuf,
    suffix: String,
}

impl OutputManager {
    pub fn new(output_dir: impl Into<PathBuf>, params: &MatrixParams, settings: OutputSettings) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(|e| {
            KmxError::io_error(format!("Could not create output directory '{}': {}", output_dir.display(), e))
        })?;
        Ok(Self {
            settings,
            output_dir,
            suffix: params.file_suffix(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn path_for(&self, stem: &str, extension: &str) -> PathBuf {
        self.output_dir.join(format!("{}_{}.{}", stem, self.suffix, extension))
    }

    /// Stage every output file, then rename the whole set into place
    #[instrument(skip_all, fields(dir = %self.output_dir.display()))]
    pub fn write_all(
        &self,
        build: &MatrixBuild,
        params: &MatrixParams,
        context: &RunContext,
        measurements: &RunMeasurements,
    ) -> Result<OutputReport> {
        let matrix = &build.matrix;
        let row: Vec<i64> = matrix
            .indptr
            .iter()
            .map(|&p| i64::try_from(p).map_err(|_| KmxError::io_error(format!("Row pointer {} exceeds i64", p))))
            .collect::<Result<_>>()?;

        let mut staging = Staging::default();
        staging.stage(self.path_for("set_of_all_unique_kmers", "csv"), |w| {
            write_vocabulary_csv(w, &build.vocabulary)
        })?;
        staging.stage(self.path_for("data", "npy"), |w| write_npy(w, &matrix.data))?;
        staging.stage(self.path_for("row", "npy"), |w| write_npy(w, &row))?;
        staging.stage(self.path_for("column", "npy"), |w| write_npy(w, &matrix.indices))?;

        if self.settings.write_metadata {
            let metadata = self.metadata(build, params, context, measurements);
            staging.stage(self.path_for("run_metadata", "json"), |w| {
                serde_json::to_writer_pretty(&mut *w, &metadata)
                    .map_err(|e| KmxError::io_error(format!("Failed to serialize run metadata: {}", e)))?;
                writeln!(w)?;
                Ok(())
            })?;
        }

        let stats = stats_text(params, &build.sparsity, context, measurements);
        staging.stage(self.path_for("feature_matrix_stats", "txt"), |w| {
            w.write_all(stats.as_bytes())?;
            Ok(())
        })?;

        let mut report = OutputReport {
            files: staging.paths(),
            ..Default::default()
        };

        if self.settings.generate_checksums {
            // Hashed before the rename, listed under the final names
            report.checksums = staging
                .staged
                .par_iter()
                .map(|file| {
                    generate_checksum(&file.partial).map(|checksum| FileChecksum {
                        file_path: file.path.clone(),
                        ..checksum
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            let path = self.output_dir.join(format!("kmx_{}.checksums", self.suffix));
            staging.stage(path.clone(), |w| write_checksum_listing(w, &report.checksums))?;
            report.checksum_file = Some(path);
        }

        staging.commit()?;
        info!(files = report.files.len(), dir = %self.output_dir.display(), "Files saved successfully");
        Ok(report)
    }

    fn metadata(
        &self,
        build: &MatrixBuild,
        params: &MatrixParams,
        context: &RunContext,
        measurements: &RunMeasurements,
    ) -> OutputMetadata {
        OutputMetadata {
            run_id: context.run_id,
            timestamp: context.timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            command_line: context.command_line.clone(),
            genome_list: context.genome_list.clone(),
            tmp_dir: context.tmp_dir.clone(),
            gpu_enabled: context.gpu_enabled,
            parameters: *params,
            statistics: OutputStatistics {
                genomes: build.matrix.n_rows,
                vocabulary_size: build.matrix.n_cols,
                nnz: build.matrix.nnz(),
                sparsity: build.sparsity,
                growth_events: build.stats.growth_events,
                empty_rows: build.stats.empty_rows,
                dropped_kmers: build.stats.dropped_kmers,
                processing_time_seconds: measurements.elapsed.as_secs_f64(),
                peak_memory_bytes: measurements.peak_memory_bytes,
            },
        }
    }
}

/// `sha256 *name` listing of the given checksums
fn write_checksum_listing<W: Write>(writer: &mut W, checksums: &[FileChecksum]) -> Result<()> {
    writeln!(writer, "# KMX output file checksums")?;
    writeln!(writer, "# Generated: {}", Utc::now())?;
    writeln!(writer, "# Format: SHA256 *filename")?;
    writeln!(writer)?;
    for checksum in checksums {
        let name = checksum
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        writeln!(writer, "{} *{}", checksum.sha256, name)?;
    }
    Ok(())
}

/// A complete file still under its `.partial` name
#[derive(Debug)]
struct StagedFile {
    partial: PathBuf,
    path: PathBuf,
}

/// Files of one run awaiting their rename; dropping it removes the partials
#[derive(Debug, Default)]
struct Staging {
    staged: Vec<StagedFile>,
}

impl Staging {
    /// Write `<path>.partial` through a buffered writer
    fn stage<F>(&mut self, path: PathBuf, write: F) -> Result<()>
    where
        F: FnOnce(&mut BufWriter<File>) -> Result<()>,
    {
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let result = File::create(&partial)
            .map_err(|e| KmxError::io_error(format!("Failed to create '{}': {}", partial.display(), e)))
            .and_then(|file| {
                let mut writer = BufWriter::new(file);
                write(&mut writer)?;
                writer.flush()?;
                Ok(())
            });

        if let Err(e) = result {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        debug!(path = %partial.display(), "Output file staged");
        self.staged.push(StagedFile { partial, path });
        Ok(())
    }

    fn paths(&self) -> Vec<PathBuf> {
        self.staged.iter().map(|file| file.path.clone()).collect()
    }

    /// Rename in staging order; on failure undo the renames already done
    fn commit(mut self) -> Result<()> {
        let staged = std::mem::take(&mut self.staged);
        let mut committed: Vec<&Path> = Vec::with_capacity(staged.len());

        for (i, file) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(&file.partial, &file.path) {
                for path in committed {
                    let _ = fs::remove_file(path);
                }
                for pending in &staged[i..] {
                    let _ = fs::remove_file(&pending.partial);
                }
                return Err(KmxError::io_error(format!(
                    "Failed to move '{}' into place: {}",
                    file.path.display(),
                    e
                )));
            }
            committed.push(&file.path);
        }

        debug!(files = committed.len(), "Output files renamed into place");
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        for file in self.staged.drain(..) {
            let _ = fs::remove_file(&file.partial);
        }
    }
}

/// SHA-256 of a file's contents
pub fn generate_checksum(path: &Path) -> Result<FileChecksum> {
    let mut file = File::open(path)
        .map_err(|e| KmxError::io_error(format!("Failed to open '{}' for checksum: {}", path.display(), e)))?;
    let size_bytes = file.metadata()?.len();

    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 64 * 1024];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(FileChecksum {
        file_path: path.to_path_buf(),
        size_bytes,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuildStats;
    use crate::csr::CsrMatrix;
    use crate::sparsity::SparsityTracker;
    use ndarray::Array1;
    use ndarray_npy::ReadNpyExt;
    use tempfile::TempDir;

    fn sample_build() -> MatrixBuild {
        let vocabulary = Vocabulary::from_kmers(["AAAAAAAA", "CCCCCCCC", "GGGGGGGG"].map(String::from)).unwrap();
        let matrix = CsrMatrix {
            data: vec![3.0, 1.0, 7.0],
            indices: vec![0, 1, 2],
            indptr: vec![0, 2, 2, 3],
            n_rows: 3,
            n_cols: 3,
        };
        let sparsity = SparsityTracker::new(0.001, 3, 3).unwrap().report(3);
        MatrixBuild {
            matrix,
            vocabulary,
            sparsity,
            stats: BuildStats::default(),
        }
    }

    fn context(tmp: &Path) -> RunContext {
        RunContext::new("genomes.txt", tmp, false)
    }

    fn partial_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.to_string_lossy().ends_with(".partial"))
            .collect()
    }

    #[test]
    fn test_write_npy_reads_back() {
        let mut buf = Vec::new();
        write_npy(&mut buf, &[1u32, 258]).unwrap();
        let array = Array1::<u32>::read_npy(&buf[..]).unwrap();
        assert_eq!(array.to_vec(), vec![1, 258]);
        // dtype is checked on read
        assert!(Array1::<i64>::read_npy(&buf[..]).is_err());

        let mut empty = Vec::new();
        write_npy::<f32, _>(&mut empty, &[]).unwrap();
        assert_eq!(Array1::<f32>::read_npy(&empty[..]).unwrap().len(), 0);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(3_723_250)), "1:02:03.250000");
        assert_eq!(format_elapsed(Duration::ZERO), "0:00:00.000000");
    }

    #[test]
    fn test_write_all_produces_file_set() {
        let temp = TempDir::new().unwrap();
        let params = MatrixParams::new(8, 1, 2);
        let manager = OutputManager::new(temp.path().join("out"), &params, OutputSettings::default()).unwrap();
        let build = sample_build();
        let measurements = RunMeasurements {
            elapsed: Duration::from_secs(2),
            peak_memory_bytes: 0,
        };

        let report = manager.write_all(&build, &params, &context(temp.path()), &measurements).unwrap();
        assert_eq!(report.files.len(), 6);
        assert_eq!(report.checksums.len(), 6);

        for stem in ["data", "row", "column"] {
            assert!(manager.path_for(stem, "npy").is_file());
        }
        assert!(partial_files(manager.output_dir()).is_empty());

        let vocab = fs::read_to_string(manager.path_for("set_of_all_unique_kmers", "csv")).unwrap();
        assert_eq!(vocab, "index,K-mer\n0,AAAAAAAA\n1,CCCCCCCC\n2,GGGGGGGG\n");

        let stats = fs::read_to_string(manager.path_for("feature_matrix_stats", "txt")).unwrap();
        assert!(stats.starts_with("Sparsity: "));
        assert!(stats.contains("K-mer size: 8\n"));
        assert!(stats.contains("Normalization disabled: false\n"));
        assert!(stats.contains("Processing time: 0:00:02.000000\n"));

        let row = Array1::<i64>::read_npy(File::open(manager.path_for("row", "npy")).unwrap()).unwrap();
        assert_eq!(row.to_vec(), vec![0, 2, 2, 3]);
        let data = Array1::<f32>::read_npy(File::open(manager.path_for("data", "npy")).unwrap()).unwrap();
        assert_eq!(data.to_vec(), vec![3.0, 1.0, 7.0]);

        let metadata: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(manager.path_for("run_metadata", "json")).unwrap()).unwrap();
        assert_eq!(metadata["statistics"]["nnz"], 3);
        assert_eq!(metadata["parameters"]["kmer_size"], 8);
    }

    #[test]
    fn test_checksum_file_matches_contents() {
        let temp = TempDir::new().unwrap();
        let params = MatrixParams::new(8, 1, 2);
        let manager = OutputManager::new(temp.path(), &params, OutputSettings::default()).unwrap();
        let report = manager
            .write_all(&sample_build(), &params, &context(temp.path()), &RunMeasurements::default())
            .unwrap();

        let checksum_file = report.checksum_file.unwrap();
        assert_eq!(checksum_file.file_name().unwrap(), "kmx_k8_min1_max2_d0.checksums");
        let listing = fs::read_to_string(&checksum_file).unwrap();

        let data_path = manager.path_for("data", "npy");
        let expected = format!("{:x}", Sha256::digest(fs::read(&data_path).unwrap()));
        assert!(listing.contains(&format!("{} *data_k8_min1_max2_d0.npy", expected)));
    }

    #[test]
    fn test_optional_files_disabled() {
        let temp = TempDir::new().unwrap();
        let params = MatrixParams::new(8, 1, 2);
        let settings = OutputSettings {
            write_metadata: false,
            generate_checksums: false,
        };
        let manager = OutputManager::new(temp.path(), &params, settings).unwrap();
        let report = manager
            .write_all(&sample_build(), &params, &context(temp.path()), &RunMeasurements::default())
            .unwrap();

        assert_eq!(report.files.len(), 5);
        assert!(report.checksum_file.is_none());
        assert!(!manager.path_for("run_metadata", "json").exists());
    }

    #[test]
    fn test_failed_rename_leaves_no_outputs() {
        let temp = TempDir::new().unwrap();
        let params = MatrixParams::new(8, 1, 2);
        let manager = OutputManager::new(temp.path().join("out"), &params, OutputSettings::default()).unwrap();
        // A directory where the column array belongs makes its rename fail
        // after the vocabulary, data and row files were already moved
        let blocker = manager.path_for("column", "npy");
        fs::create_dir(&blocker).unwrap();

        let err = manager
            .write_all(&sample_build(), &params, &context(temp.path()), &RunMeasurements::default())
            .unwrap_err();
        assert!(err.to_string().contains("column_k8_min1_max2_d0.npy"));

        let remaining: Vec<_> = fs::read_dir(manager.output_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        assert_eq!(remaining, vec![blocker]);
    }

    #[test]
    fn test_failed_write_removes_staged_files() {
        let temp = TempDir::new().unwrap();
        let params = MatrixParams::new(8, 1, 2);
        let manager = OutputManager::new(temp.path(), &params, OutputSettings::default()).unwrap();
        let mut blocked = manager.path_for("feature_matrix_stats", "txt").into_os_string();
        blocked.push(".partial");
        fs::create_dir(&blocked).unwrap();

        assert!(manager
            .write_all(&sample_build(), &params, &context(temp.path()), &RunMeasurements::default())
            .is_err());
        assert!(partial_files(temp.path()).is_empty());
        for stem in ["data", "row", "column"] {
            assert!(!manager.path_for(stem, "npy").exists());
        }
        assert!(!manager.path_for("set_of_all_unique_kmers", "csv").exists());
    }
}
