//! Interface to the external k-mer counting oracle
//!
//! Counting k-mers inside a genome is delegated to an external binary (gerbil
//! by default). The rest of the crate only sees the [`KmerCounter`] trait, so
//! the assembly core can be driven by an in-memory counter in tests.

use crate::error::{KmxError, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Upper occurrence bound used when no filtering is wanted
pub const UNBOUNDED_MAX_COUNT: u64 = 1_000_000_000;

const KMER_COLUMN: &str = "K-mer";
const FREQUENCY_COLUMN: &str = "Frequency";

/// How long captured output may trail a timed child's exit
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

type OutputReceiver = Receiver<std::io::Result<String>>;

/// One invocation of the counting oracle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountRequest {
    /// Genome FASTA, or a list file of FASTA paths for the combined count
    pub input: PathBuf,
    pub kmer_size: usize,
    /// Lowest occurrence count a k-mer needs to be reported
    pub min_count: u64,
    /// Highest occurrence count a k-mer may have to be reported
    pub max_count: u64,
    /// Fold each k-mer with its reverse complement
    pub normalize: bool,
    /// Short tag used to name the temporary output file
    pub label: String,
}

impl CountRequest {
    /// Request with global occurrence thresholds over a genome list
    pub fn combined(input: impl Into<PathBuf>, kmer_size: usize, min_count: u64, max_count: u64, normalize: bool) -> Self {
        Self {
            input: input.into(),
            kmer_size,
            min_count,
            max_count,
            normalize,
            label: format!(
                "set_of_all_unique_kmers_min{}_max{}_kmer{}_{}",
                min_count,
                max_count,
                kmer_size,
                normalization_tag(normalize)
            ),
        }
    }

    /// Unfiltered request for one genome
    pub fn single_genome(input: impl Into<PathBuf>, genome_number: usize, kmer_size: usize, normalize: bool) -> Self {
        Self {
            input: input.into(),
            kmer_size,
            min_count: 1,
            max_count: UNBOUNDED_MAX_COUNT,
            normalize,
            label: format!("output_genome_{}_{}", genome_number, normalization_tag(normalize)),
        }
    }
}

fn normalization_tag(normalize: bool) -> &'static str {
    if normalize {
        "normalization_enabled"
    } else {
        "normalization_disabled"
    }
}

/// Ordered (k-mer, frequency) rows produced by one oracle run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrequencyTable {
    entries: Vec<(String, u64)>,
}

impl FrequencyTable {
    pub fn from_entries(entries: Vec<(String, u64)>) -> Self {
        Self { entries }
    }

    /// Read a `K-mer,Frequency` CSV written by the oracle
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), path)
    }

    /// Parse CSV content; `source` is only used in error messages.
    ///
    /// Column order is taken from the header, so extra columns are tolerated.
    pub fn from_reader<R: BufRead>(reader: R, source: &Path) -> Result<Self> {
        let mut lines = reader.lines().enumerate();

        let (kmer_col, freq_col, width) = loop {
            let Some((idx, line)) = lines.next() else {
                return Err(KmxError::parse(source, 1, "missing header row"));
            };
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let header: Vec<&str> = line.split(',').map(str::trim).collect();
            let kmer_col = header.iter().position(|h| *h == KMER_COLUMN);
            let freq_col = header.iter().position(|h| *h == FREQUENCY_COLUMN);
            match (kmer_col, freq_col) {
                (Some(k), Some(f)) => break (k, f, header.len()),
                _ => {
                    return Err(KmxError::parse(
                        source,
                        idx + 1,
                        format!("expected '{}' and '{}' columns, found '{}'", KMER_COLUMN, FREQUENCY_COLUMN, line),
                    ))
                }
            }
        };

        let mut entries = Vec::new();
        for (idx, line) in lines {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != width {
                return Err(KmxError::parse(
                    source,
                    idx + 1,
                    format!("expected {} fields, found {}", width, fields.len()),
                ));
            }
            let kmer = fields[kmer_col];
            if kmer.is_empty() {
                return Err(KmxError::parse(source, idx + 1, "empty k-mer"));
            }
            let frequency: u64 = fields[freq_col].parse().map_err(|e| {
                KmxError::parse(source, idx + 1, format!("invalid frequency '{}': {}", fields[freq_col], e))
            })?;
            if frequency == 0 {
                return Err(KmxError::parse(source, idx + 1, format!("zero frequency for k-mer {}", kmer)));
            }
            entries.push((kmer.to_string(), frequency));
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, f)| (k.as_str(), *f))
    }

    /// K-mers in table order, consuming the table
    pub fn into_kmers(self) -> impl Iterator<Item = String> {
        self.entries.into_iter().map(|(k, _)| k)
    }
}

/// Capability to count k-mers for a request
pub trait KmerCounter {
    fn count(&self, request: &CountRequest) -> Result<FrequencyTable>;
}

impl<C: KmerCounter + ?Sized> KmerCounter for &C {
    fn count(&self, request: &CountRequest) -> Result<FrequencyTable> {
        (**self).count(request)
    }
}

/// Subprocess-backed counter running the gerbil binary
#[derive(Debug, Clone)]
pub struct GerbilCounter {
    executable: PathBuf,
    work_dir: PathBuf,
    enable_gpu: bool,
    timeout: Option<Duration>,
    prepend_conda_lib: bool,
}

impl GerbilCounter {
    pub fn new(executable: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            work_dir: work_dir.into(),
            enable_gpu: true,
            timeout: None,
            prepend_conda_lib: true,
        }
    }

    pub fn enable_gpu(mut self, enable: bool) -> Self {
        self.enable_gpu = enable;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prepend_conda_lib(mut self, prepend: bool) -> Self {
        self.prepend_conda_lib = prepend;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Fail early when an explicit path to the binary does not exist
    pub fn check_executable(&self) -> Result<()> {
        let has_dir = self.executable.components().count() > 1;
        if has_dir && !self.executable.is_file() {
            return Err(KmxError::OracleNotFound {
                program: self.executable.clone(),
                reason: "no such file".to_string(),
            });
        }
        Ok(())
    }

    fn command(&self, request: &CountRequest, output: &Path) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("-k")
            .arg(request.kmer_size.to_string())
            .arg("-o")
            .arg("csv")
            .arg("-l")
            .arg(request.min_count.to_string())
            .arg("-z")
            .arg(request.max_count.to_string());
        if self.enable_gpu {
            cmd.arg("-g");
        }
        if !request.normalize {
            cmd.arg("-d");
        }
        cmd.arg(&request.input).arg(&self.work_dir).arg(output);

        if self.prepend_conda_lib {
            if let Some(conda_prefix) = std::env::var_os("CONDA_PREFIX").filter(|p| !p.is_empty()) {
                let mut lib_path = PathBuf::from(conda_prefix).join("lib").into_os_string();
                lib_path.push(":");
                if let Some(existing) = std::env::var_os("LD_LIBRARY_PATH") {
                    lib_path.push(existing);
                }
                cmd.env("LD_LIBRARY_PATH", lib_path);
            }
        }

        // A timed run gets its own process group so expiry reaches helpers it forked
        #[cfg(unix)]
        if self.timeout.is_some() {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    fn run(&self, mut cmd: Command) -> Result<()> {
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => KmxError::OracleNotFound {
                program: self.executable.clone(),
                reason: e.to_string(),
            },
            _ => KmxError::Io(e),
        })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let (status, collect_by) = match self.timeout {
            None => (Some(child.wait()?), None),
            Some(limit) => {
                let deadline = Instant::now() + limit;
                (wait_with_deadline(&mut child, deadline)?, Some(deadline + OUTPUT_GRACE))
            }
        };

        // The reader threads are left to finish once the killed group closes its pipes
        let Some(status) = status else {
            return Err(KmxError::OracleTimeout {
                program: self.executable.clone(),
                secs: self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
            });
        };

        let stdout = collect_output(stdout, collect_by)?;
        let stderr = collect_output(stderr, collect_by)?;

        if status.success() {
            Ok(())
        } else {
            Err(KmxError::OracleFailed {
                program: self.executable.clone(),
                status,
                stdout,
                stderr,
            })
        }
    }
}

impl KmerCounter for GerbilCounter {
    #[instrument(skip(self, request), fields(input = %request.input.display(), label = %request.label))]
    fn count(&self, request: &CountRequest) -> Result<FrequencyTable> {
        self.check_executable()?;

        // Removed on drop, whether or not the oracle succeeds
        let output = tempfile::Builder::new()
            .prefix(&format!("temporary_{}_", request.label))
            .suffix(".csv")
            .tempfile_in(&self.work_dir)?
            .into_temp_path();

        let started = Instant::now();
        self.run(self.command(request, &output))?;
        let table = FrequencyTable::from_csv(&output)?;
        output.close()?;

        debug!(
            kmers = table.len(),
            elapsed = ?started.elapsed(),
            "K-mer counter finished"
        );
        Ok(table)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<OutputReceiver> {
    pipe.map(|mut pipe| {
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let mut buf = Vec::new();
            let output = pipe
                .read_to_end(&mut buf)
                .map(|_| String::from_utf8_lossy(&buf).into_owned());
            let _ = tx.send(output);
        });
        rx
    })
}

/// Captured output of a drained pipe, waiting no later than `by` when given
fn collect_output(output: Option<OutputReceiver>, by: Option<Instant>) -> Result<String> {
    let Some(output) = output else {
        return Ok(String::new());
    };
    let received = match by {
        None => output.recv().map_err(|_| RecvTimeoutError::Disconnected),
        Some(by) => output.recv_deadline(by),
    };
    match received {
        Ok(text) => Ok(text?),
        Err(RecvTimeoutError::Timeout) => {
            warn!("K-mer counter output still open after it exited; not collected");
            Ok(String::new())
        }
        Err(RecvTimeoutError::Disconnected) => Err(KmxError::Thread("output reader panicked".to_string())),
    }
}

/// Wait for the child until `deadline`; kills it and returns `None` on expiry.
fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Result<Option<std::process::ExitStatus>> {
    let poll = Duration::from_millis(25);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            terminate(child);
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(poll.min(deadline - now));
    }
}

/// SIGKILL the child's whole process group
#[cfg(unix)]
fn terminate(child: &mut Child) {
    let group = child.id() as libc::pid_t;
    // SAFETY: kill(2) takes plain integers; the group was created at spawn
    if unsafe { libc::kill(-group, libc::SIGKILL) } != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(content: &str) -> Result<FrequencyTable> {
        FrequencyTable::from_reader(Cursor::new(content), Path::new("test.csv"))
    }

    #[test]
    fn test_parse_table() {
        let table = parse("K-mer,Frequency\nAAA,3\nAAC,1\n\nTTT,5\n").unwrap();
        assert_eq!(table.len(), 3);
        let rows: Vec<_> = table.iter().collect();
        assert_eq!(rows, vec![("AAA", 3), ("AAC", 1), ("TTT", 5)]);
    }

    #[test]
    fn test_parse_reordered_columns() {
        let table = parse("Frequency,K-mer\r\n7,ACGT\r\n").unwrap();
        assert_eq!(table.iter().collect::<Vec<_>>(), vec![("ACGT", 7)]);
    }

    #[test]
    fn test_parse_header_only() {
        let table = parse("K-mer,Frequency\n").unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse(""), Err(KmxError::Parse { line: 1, .. })));
        assert!(matches!(parse("kmer,count\nAAA,1\n"), Err(KmxError::Parse { .. })));
        assert!(matches!(parse("K-mer,Frequency\nAAA\n"), Err(KmxError::Parse { line: 2, .. })));
        assert!(matches!(parse("K-mer,Frequency\nAAA,x\n"), Err(KmxError::Parse { line: 2, .. })));
        assert!(matches!(parse("K-mer,Frequency\nAAA,0\n"), Err(KmxError::Parse { .. })));
    }

    #[test]
    fn test_request_labels() {
        let req = CountRequest::combined("genomes.txt", 31, 5, 50, true);
        assert_eq!(req.label, "set_of_all_unique_kmers_min5_max50_kmer31_normalization_enabled");

        let req = CountRequest::single_genome("g.fa", 7, 31, false);
        assert_eq!(req.min_count, 1);
        assert_eq!(req.max_count, UNBOUNDED_MAX_COUNT);
        assert_eq!(req.label, "output_genome_7_normalization_disabled");
    }

    #[test]
    fn test_command_arguments() {
        let counter = GerbilCounter::new("/opt/gerbil", "/tmp/work").enable_gpu(true).prepend_conda_lib(false);
        let req = CountRequest::single_genome("g.fa", 0, 21, false);
        let cmd = counter.command(&req, Path::new("/tmp/work/out.csv"));
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["-k", "21", "-o", "csv", "-l", "1", "-z", "1000000000", "-g", "-d", "g.fa", "/tmp/work", "/tmp/work/out.csv"]
        );

        let counter = counter.enable_gpu(false);
        let req = CountRequest::combined("list.txt", 21, 2, 9, true);
        let cmd = counter.command(&req, Path::new("out.csv"));
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(!args.contains(&"-g".to_string()));
        assert!(!args.contains(&"-d".to_string()));
    }

    #[test]
    fn test_missing_executable() {
        let dir = tempfile::TempDir::new().unwrap();
        let counter = GerbilCounter::new(dir.path().join("no-such-gerbil"), dir.path());
        let err = counter.count(&CountRequest::single_genome("g.fa", 0, 21, true)).unwrap_err();
        assert!(matches!(err, KmxError::OracleNotFound { .. }));
    }
}
