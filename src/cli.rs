//! Command line interface of the `kmx` binary
//!
//! Flags are the last configuration layer: defaults, then the config file,
//! then `KMX_*` environment variables, then whatever is given here.

use crate::config::{ConfigManager, MAX_KMER_SIZE, MIN_KMER_SIZE};
use crate::error::{KmxError, Result};
use crate::logging::LogLevel;
use clap::Parser;
use std::path::PathBuf;

/// Exit status for a completed run
pub const EXIT_SUCCESS: u8 = 0;
/// Exit status when the run itself fails
pub const EXIT_FAILURE: u8 = 1;
/// Exit status for invalid arguments or configuration
pub const EXIT_USAGE: u8 = 2;

/// Processes a list of genomes and extracts k-mer frequency data into a CSR matrix.
#[derive(Parser, Debug, Clone)]
#[command(name = "kmx", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a text file containing FASTA file paths
    #[arg(short = 'l', long, value_name = "FILE")]
    pub genome_list: PathBuf,

    /// Minimum occurrence threshold for a k-mer to be retained [default: 5]
    #[arg(long)]
    pub min: Option<u64>,

    /// Maximum occurrence threshold [default: half the number of genomes, at least 1]
    #[arg(long)]
    pub max: Option<u64>,

    /// Temporary directory for counter output (at least 10 GB free by default)
    #[arg(short = 't', long, value_name = "DIR")]
    pub tmp: PathBuf,

    /// Size of the k-mers to be analyzed (8 to 136, inclusive) [default: 31]
    #[arg(short = 'k', long, value_parser = parse_kmer_size)]
    pub kmer_size: Option<usize>,

    /// Treat a k-mer and its reverse complement as different k-mers
    #[arg(short = 'd', long)]
    pub disable_normalization: bool,

    /// Force CPU mode; GPU acceleration is used otherwise
    #[arg(short = 'c', long)]
    pub cpu: bool,

    /// Output directory
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output: PathBuf,

    /// Configuration file (.toml, .yaml, .yml or .json)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to the k-mer counter executable
    #[arg(long, value_name = "PATH")]
    pub oracle: Option<PathBuf>,

    /// Kill a counter invocation after this many seconds
    #[arg(long, value_name = "SECS")]
    pub oracle_timeout: Option<u64>,

    /// Expected matrix density used to size the initial buffers
    #[arg(long)]
    pub density: Option<f64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,

    /// Write logs to daily rolling files in this directory
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,
}

fn parse_kmer_size(value: &str) -> std::result::Result<usize, String> {
    let k: usize = value
        .parse()
        .map_err(|_| format!("must be an integer between {} and {}", MIN_KMER_SIZE, MAX_KMER_SIZE))?;
    if !(MIN_KMER_SIZE..=MAX_KMER_SIZE).contains(&k) {
        return Err(format!("must be between {} and {}, got {}", MIN_KMER_SIZE, MAX_KMER_SIZE, k));
    }
    Ok(k)
}

impl Cli {
    /// Build the layered configuration over the process environment
    pub fn load_config(&self) -> Result<ConfigManager> {
        self.load_config_with(|name| std::env::var(name).ok())
    }

    /// Defaults, config file, `KMX_*` variables from `env`, then these flags.
    /// Validation runs once on the merged result.
    pub fn load_config_with<F>(&self, env: F) -> Result<ConfigManager>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut manager = match &self.config {
            Some(path) => ConfigManager::load_from_file(path)?,
            None => ConfigManager::new(),
        };
        manager.apply_overrides(env)?;
        self.apply_to(&mut manager);
        manager.config().validate()?;
        Ok(manager)
    }

    /// Override configuration values with explicitly given flags
    pub fn apply_to(&self, manager: &mut ConfigManager) {
        let config = manager.config_mut();

        if let Some(k) = self.kmer_size {
            config.matrix.kmer_size = k;
        }
        if let Some(min) = self.min {
            config.matrix.min_count = min;
        }
        if let Some(max) = self.max {
            config.matrix.max_count = Some(max);
        }
        if self.disable_normalization {
            config.matrix.disable_normalization = true;
        }
        if let Some(density) = self.density {
            config.matrix.initial_density = density;
        }
        if self.cpu {
            config.oracle.enable_gpu = false;
        }
        if let Some(oracle) = &self.oracle {
            config.oracle.executable = oracle.clone();
        }
        if let Some(secs) = self.oracle_timeout {
            config.oracle.timeout_secs = Some(secs);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.json_logs {
            config.logging.json_format = true;
        }
        if let Some(dir) = &self.log_dir {
            config.logging.log_dir = Some(dir.clone());
        }
    }
}

/// Map an error to the process exit status
pub fn exit_code(error: &KmxError) -> u8 {
    match error {
        KmxError::Config(_) | KmxError::InvalidKmerLength { .. } | KmxError::InvalidThresholds { .. } => EXIT_USAGE,
        _ => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        let mut argv = vec!["kmx", "-l", "genomes.txt", "-t", "/tmp/kmx", "-o", "out"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_required_arguments() {
        assert!(Cli::try_parse_from(["kmx", "-l", "genomes.txt"]).is_err());
        let cli = parse(&[]).unwrap();
        assert_eq!(cli.genome_list, PathBuf::from("genomes.txt"));
        assert!(cli.kmer_size.is_none());
        assert!(!cli.cpu);
    }

    #[test]
    fn test_kmer_size_range() {
        assert_eq!(parse(&["-k", "8"]).unwrap().kmer_size, Some(8));
        assert_eq!(parse(&["--kmer-size", "136"]).unwrap().kmer_size, Some(136));
        assert!(parse(&["-k", "7"]).is_err());
        assert!(parse(&["-k", "137"]).is_err());
        assert!(parse(&["-k", "abc"]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = parse(&[
            "-k", "21", "--min", "2", "--max", "9", "-d", "-c", "--oracle", "/opt/gerbil", "--oracle-timeout", "30",
            "--log-level", "debug", "--json-logs",
        ])
        .unwrap();
        let mut manager = ConfigManager::new();
        cli.apply_to(&mut manager);

        let config = manager.config();
        assert_eq!(config.matrix.kmer_size, 21);
        assert_eq!(config.matrix.min_count, 2);
        assert_eq!(config.matrix.max_count, Some(9));
        assert!(config.matrix.disable_normalization);
        assert!(!config.oracle.enable_gpu);
        assert_eq!(config.oracle.executable, PathBuf::from("/opt/gerbil"));
        assert_eq!(config.oracle.timeout_secs, Some(30));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_unset_flags_keep_config() {
        let cli = parse(&[]).unwrap();
        let mut manager = ConfigManager::new();
        manager.config_mut().matrix.kmer_size = 25;
        cli.apply_to(&mut manager);
        assert_eq!(manager.config().matrix.kmer_size, 25);
        assert!(manager.config().oracle.enable_gpu);
    }

    #[test]
    fn test_max_below_min_is_usage_error() {
        let cli = parse(&["--min", "10", "--max", "3"]).unwrap();
        let err = cli.load_config_with(|_| None).unwrap_err();
        assert!(matches!(err, KmxError::InvalidThresholds { min: 10, max: 3 }));
        assert_eq!(exit_code(&err), EXIT_USAGE);
    }

    #[test]
    fn test_flag_repairs_environment_thresholds() {
        // KMX_MAX_COUNT=3 alone sits below the default min of 5
        let env = |name: &str| (name == "KMX_MAX_COUNT").then(|| "3".to_string());
        let err = parse(&[]).unwrap().load_config_with(env).unwrap_err();
        assert!(matches!(err, KmxError::InvalidThresholds { min: 5, max: 3 }));

        let manager = parse(&["--min", "1"]).unwrap().load_config_with(env).unwrap();
        assert_eq!(manager.config().matrix.min_count, 1);
        assert_eq!(manager.config().matrix.max_count, Some(3));
    }

    #[test]
    fn test_later_layers_repair_config_file_thresholds() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[matrix]\nmax_count = 3\n").unwrap();
        file.flush().unwrap();
        let config_path = file.path().to_str().unwrap();

        let env = |name: &str| (name == "KMX_MIN_COUNT").then(|| "2".to_string());
        let manager = parse(&["--config", config_path]).unwrap().load_config_with(env).unwrap();
        assert_eq!(manager.config().matrix.min_count, 2);
        assert_eq!(manager.config().matrix.max_count, Some(3));

        let err = parse(&["--config", config_path, "--min", "4"]).unwrap().load_config_with(env).unwrap_err();
        assert!(matches!(err, KmxError::InvalidThresholds { min: 4, max: 3 }));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&KmxError::config("bad")), EXIT_USAGE);
        assert_eq!(exit_code(&KmxError::io_error("disk")), EXIT_FAILURE);
        assert_eq!(exit_code(&KmxError::OutOfMemory(10)), EXIT_FAILURE);
    }
}
