//! Configuration management for KMX
//!
//! Settings are layered: built-in defaults, then an optional TOML/YAML/JSON
//! file, then `KMX_*` environment variables, then command line flags. Each
//! layer only checks that its values parse; the merged result is validated
//! once, so a later layer can repair what an earlier one left inconsistent.

use crate::builder::MatrixParams;
use crate::error::{KmxError, Result};
use crate::genome_list::GenomeList;
use crate::logging::{LogLevel, LoggingConfig};
use crate::sparsity::DEFAULT_DENSITY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

pub const MIN_KMER_SIZE: usize = 8;
pub const MAX_KMER_SIZE: usize = 136;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KmxConfig {
    pub logging: LoggingConfig,
    pub matrix: MatrixSettings,
    pub oracle: OracleSettings,
    pub system: SystemSettings,
    pub output: OutputSettings,
}

/// Matrix assembly settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MatrixSettings {
    /// K-mer length
    #[validate(range(min = 8, max = 136))]
    pub kmer_size: usize,

    /// Minimum global occurrence count for a k-mer to be retained
    #[validate(range(min = 1))]
    pub min_count: u64,

    /// Maximum global occurrence count (None = half the genome count)
    #[validate(range(min = 1))]
    pub max_count: Option<u64>,

    /// Keep a k-mer and its reverse complement as distinct features
    pub disable_normalization: bool,

    /// Expected fraction of non-zero cells, used to size the initial buffers
    pub initial_density: f64,

    /// Log progress every this many genomes
    #[validate(range(min = 1))]
    pub progress_interval: usize,
}

impl Default for MatrixSettings {
    fn default() -> Self {
        Self {
            kmer_size: 31,
            min_count: 5,
            max_count: None,
            disable_normalization: false,
            initial_density: DEFAULT_DENSITY,
            progress_interval: 1000,
        }
    }
}

/// Counting oracle settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct OracleSettings {
    /// Path or name of the counter binary
    pub executable: PathBuf,

    /// Pass the GPU flag to the counter
    pub enable_gpu: bool,

    /// Kill a counter run that takes longer than this
    #[validate(range(min = 1))]
    pub timeout_secs: Option<u64>,

    /// Prepend `$CONDA_PREFIX/lib` to the counter's library path
    pub prepend_conda_lib: bool,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("gerbil"),
            enable_gpu: true,
            timeout_secs: None,
            prepend_conda_lib: true,
        }
    }
}

impl OracleSettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Where the memory sampler reads usage from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    /// Device memory when the GPU is enabled, host memory otherwise
    Auto,
    Device,
    Host,
}

/// System resource settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SystemSettings {
    /// Memory sampling interval
    #[serde(with = "duration_serde")]
    pub memory_check_interval: Duration,

    /// Free space required in the temporary directory, in GB
    #[validate(range(min = 0.0))]
    pub min_free_tmp_gb: f64,

    pub memory_source: MemorySource,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            memory_check_interval: Duration::from_secs(1),
            min_free_tmp_gb: 10.0,
            memory_source: MemorySource::Auto,
        }
    }
}

/// Output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Write the JSON run metadata file
    pub write_metadata: bool,
    /// Write SHA-256 checksums of every output file
    pub generate_checksums: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            write_metadata: true,
            generate_checksums: true,
        }
    }
}

impl KmxConfig {
    /// Validate every section plus cross-field rules
    pub fn validate(&self) -> Result<()> {
        self.matrix
            .validate()
            .map_err(|e| KmxError::config(format!("Invalid matrix settings: {}", e)))?;
        self.oracle
            .validate()
            .map_err(|e| KmxError::config(format!("Invalid oracle settings: {}", e)))?;
        self.system
            .validate()
            .map_err(|e| KmxError::config(format!("Invalid system settings: {}", e)))?;

        if let Some(max) = self.matrix.max_count {
            if max < self.matrix.min_count {
                return Err(KmxError::InvalidThresholds {
                    min: self.matrix.min_count,
                    max,
                });
            }
        }
        let density = self.matrix.initial_density;
        if !(density > 0.0 && density <= 1.0) {
            return Err(KmxError::config(format!("initial_density must be in (0, 1], got {}", density)));
        }
        if self.system.memory_check_interval.is_zero() {
            return Err(KmxError::config("memory_check_interval must be positive"));
        }
        Ok(())
    }
}

/// Layered configuration loader
#[derive(Debug)]
pub struct ConfigManager {
    config: KmxConfig,
}

impl ConfigManager {
    /// Start from defaults
    pub fn new() -> Self {
        Self {
            config: KmxConfig::default(),
        }
    }

    /// Load configuration from a `.toml`, `.yaml`/`.yml` or `.json` file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| KmxError::io_error(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: KmxConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| KmxError::config(format!("TOML parse error: {}", e)))?
            }
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| KmxError::config(format!("YAML parse error: {}", e)))?
            }
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| KmxError::config(format!("JSON parse error: {}", e)))?
            }
            _ => {
                return Err(KmxError::config(
                    "Unsupported config file format. Use .toml, .yaml, .yml, or .json",
                ))
            }
        };

        Ok(Self { config })
    }

    /// Apply `KMX_*` overrides from any variable source
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = &mut self.config;

        if let Some(k) = parse_var(&lookup, "KMX_KMER_SIZE")? {
            config.matrix.kmer_size = k;
        }
        if let Some(min) = parse_var(&lookup, "KMX_MIN_COUNT")? {
            config.matrix.min_count = min;
        }
        if let Some(max) = parse_var(&lookup, "KMX_MAX_COUNT")? {
            config.matrix.max_count = Some(max);
        }
        if let Some(density) = parse_var(&lookup, "KMX_DENSITY")? {
            config.matrix.initial_density = density;
        }
        if let Some(oracle) = lookup("KMX_ORACLE") {
            config.oracle.executable = PathBuf::from(oracle);
        }
        if let Some(timeout) = parse_var(&lookup, "KMX_ORACLE_TIMEOUT")? {
            config.oracle.timeout_secs = Some(timeout);
        }
        if let Some(level) = parse_var::<LogLevel, _>(&lookup, "KMX_LOG_LEVEL")? {
            config.logging.level = level;
        }
        if let Some(json) = parse_var(&lookup, "KMX_JSON_LOGS")? {
            config.logging.json_format = json;
        }
        Ok(())
    }

    pub fn config(&self) -> &KmxConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut KmxConfig {
        &mut self.config
    }

    /// Save current configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::to_string_pretty(&self.config)
                .map_err(|e| KmxError::config(format!("TOML serialize error: {}", e)))?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(&self.config)
                .map_err(|e| KmxError::config(format!("YAML serialize error: {}", e)))?,
            Some("json") => serde_json::to_string_pretty(&self.config)
                .map_err(|e| KmxError::config(format!("JSON serialize error: {}", e)))?,
            _ => {
                return Err(KmxError::config(
                    "Unsupported config file format. Use .toml, .yaml, .yml, or .json",
                ))
            }
        };

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve matrix parameters for a genome list, filling the default upper bound
    pub fn to_matrix_params(&self, genomes: &GenomeList) -> Result<MatrixParams> {
        let settings = &self.config.matrix;
        let params = MatrixParams {
            kmer_size: settings.kmer_size,
            min_count: settings.min_count,
            max_count: settings.max_count.unwrap_or_else(|| genomes.default_max_count()),
            normalize: !settings.disable_normalization,
            initial_density: settings.initial_density,
            progress_interval: settings.progress_interval,
        };
        params.validate()?;
        Ok(params)
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| KmxError::config(format!("Invalid {}: {}", name, e))),
    }
}

/// Durations are stored as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn genomes(n: usize) -> GenomeList {
        let content: String = (0..n).map(|i| format!("g{}.fa\n", i)).collect();
        GenomeList::from_reader(Cursor::new(content), Path::new("list.txt")).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = KmxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.matrix.min_count, 5);
        assert_eq!(config.oracle.executable, PathBuf::from("gerbil"));
    }

    #[test]
    fn test_config_serialization() {
        let config = KmxConfig::default();

        let toml_str = toml::to_string(&config).unwrap();
        let _: KmxConfig = toml::from_str(&toml_str).unwrap();

        let json_str = serde_json::to_string(&config).unwrap();
        let _: KmxConfig = serde_json::from_str(&json_str).unwrap();

        let yaml_str = serde_yaml::to_string(&config).unwrap();
        let _: KmxConfig = serde_yaml::from_str(&yaml_str).unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[matrix]\nkmer_size = 21\nmax_count = 40\n").unwrap();
        file.flush().unwrap();

        let manager = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(manager.config().matrix.kmer_size, 21);
        assert_eq!(manager.config().matrix.max_count, Some(40));
        assert_eq!(manager.config().matrix.min_count, 5);
        assert!(manager.config().oracle.enable_gpu);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::new().unwrap();
        assert!(ConfigManager::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let vars: HashMap<&str, &str> = [
            ("KMX_KMER_SIZE", "25"),
            ("KMX_MAX_COUNT", "100"),
            ("KMX_LOG_LEVEL", "debug"),
            ("KMX_JSON_LOGS", "true"),
            ("KMX_ORACLE", "/opt/gerbil/bin/gerbil"),
            ("KMX_ORACLE_TIMEOUT", "600"),
        ]
        .into_iter()
        .collect();

        let mut manager = ConfigManager::new();
        manager.apply_overrides(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        let config = manager.config();
        assert_eq!(config.matrix.kmer_size, 25);
        assert_eq!(config.matrix.max_count, Some(100));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.logging.json_format);
        assert_eq!(config.oracle.executable, PathBuf::from("/opt/gerbil/bin/gerbil"));
        assert_eq!(config.oracle.timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_invalid_environment_value() {
        let mut manager = ConfigManager::new();
        let err = manager
            .apply_overrides(|name| (name == "KMX_KMER_SIZE").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("KMX_KMER_SIZE"));
    }

    #[test]
    fn test_layers_defer_cross_field_checks() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[matrix]\nmin_count = 9\nmax_count = 3\n").unwrap();
        file.flush().unwrap();
        let mut manager = ConfigManager::load_from_file(file.path()).unwrap();
        assert!(manager.config().validate().is_err());

        manager
            .apply_overrides(|name| (name == "KMX_MIN_COUNT").then(|| "2".to_string()))
            .unwrap();
        assert!(manager.config().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = KmxConfig::default();

        config.matrix.kmer_size = 7;
        assert!(config.validate().is_err());
        config.matrix.kmer_size = 136;
        assert!(config.validate().is_ok());

        config.matrix.max_count = Some(2);
        assert!(matches!(config.validate(), Err(KmxError::InvalidThresholds { min: 5, max: 2 })));
        config.matrix.max_count = None;

        config.matrix.initial_density = 0.0;
        assert!(config.validate().is_err());
        config.matrix.initial_density = 0.01;

        config.oracle.timeout_secs = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_matrix_params_default_max() {
        let manager = ConfigManager::new();
        let params = manager.to_matrix_params(&genomes(30)).unwrap();
        assert_eq!(params.max_count, 15);
        assert!(params.normalize);

        let params = manager.to_matrix_params(&genomes(3));
        // min_count 5 exceeds the default max of 1
        assert!(matches!(params, Err(KmxError::InvalidThresholds { .. })));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kmx.yaml");

        let mut manager = ConfigManager::new();
        manager.config_mut().matrix.kmer_size = 17;
        manager.config_mut().system.memory_source = MemorySource::Host;
        manager.save_to_file(&path).unwrap();

        let loaded = ConfigManager::load_from_file(&path).unwrap();
        assert_eq!(loaded.config().matrix.kmer_size, 17);
        assert_eq!(loaded.config().system.memory_source, MemorySource::Host);
    }
}
