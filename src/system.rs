//! System integration and resource monitoring
//!
//! Memory sampling for peak-usage reporting, temporary directory space checks
//! and a host snapshot logged at startup.

use crate::config::MemorySource;
use crate::error::{KmxError, Result};
use crate::logging::MetricsCollector;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{Disks, System};
use tracing::{debug, info, warn};

const BYTES_PER_GB: f64 = (1024u64 * 1024 * 1024) as f64;
const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Source of "bytes currently in use" readings
pub trait MemoryProbe: Send {
    fn name(&self) -> &'static str;

    fn sample(&mut self) -> Result<u64>;
}

/// Host memory in use, as reported by the OS
pub struct HostMemoryProbe {
    system: System,
}

impl HostMemoryProbe {
    pub fn new() -> Self {
        Self { system: System::new() }
    }
}

impl Default for HostMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for HostMemoryProbe {
    fn name(&self) -> &'static str {
        "host"
    }

    fn sample(&mut self) -> Result<u64> {
        self.system.refresh_memory();
        Ok(self.system.used_memory())
    }
}

/// Device memory in use, queried through `nvidia-smi`
///
/// With several GPUs the largest reading is taken.
pub struct DeviceMemoryProbe {
    program: PathBuf,
}

impl DeviceMemoryProbe {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("nvidia-smi"),
        }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for DeviceMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for DeviceMemoryProbe {
    fn name(&self) -> &'static str {
        "device"
    }

    fn sample(&mut self) -> Result<u64> {
        let output = Command::new(&self.program)
            .args(["--query-gpu=memory.used", "--format=csv,noheader,nounits"])
            .output()
            .map_err(|e| KmxError::io_error(format!("Failed to run '{}': {}", self.program.display(), e)))?;

        if !output.status.success() {
            return Err(KmxError::io_error(format!(
                "'{}' exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_device_memory(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `nvidia-smi` memory output: one MiB value per GPU, largest wins
pub fn parse_device_memory(output: &str) -> Result<u64> {
    let mut peak = None;
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mib: u64 = line
            .parse()
            .map_err(|_| KmxError::io_error(format!("Unexpected nvidia-smi memory reading '{}'", line)))?;
        peak = Some(peak.map_or(mib, |p: u64| p.max(mib)));
    }
    peak.map(|mib| mib * BYTES_PER_MIB)
        .ok_or_else(|| KmxError::io_error("nvidia-smi reported no GPUs"))
}

/// Pick the probe for the configured source
pub fn memory_probe(source: MemorySource, gpu_enabled: bool) -> Box<dyn MemoryProbe> {
    match source {
        MemorySource::Device => Box::new(DeviceMemoryProbe::new()),
        MemorySource::Host => Box::new(HostMemoryProbe::new()),
        MemorySource::Auto if gpu_enabled => Box::new(DeviceMemoryProbe::new()),
        MemorySource::Auto => Box::new(HostMemoryProbe::new()),
    }
}

/// Background sampler tracking peak memory use
///
/// The thread samples once immediately and then every `interval` until
/// [`MemoryMonitor::stop`] signals it and joins.
pub struct MemoryMonitor {
    peak: Arc<AtomicU64>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryMonitor {
    pub fn start(probe: Box<dyn MemoryProbe>, interval: Duration) -> Result<Self> {
        Self::spawn(probe, interval, None)
    }

    /// Like [`MemoryMonitor::start`], also feeding the peak into `metrics`
    pub fn start_with_metrics(
        probe: Box<dyn MemoryProbe>,
        interval: Duration,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        Self::spawn(probe, interval, Some(metrics))
    }

    fn spawn(
        mut probe: Box<dyn MemoryProbe>,
        interval: Duration,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        let peak = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let thread_peak = Arc::clone(&peak);

        let handle = thread::Builder::new()
            .name("kmx-memory-monitor".to_string())
            .spawn(move || {
                debug!(probe = probe.name(), interval = ?interval, "Memory monitor started");
                loop {
                    match probe.sample() {
                        Ok(used) => {
                            thread_peak.fetch_max(used, Ordering::Relaxed);
                            if let Some(metrics) = &metrics {
                                metrics.update_peak_memory(used);
                            }
                        }
                        Err(e) => debug!(probe = probe.name(), error = %e, "Memory sample skipped"),
                    }

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Memory monitor stopped");
            })
            .map_err(|e| KmxError::Thread(format!("Failed to spawn memory monitor: {}", e)))?;

        Ok(Self {
            peak,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Highest reading so far, in bytes
    pub fn peak_bytes(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Signal the sampler, wait for it to exit and return the final peak
    pub fn stop(mut self) -> Result<u64> {
        self.shutdown()?;
        Ok(self.peak_bytes())
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| KmxError::Thread("Memory monitor thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Memory monitor did not shut down cleanly");
        }
    }
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Create `dir` (and parents) if missing
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        KmxError::io_error(format!("Could not create directory '{}': {}", dir.display(), e))
    })
}

/// Free space on the filesystem holding `dir`, in GB.
///
/// `None` when no mounted disk contains the path.
pub fn available_space_gb(dir: &Path) -> Result<Option<f64>> {
    let dir = dir.canonicalize()?;
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|disk| dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len());

    Ok(disk.map(|disk| bytes_to_gb(disk.available_space())))
}

/// Make sure the temporary directory exists and has `min_free_gb` available
pub fn check_temp_space(dir: &Path, min_free_gb: f64) -> Result<()> {
    ensure_dir(dir)?;

    match available_space_gb(dir)? {
        Some(available_gb) if available_gb < min_free_gb => Err(KmxError::InsufficientSpace {
            path: dir.to_path_buf(),
            available_gb,
            required_gb: min_free_gb,
        }),
        Some(available_gb) => {
            info!(
                path = %dir.display(),
                available_gb = format!("{:.2}", available_gb),
                "Temporary directory has sufficient space"
            );
            Ok(())
        }
        None => {
            warn!(path = %dir.display(), "Could not determine free space for temporary directory");
            Ok(())
        }
    }
}

/// Host snapshot logged at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub host_name: Option<String>,
    pub os_version: Option<String>,
    pub cpu_count: usize,
    pub total_memory: u64,
    pub available_memory: u64,
    pub process_memory: u64,
}

impl SystemInfo {
    pub fn collect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();

        let process_memory = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                system.refresh_process(pid);
                system.process(pid).map(|p| p.memory())
            })
            .unwrap_or(0);

        Self {
            host_name: System::host_name(),
            os_version: System::long_os_version(),
            cpu_count: system.cpus().len(),
            total_memory: system.total_memory(),
            available_memory: system.available_memory(),
            process_memory,
        }
    }

    pub fn log(&self) {
        info!(
            host = self.host_name.as_deref().unwrap_or("unknown"),
            os = self.os_version.as_deref().unwrap_or("unknown"),
            cpus = self.cpu_count,
            total_memory_gb = format!("{:.2}", bytes_to_gb(self.total_memory)),
            available_memory_gb = format!("{:.2}", bytes_to_gb(self.available_memory)),
            "System information"
        );
    }
}
