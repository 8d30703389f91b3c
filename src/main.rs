use clap::Parser;
use kmx::builder::MatrixBuilder;
use kmx::cli::{exit_code, Cli, EXIT_SUCCESS};
use kmx::config::ConfigManager;
use kmx::error::Result;
use kmx::genome_list::GenomeList;
use kmx::logging::LoggingSystem;
use kmx::oracle::GerbilCounter;
use kmx::output::{OutputManager, RunContext, RunMeasurements};
use kmx::system::{check_temp_space, memory_probe, MemoryMonitor, SystemInfo};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;
use tracing::{error, info};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let manager = match cli.load_config() {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(exit_code(&e));
        }
    };

    let logging = match LoggingSystem::init(&manager.config().logging) {
        Ok(logging) => logging,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(exit_code(&e));
        }
    };

    let status = match run(&cli, &manager, &logging) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            if let Some(stderr) = e.oracle_stderr() {
                error!(stderr = %stderr, "K-mer counter diagnostics");
            }
            error!(error = %e, "KMX run failed");
            exit_code(&e)
        }
    };

    logging.log_metrics_summary();
    ExitCode::from(status)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn run(cli: &Cli, manager: &ConfigManager, logging: &LoggingSystem) -> Result<()> {
    let config = manager.config();
    SystemInfo::collect().log();

    let genome_list_path = absolute(&cli.genome_list)?;
    let tmp_dir = absolute(&cli.tmp)?;
    let output_dir = absolute(&cli.output)?;

    let genomes = GenomeList::from_file(&genome_list_path)?;
    let params = manager.to_matrix_params(&genomes)?;

    check_temp_space(&tmp_dir, config.system.min_free_tmp_gb)?;
    let output = OutputManager::new(&output_dir, &params, config.output.clone())?;

    let gpu_enabled = config.oracle.enable_gpu;
    info!(
        genomes = genomes.len(),
        k = params.kmer_size,
        min = params.min_count,
        max = params.max_count,
        normalize = params.normalize,
        gpu = gpu_enabled,
        "Starting k-mer matrix build"
    );

    let counter = GerbilCounter::new(&config.oracle.executable, &tmp_dir)
        .enable_gpu(gpu_enabled)
        .timeout(config.oracle.timeout())
        .prepend_conda_lib(config.oracle.prepend_conda_lib);
    counter.check_executable()?;

    let metrics = logging.metrics();
    let probe = memory_probe(config.system.memory_source, gpu_enabled);
    let context = RunContext::new(&genome_list_path, &tmp_dir, gpu_enabled)
        .with_run_id(metrics.run_id())
        .with_memory_source(probe.name());
    let monitor = MemoryMonitor::start_with_metrics(probe, config.system.memory_check_interval, metrics.clone())?;

    let started = Instant::now();
    let build = MatrixBuilder::new(&counter, params).with_metrics(metrics).build(&genomes);
    let elapsed = started.elapsed();
    let peak_memory_bytes = monitor.stop()?;
    let build = build?;

    let measurements = RunMeasurements {
        elapsed,
        peak_memory_bytes,
    };
    output.write_all(&build, &params, &context, &measurements)?;

    info!(
        sparsity = build.sparsity.observed_sparsity_percent,
        elapsed = ?elapsed,
        output = %output.output_dir().display(),
        "KMX run completed"
    );
    Ok(())
}
