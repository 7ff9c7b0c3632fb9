//! Command-line entry point.
//!
//! ```bash
//! trace_capture --config config/trace_capture.toml identify
//! trace_capture spectrum --resource TCPIP0::192.168.10.2::5025::SOCKET
//! trace_capture scope --captures 50 --output data/
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use trace_capture::{
    acquisition::build_controller,
    clock::{Clock, SystemClock},
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging,
    storage::{archive_path, write_archive, TraceArchive},
    with_session, ConnectionDescriptor, InstrumentFamily, TraceBatch,
};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[clap(short, long, value_parser, default_value = DEFAULT_CONFIG_PATH, value_hint = clap::ValueHint::FilePath)]
    config: PathBuf,

    /// Override instrument.resource
    #[clap(short, long, value_parser)]
    resource: Option<String>,

    /// Override application.log_level
    #[clap(long, value_parser)]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query *IDN? and exit
    Identify,
    /// Acquire one spectrum analyser trace
    Spectrum(OutputConf),
    /// Acquire a batch of oscilloscope captures
    Scope(ScopeConf),
}

#[derive(Args)]
struct OutputConf {
    /// Directory archives are written to (overrides storage.output_dir)
    #[clap(short, long, value_parser, value_hint = clap::ValueHint::DirPath)]
    output: Option<PathBuf>,

    /// Do not write an archive
    #[clap(long)]
    no_save: bool,
}

#[derive(Args)]
struct ScopeConf {
    /// Number of captures (overrides scope.captures)
    #[clap(short = 'n', long, value_parser)]
    captures: Option<usize>,

    #[clap(flatten)]
    output: OutputConf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::extract(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(resource) = &cli.resource {
        config.instrument.resource = resource.clone();
    }
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    if let Commands::Scope(conf) = &cli.command {
        if let Some(captures) = conf.captures {
            config.scope.captures = captures;
        }
    }
    config.validate().context("Invalid configuration")?;

    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let descriptor: ConnectionDescriptor = config
        .instrument
        .resource
        .parse()
        .context("Invalid instrument.resource")?;

    match &cli.command {
        Commands::Identify => {
            let identity = with_session(&descriptor, config.instrument.timeout(), |session| {
                anyhow::Ok(session.identity().to_string())
            })?;
            println!("{}", identity);
            Ok(())
        }
        Commands::Spectrum(output) => {
            acquire(&config, &descriptor, InstrumentFamily::SpectrumAnalyzer, output)
        }
        Commands::Scope(conf) => {
            acquire(&config, &descriptor, InstrumentFamily::Oscilloscope, &conf.output)
        }
    }
}

fn acquire(
    config: &AppConfig,
    descriptor: &ConnectionDescriptor,
    family: InstrumentFamily,
    output: &OutputConf,
) -> Result<()> {
    if family != config.instrument.family {
        warn!(
            "Running {} acquisition against an instrument configured as {}",
            family, config.instrument.family
        );
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut controller = build_controller(family, &config.spectrum, &config.scope, clock);

    let (identity, batch) = with_session(descriptor, config.instrument.timeout(), |session| {
        let batch = controller
            .run(session)
            .with_context(|| format!("{} acquisition failed", family))?;
        anyhow::Ok((session.identity().to_string(), batch))
    })?;

    report(&batch);

    if output.no_save || !config.storage.enabled {
        info!("Archive disabled, {} trace(s) discarded", batch.len());
        return Ok(());
    }
    if batch.is_empty() {
        bail!("No traces captured, nothing to save");
    }

    let dir = output
        .output
        .clone()
        .unwrap_or_else(|| config.storage.output_dir.clone());
    let archive = TraceArchive::from_batch(&batch, family, &identity, &descriptor.to_string())?;
    let path = archive_path(&dir, family);
    write_archive(&archive, &path)
        .with_context(|| format!("Failed to write archive {}", path.display()))?;
    println!("{}", path.display());
    Ok(())
}

fn report(batch: &TraceBatch) {
    match &batch.stop_reason {
        Some(reason) => error!(
            "Batch stopped after {}/{} trace(s): {}",
            batch.len(),
            batch.requested,
            reason
        ),
        None => info!("Captured {}/{} trace(s)", batch.len(), batch.requested),
    }
}
