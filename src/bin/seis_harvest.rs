use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use seis_harvest::app::{self, App};
use seis_harvest::config::ConfigLoader;
use seis_harvest::error::HarvestError;
use seis_harvest::fdsn::FdsnHttpClient;
use seis_harvest::output::{ConsoleOutput, JsonOutput, OutputMode};
use seis_harvest::preprocess::StandardPreprocessor;
use seis_harvest::store::Store;

#[derive(Parser)]
#[command(name = "seis-harvest")]
#[command(about = "Chunked, resumable download of continuous seismic waveforms from FDSN data centres")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download every chunk of the configured time range")]
    Download(DownloadArgs),
    #[command(about = "Show chunk windows and the memory estimate without downloading")]
    Plan(PlanArgs),
    #[command(about = "List the stations and waveforms held by an archive or a directory of archives")]
    Inspect(InspectArgs),
}

#[derive(Args)]
struct DownloadArgs {
    #[arg(long)]
    config: Option<String>,

    /// Directory receiving station.csv and the chunk archives.
    #[arg(long, default_value = "RAW_DATA")]
    dir: Utf8PathBuf,
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long)]
    config: Option<String>,
}

#[derive(Args)]
struct InspectArgs {
    path: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::Config(_)
        | HarvestError::MissingConfig
        | HarvestError::ConfigRead(_)
        | HarvestError::ConfigParse(_)
        | HarvestError::MissingInput(_) => 2,
        HarvestError::FdsnHttp(_)
        | HarvestError::FdsnStatus { .. }
        | HarvestError::EmptyInventory => 3,
        HarvestError::ResourceBudget { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Download(args) => run_download(args, output_mode),
        Commands::Plan(args) => run_plan(args, output_mode),
        Commands::Inspect(args) => run_inspect(args, output_mode),
    }
}

fn run_download(args: DownloadArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let client = FdsnHttpClient::new(&config.service, config.timeout, config.request_timeout)?;
    let app = App::new(Store::new(args.dir), client, StandardPreprocessor);

    match output_mode {
        OutputMode::NonInteractive => {
            let report = app.download(&config, &JsonOutput)?;
            JsonOutput::print_download(&report).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            let report = app.download(&config, &ConsoleOutput)?;
            ConsoleOutput::print_download(&report);
        }
    }
    Ok(())
}

fn run_plan(args: PlanArgs, output_mode: OutputMode) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let report = app::plan(&config)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_plan(&report).into_diagnostic()?,
        OutputMode::Interactive => ConsoleOutput::print_plan(&report),
    }
    Ok(())
}

fn run_inspect(args: InspectArgs, output_mode: OutputMode) -> miette::Result<()> {
    let archives = if args.path.is_dir() {
        Store::new(args.path).list_archives()?
    } else {
        vec![args.path]
    };
    let reports = archives
        .iter()
        .map(|path| app::inspect(path))
        .collect::<Result<Vec<_>, _>>()?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_inspect(&reports).into_diagnostic()?,
        OutputMode::Interactive => ConsoleOutput::print_inspect(&reports),
    }
    Ok(())
}
