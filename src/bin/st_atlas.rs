use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use st_atlas_datasets::archive;
use st_atlas_datasets::config::{ConfigLoader, ResolvedConfig};
use st_atlas_datasets::domain::{Policy, ResourceEntry};
use st_atlas_datasets::error::AtlasError;
use st_atlas_datasets::manager::{BatchStatus, DownloadManager};
use st_atlas_datasets::output::{ChecksumResult, ClearResult, DetectResult, JsonOutput};
use st_atlas_datasets::progress::{ProgressSink, TracingProgress};
use st_atlas_datasets::store::Store;

#[derive(Parser)]
#[command(name = "st-atlas")]
#[command(about = "Fetch, verify and unpack spatial transcriptomics dataset files")]
#[command(version)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON config file (default: ./st-atlas.json if present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Cache directory, overrides config and environment
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download, verify and extract resources")]
    Fetch(FetchArgs),
    #[command(about = "Print the MD5 of a downloaded or local resource")]
    Checksum(ChecksumArgs),
    #[command(about = "Report the archive format of a file")]
    Detect(DetectArgs),
    #[command(about = "Delete the whole cache directory")]
    Clear,
}

#[derive(Args)]
struct FetchArgs {
    /// URIs or local paths; defaults to `resources` from the config file
    resources: Vec<String>,

    #[arg(long)]
    download_policy: Option<Policy>,

    #[arg(long)]
    extract_policy: Option<Policy>,

    #[arg(long)]
    no_validate: bool,

    #[arg(long)]
    workers: Option<usize>,

    /// Fail unless every resource succeeded
    #[arg(long)]
    strict: bool,

    /// No progress logging
    #[arg(long)]
    quiet: bool,
}

#[derive(Args)]
struct ChecksumArgs {
    resource: String,
}

#[derive(Args)]
struct DetectArgs {
    path: PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<AtlasError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AtlasError) -> u8 {
    match error {
        AtlasError::InvalidResource(_)
        | AtlasError::MissingLocalFile(_)
        | AtlasError::DownloadDisallowed(_)
        | AtlasError::ConfigRead(_)
        | AtlasError::ConfigParse(_)
        | AtlasError::InvalidConfig(_) => 2,
        AtlasError::Fetch { .. } | AtlasError::Http(_) | AtlasError::ChecksumMismatch { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut resolved = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        resolved.download.cache_dir = dir.into();
    }

    match cli.command {
        Commands::Fetch(args) => run_fetch(args, resolved),
        Commands::Checksum(args) => {
            let manager = DownloadManager::new(resolved.download)?;
            let md5 = manager.compute_checksum(args.resource.as_str())?;
            JsonOutput::print_checksum(&ChecksumResult {
                uri: args.resource,
                md5,
            })
            .into_diagnostic()
        }
        Commands::Detect(args) => {
            let format = archive::detect_format(&args.path)?;
            JsonOutput::print_detect(&DetectResult {
                path: args.path,
                format,
            })
            .into_diagnostic()
        }
        Commands::Clear => {
            let store = Store::new(resolved.download.cache_dir);
            let removed = store.clear()?;
            JsonOutput::print_clear(&ClearResult {
                root: store.root().to_string(),
                removed,
            })
            .into_diagnostic()
        }
    }
}

fn run_fetch(args: FetchArgs, resolved: ResolvedConfig) -> miette::Result<()> {
    let ResolvedConfig {
        download: mut config,
        resources,
    } = resolved;
    if let Some(policy) = args.download_policy {
        config.download_policy = policy;
    }
    if let Some(policy) = args.extract_policy {
        config.extract_policy = policy;
    }
    if args.no_validate {
        config.validate_checksums = false;
    }
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err(AtlasError::InvalidConfig("--workers must be greater than zero".into()).into());
        }
        config.max_workers = workers;
    }

    let entries: BTreeMap<String, ResourceEntry> = if args.resources.is_empty() {
        resources
    } else {
        args.resources
            .into_iter()
            .map(|uri| (uri.clone(), ResourceEntry::Shorthand(uri)))
            .collect()
    };
    if entries.is_empty() {
        return Err(miette::Report::msg(
            "no resources given (pass URIs or add `resources` to st-atlas.json)",
        ));
    }

    let sink: Arc<dyn ProgressSink> = if args.quiet || !config.show_progress {
        Arc::new(JsonOutput)
    } else {
        Arc::new(TracingProgress::new())
    };
    let manager = DownloadManager::new(config)?.with_progress(sink);
    let report = manager.download_and_extract_batch(entries);
    JsonOutput::print_batch(&report).into_diagnostic()?;

    match report.status() {
        BatchStatus::AllSucceeded => Ok(()),
        BatchStatus::PartialSuccess if !args.strict => {
            tracing::warn!(
                failed = report.failures().count(),
                total = report.len(),
                "some resources failed"
            );
            Ok(())
        }
        _ => {
            if report.len() == 1 {
                if let Some((_, err)) = report.failures().next() {
                    return Err(err.clone().into());
                }
            }
            report.into_result()?;
            Ok(())
        }
    }
}
