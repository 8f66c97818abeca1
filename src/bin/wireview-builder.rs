//! wireview-builder command line entry point.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use wireview_builder::cache::{KERNEL_TREE, MATCHED_SOURCE, RELEASE_ARCHIVE, UPSTREAM_SOURCE};
use wireview_builder::config::DEFAULT_CONFIG_FILE;
use wireview_builder::{
    preflight, BuildRequest, CacheStore, CancelToken, EnvOverrides, ErrorClass, HttpFetcher,
    Pipeline, PipelineContext, Settings, SystemHost, TargetVersion,
};

const EXIT_FAILURE: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "wireview-builder")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build the WireView hwmon plugin package for an Unraid release", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve, configure, build and package
    Build {
        #[command(flatten)]
        common: CommonArgs,

        /// Plugin version recorded in the package name, e.g. 2026.02.27
        #[arg(long)]
        package_version: String,

        /// Output directory for the package
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Abort the whole run after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Keep the per-run work directory
        #[arg(long)]
        keep_workdir: bool,

        /// Skip the host tool check
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Acquire the release and print its kernel version
    Resolve {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Inspect the artifact cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Unraid release, e.g. 7.2.4
    #[arg(long)]
    target: String,

    /// Download the release from this URL instead of the lookup table
    #[arg(long)]
    url: Option<String>,

    /// Config file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Entry counts and size per kind
    Status {
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Drop one entry so the next run fetches or prepares it again
    Purge {
        #[command(flatten)]
        store: StoreArgs,

        /// Entry kind
        #[arg(value_parser = [RELEASE_ARCHIVE, MATCHED_SOURCE, UPSTREAM_SOURCE, KERNEL_TREE])]
        kind: String,

        /// Entry key, e.g. 7.2.4 or 6.12.54-Unraid
        key: String,
    },
}

#[derive(Args)]
struct StoreArgs {
    /// Config file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

impl StoreArgs {
    fn open(self) -> Result<CacheStore> {
        let settings = load_settings(&self.config, self.cache_dir)?;
        Ok(CacheStore::open(&settings.cache_dir)?)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let cancelled = e
                .downcast_ref::<wireview_builder::Error>()
                .is_some_and(|e| e.class() == ErrorClass::Cancelled);
            ExitCode::from(if cancelled { EXIT_CANCELLED } else { EXIT_FAILURE })
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn execute(command: Commands) -> Result<()> {
    match command {
        Commands::Build {
            common,
            package_version,
            output_dir,
            timeout,
            keep_workdir,
            skip_preflight,
        } => {
            let mut settings = load_settings(&common.config, common.cache_dir.clone())?;
            if let Some(dir) = output_dir {
                settings.output_dir = dir;
            }
            if let Some(secs) = timeout {
                settings.run_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            if skip_preflight {
                tracing::warn!("skipping host tool check");
            } else {
                preflight::check_host_tools()?;
            }

            let mut pipeline = build_pipeline(settings)?;
            if keep_workdir {
                pipeline.context_mut().keep_workdir();
            }
            let report = pipeline.run(&BuildRequest {
                target: target(&common),
                package_version,
            })?;

            for attempt in &report.attempts {
                tracing::debug!(tier = %attempt.tier, "skipped: {}", attempt.reason);
            }
            for warning in &report.warnings {
                eprintln!("WARNING: {warning}");
            }
            println!("kernel:  {}", report.kernel_version);
            println!("config:  {} from {}", report.tier, report.config_origin);
            println!("package: {}", report.package.path.display());
            println!("size:    {} bytes", report.package.size_bytes);
            println!("sha256:  {}", report.package.sha256);
            Ok(())
        }

        Commands::Resolve { common } => {
            let settings = load_settings(&common.config, common.cache_dir.clone())?;
            let pipeline = build_pipeline(settings)?;
            let report = pipeline.resolve(&target(&common))?;
            let resolved = &report.resolved;
            println!("release: {} ({})", report.release.url, report.release.path.display());
            println!("modules: {} [{}]", report.module_tree.entry_name, report.module_tree.format);
            println!("kernel:  {}", resolved.version);
            println!(
                "layout:  {} ({})",
                resolved.layout.name,
                resolved.module_dir.display()
            );
            if resolved.candidates.len() > 1 {
                println!("others:  {}", resolved.candidates[1..].join(", "));
            }
            Ok(())
        }

        Commands::Cache {
            command: CacheCommands::Status { store },
        } => {
            let status = store.open()?.status()?;
            println!("cache: {}", status.root.display());
            for (kind, count) in &status.entries {
                println!("  {kind:<24} {count}");
            }
            println!("  total {} bytes", status.total_bytes);
            Ok(())
        }

        Commands::Cache {
            command: CacheCommands::Purge { store, kind, key },
        } => {
            let cache = store.open()?;
            if cache.get(&kind, &key)?.is_none() {
                println!("no entry {kind}:{key}");
                return Ok(());
            }
            cache.purge(&kind, &key)?;
            println!("purged {kind}:{key}");
            Ok(())
        }
    }
}

fn load_settings(config: &Path, cache_dir: Option<PathBuf>) -> Result<Settings> {
    let mut settings = Settings::load(config, &EnvOverrides::from_env())
        .with_context(|| format!("loading settings from {}", config.display()))?;
    if let Some(dir) = cache_dir {
        settings.cache_dir = dir;
    }
    Ok(settings)
}

fn target(common: &CommonArgs) -> TargetVersion {
    let target = TargetVersion::new(common.target.clone());
    match &common.url {
        Some(url) => target.with_url(url.clone()),
        None => target,
    }
}

fn build_pipeline(settings: Settings) -> Result<Pipeline> {
    let cancel = match settings.run_timeout {
        Some(t) => CancelToken::with_timeout(t),
        None => CancelToken::new(),
    };
    install_interrupt_handler(cancel.clone())?;

    let fetcher = HttpFetcher::new(settings.http_timeout)?;
    let ctx = PipelineContext::new(
        settings,
        Box::new(fetcher),
        Box::new(SystemHost::new()),
        cancel,
    )?;
    Ok(Pipeline::new(ctx))
}

/// First interrupt cancels the run; a second exits immediately.
fn install_interrupt_handler(cancel: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            eprintln!("\nReceived second interrupt, exiting immediately...");
            std::process::exit(EXIT_CANCELLED as i32);
        }
        eprintln!("\nReceived interrupt signal, stopping after the current step...");
        cancel.cancel();
    })
    .context("installing interrupt handler")
}
