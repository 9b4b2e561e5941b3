use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use pmc_batch::config::Config;
use pmc_batch::join::{self, JoinMode};
use pmc_batch::perfmon::{self, FilterRequest};
use pmc_batch::shorten::{self, LlvmCxxFilt, NameCache, MAX_SHORTEN_LEVEL};
use pmc_batch::soc;

/// GPU performance counter pass planning and result reconciliation.
#[derive(Parser)]
#[command(name = "pmc-batch", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the config file. Default: info.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan counter passes and write their definition files.
    Plan(PlanArgs),
    /// Join per-pass result tables into pmc_perf.csv.
    Join(JoinArgs),
    /// Shorten kernel names in every result table of a workload.
    Shorten(ShortenArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args)]
struct PlanArgs {
    /// Workload output directory. Recreated from scratch.
    workload: PathBuf,

    /// Target SoC (e.g., mi200).
    #[arg(long, conflicts_with = "arch")]
    soc: Option<String>,

    /// Target gfx architecture (e.g., gfx90a).
    #[arg(long)]
    arch: Option<String>,

    /// Directory holding the reference counter definitions.
    #[arg(long)]
    perfmon_dir: Option<PathBuf>,

    /// Only use reference files for these hardware blocks.
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    ip_blocks: Option<Vec<String>>,

    /// Plan the roofline counter set; keeps other workload content.
    #[arg(long, conflicts_with = "ip_blocks")]
    roofline: bool,

    /// Keep the combined plan file instead of one file per pass.
    #[arg(long)]
    no_split: bool,
}

#[derive(Args)]
struct JoinArgs {
    /// Workload directory holding pmc_perf_<n>.csv.
    workload: PathBuf,

    /// Dispatch matching mode (kernel, grid).
    #[arg(long)]
    mode: Option<String>,

    /// Keep the per-pass result files.
    #[arg(long)]
    keep_inputs: bool,
}

#[derive(Args)]
struct ShortenArgs {
    /// Workload directory holding the result tables.
    workload: PathBuf,

    /// Template nesting depth to keep (at least 1); 5 or more disables
    /// shortening.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    level: Option<u32>,

    /// Path to llvm-cxxfilt.
    #[arg(long)]
    demangler: Option<PathBuf>,
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = cli.command {
        println!("pmc-batch {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    // Initialize tracing.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::debug!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting pmc-batch",
    );

    match cli.command {
        Command::Plan(args) => run_plan(&cfg, args),
        Command::Join(args) => run_join(&cfg, args),
        Command::Shorten(args) => run_shorten(&cfg, args),
        Command::Version => Ok(()),
    }
}

fn run_plan(cfg: &Config, args: PlanArgs) -> Result<()> {
    let soc_name = match (args.soc, args.arch) {
        (Some(soc), _) => soc,
        (None, Some(arch)) => soc::soc_for_arch(&arch)?.to_string(),
        (None, None) => cfg
            .soc_name()?
            .context("a target SoC is required (--soc or --arch)")?,
    };

    let table = cfg.capacity_table()?;
    let soc = table.get(&soc_name)?;

    let perfmon_dir = args
        .perfmon_dir
        .or_else(|| cfg.perfmon_dir.clone())
        .context("--perfmon-dir is required")?;

    let plan = if args.roofline {
        perfmon::roofline_workload(&perfmon_dir, &args.workload, soc, !args.no_split)?
    } else {
        let ip_blocks = args.ip_blocks.or_else(|| cfg.ip_blocks.clone());
        perfmon::filter_workload(&FilterRequest {
            perfmon_dir: &perfmon_dir,
            workload_dir: &args.workload,
            soc,
            ip_blocks: ip_blocks.as_deref(),
            split_passes: !args.no_split,
        })?
    };

    tracing::info!(
        soc = soc.name(),
        sources = plan.selection.included.len(),
        excluded = plan.selection.excluded.len(),
        passes = plan.plan.len(),
        level_passes = plan.levels.len(),
        workload = %args.workload.display(),
        "planning complete",
    );

    Ok(())
}

fn run_join(cfg: &Config, args: JoinArgs) -> Result<()> {
    let mode: JoinMode = match args.mode {
        Some(mode) => mode.parse()?,
        None => cfg.join_mode()?,
    };
    let keep_inputs = args.keep_inputs || cfg.join.keep_inputs;

    let outcome = join::join_workload(&args.workload, mode, keep_inputs)
        .with_context(|| format!("joining passes in {}", args.workload.display()))?;

    for warning in &outcome.report.warnings {
        tracing::warn!(%warning, "join warning");
    }

    Ok(())
}

fn run_shorten(cfg: &Config, args: ShortenArgs) -> Result<()> {
    let level = args.level.unwrap_or(cfg.shorten.level);
    if level >= MAX_SHORTEN_LEVEL {
        tracing::info!(level, "shortening disabled at this level");
        return Ok(());
    }

    let path = args
        .demangler
        .unwrap_or_else(|| cfg.shorten.demangler.clone());
    let demangler = LlvmCxxFilt::new(path)?;

    let mut cache = NameCache::new();
    let summary = shorten::shorten_workload(&args.workload, level, &demangler, &mut cache)?;

    if !summary.is_success() {
        for (path, error) in &summary.failed {
            tracing::error!(path = %path.display(), %error, "file not shortened");
        }
        bail!("{} file(s) could not be shortened", summary.failed.len());
    }

    Ok(())
}
