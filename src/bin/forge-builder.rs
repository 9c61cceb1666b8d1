use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use forge_builder::error::FailureClass;
use forge_builder::stages::{describe_plan, standard_plan};
use forge_builder::verify::verify_boot;
use forge_builder::{interrupt, run_pipeline, BuildConfig, BuildOptions, CancelToken, HostExecutor};

/// forge-builder - build a bootable live ISO in stages
#[derive(Parser)]
#[command(name = "forge-builder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build pipeline
    Build(BuildArgs),

    /// List the stages in order, for choosing --skip-through
    Stages,

    /// Boot an existing ISO headless and wait for a login prompt
    Verify {
        iso: PathBuf,

        /// Seconds to wait for the login prompt
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// TOML build configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Distribution release to bootstrap (e.g. bookworm)
    #[arg(long)]
    release: Option<String>,

    /// Output directory for the ISO, checksums and manifest
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory the root filesystem is built in
    #[arg(long)]
    target_root: Option<PathBuf>,

    /// Package-list file; repeat for several lists (appended to the config's)
    #[arg(long = "package-list", value_name = "FILE")]
    package_lists: Vec<PathBuf>,

    /// Volume label stamped into the image
    #[arg(long)]
    label: Option<String>,

    /// Image version
    #[arg(long)]
    version: Option<String>,

    /// Skip stages 1..=N (resume); the mount stage always runs
    #[arg(long, value_name = "N", default_value_t = 0)]
    skip_through: usize,

    /// Allow building over a non-empty target root
    #[arg(long)]
    reuse_target: bool,

    /// Only validate tools and inputs; change nothing
    #[arg(long)]
    dry_run: bool,

    /// Boot the finished ISO in QEMU as a smoke test
    #[arg(long)]
    verify_boot: bool,

    /// Seconds to wait for the smoke test
    #[arg(long, default_value_t = 300)]
    verify_timeout: u64,
}

impl BuildArgs {
    fn load_config(&self) -> Result<BuildConfig> {
        let mut config = match &self.config {
            Some(path) => BuildConfig::load(path)?,
            None => BuildConfig::default(),
        };
        let build = &mut config.build;
        if let Some(release) = &self.release {
            build.release = release.clone();
        }
        if let Some(output) = &self.output {
            build.output_dir = output.clone();
        }
        if let Some(root) = &self.target_root {
            build.target_root = root.clone();
        }
        if let Some(label) = &self.label {
            build.label = label.clone();
        }
        if let Some(version) = &self.version {
            build.version = version.clone();
        }
        if self.reuse_target {
            build.reuse_target = true;
        }
        config
            .inputs
            .package_lists
            .extend(self.package_lists.iter().cloned());
        Ok(config)
    }

    fn options(&self) -> BuildOptions {
        BuildOptions {
            dry_run: self.dry_run,
            skip_through: self.skip_through,
            verify_boot: self.verify_boot,
            verify_timeout: Duration::from_secs(self.verify_timeout),
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    interrupt::install_handlers();

    let code = match cli.command {
        Commands::Build(args) => cmd_build(&args),
        Commands::Stages => report_error(cmd_stages()),
        Commands::Verify { iso, timeout } => report_error(cmd_verify(&iso, timeout)),
    };
    std::process::exit(code);
}

fn cmd_build(args: &BuildArgs) -> i32 {
    let config = match args.load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {:#}", err);
            return FailureClass::Precondition.exit_code();
        }
    };
    let cancel = CancelToken::new();
    let executor = Box::new(HostExecutor::new(cancel.clone()));
    let report = run_pipeline(config, &args.options(), executor, cancel);
    println!("{}", report.status_line());
    if let Some(path) = &report.run_record {
        println!("  record: {}", path.display());
    }
    report.exit_code
}

fn cmd_stages() -> Result<()> {
    let plan = standard_plan().context("building stage plan")?;
    for line in describe_plan(&plan) {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_verify(iso: &Path, timeout: u64) -> Result<()> {
    let cancel = CancelToken::new();
    let executor = HostExecutor::new(cancel.clone());
    verify_boot(&executor, iso, Duration::from_secs(timeout), &cancel)?;
    println!("SUCCESS: {} booted to a login prompt", iso.display());
    Ok(())
}

fn report_error(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {:#}", err);
            FailureClass::of(&err).exit_code()
        }
    }
}
