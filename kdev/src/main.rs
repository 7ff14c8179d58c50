//! `kdev`: provision an Arch Linux rootfs image and build a kernel against it.
//!
//! State lives under `<root>/.state/`; the kernel pipeline resumes from its
//! last checkpoint on every invocation.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};

use kdev::core::partition::PartitionPlan;
use kdev::exit_codes;
use kdev::io::artifacts::HttpArtifactSource;
use kdev::io::config::{KdevConfig, load_config};
use kdev::io::init::{InitOptions, KdevPaths, init_workspace};
use kdev::io::process::SystemToolRunner;
use kdev::io::state_store::BuildStateStore;
use kdev::io::templates::write_launch_scripts;
use kdev::io::vm::{QemuLauncher, kvm_enabled};
use kdev::kernel::KernelBuild;
use kdev::logging;
use kdev::provision::{Provisioner, RunOptions, distclean};

#[derive(Parser)]
#[command(
    name = "kdev",
    version,
    about = "Unattended Arch Linux rootfs installer and resumable kernel build"
)]
struct Cli {
    /// Workspace directory holding the sources, image and `.state/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Config file (default: `<root>/kdev.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `kdev.toml` and create `.state/`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Provision everything: rootfs if needed, kernel, launch scripts.
    Run {
        /// Reinstall the rootfs even if the image exists.
        #[arg(long, conflicts_with = "force_skip_rootfs")]
        rebuild_rootfs: bool,
        /// Skip the rootfs even if the image is missing.
        #[arg(long)]
        force_skip_rootfs: bool,
        /// Build the kernel again on top of the existing configuration.
        #[arg(long)]
        rebuild_kernel: bool,
    },
    /// Install the rootfs image unconditionally.
    Rootfs,
    /// Resume the kernel pipeline from its checkpoint.
    Kernel {
        /// Rerun the build stage even if the kernel is already built.
        #[arg(long)]
        rebuild: bool,
    },
    /// Print the partition plan derived from the config.
    Plan,
    /// Print the kernel build checkpoint.
    State {
        /// Forget the checkpoint so the next run starts from a fresh clone.
        #[arg(long)]
        reset: bool,
    },
    /// Regenerate `run-qemu.sh`, `run-qemu-debug.sh` and the gdb launch file.
    Scripts,
    /// Remove build outputs.
    #[command(group(ArgGroup::new("target").required(true).args(["all", "kernel"])))]
    Clean {
        /// Remove `.state/` and the rootfs image.
        #[arg(long)]
        all: bool,
        /// Run `make clean` in the kernel build directory.
        #[arg(long)]
        kernel: bool,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init();

    let root = fs::canonicalize(&cli.root)
        .with_context(|| format!("resolve workspace root {}", cli.root.display()))?;
    let mut paths = KdevPaths::new(root);
    if let Some(config) = cli.config {
        paths = paths.with_config(config);
    }

    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Run {
            rebuild_rootfs,
            force_skip_rootfs,
            rebuild_kernel,
        } => cmd_run(
            &paths,
            RunOptions {
                rebuild_rootfs,
                force_skip_rootfs,
                rebuild_kernel,
            },
        ),
        Command::Rootfs => cmd_rootfs(&paths),
        Command::Kernel { rebuild } => cmd_kernel(&paths, rebuild),
        Command::Plan => cmd_plan(&paths),
        Command::State { reset } => cmd_state(&paths, reset),
        Command::Scripts => cmd_scripts(&paths),
        Command::Clean { all, kernel } => cmd_clean(&paths, all, kernel),
    }
}

fn cmd_init(paths: &KdevPaths, force: bool) -> Result<()> {
    init_workspace(paths, &InitOptions { force })?;
    println!("wrote {}", paths.config_path.display());
    Ok(())
}

fn load(paths: &KdevPaths) -> Result<KdevConfig> {
    load_config(&paths.config_path)
        .with_context(|| format!("load config {}", paths.config_path.display()))
}

/// Run `f` against a provisioner wired to the real system.
fn with_provisioner<T>(
    paths: &KdevPaths,
    f: impl FnOnce(
        &Provisioner<'_, SystemToolRunner, QemuLauncher, HttpArtifactSource>,
        &KdevConfig,
    ) -> Result<T>,
) -> Result<T> {
    let cfg = load(paths)?;
    let runner = SystemToolRunner;
    let launcher = QemuLauncher::new(&paths.qemu_log_path);
    let artifacts = HttpArtifactSource::new(&cfg.iso.url, &cfg.iso.sha256_url)?;
    let provisioner = Provisioner::new(paths, &cfg, &runner, &launcher, &artifacts);
    f(&provisioner, &cfg)
}

fn cmd_run(paths: &KdevPaths, opts: RunOptions) -> Result<()> {
    let state = with_provisioner(paths, |p, _| p.run(opts))?;
    println!("kernel: {state}");
    println!("launch: {}", paths.run_script_path.display());
    Ok(())
}

fn cmd_rootfs(paths: &KdevPaths) -> Result<()> {
    with_provisioner(paths, |p, cfg| {
        let plan = cfg.partition_plan()?;
        p.build_rootfs(&plan)
    })?;
    println!("rootfs: {}", paths.image_path.display());
    Ok(())
}

fn cmd_kernel(paths: &KdevPaths, rebuild: bool) -> Result<()> {
    let state = with_provisioner(paths, |p, _| p.build_kernel(rebuild))?;
    println!("kernel: {state}");
    Ok(())
}

fn cmd_plan(paths: &KdevPaths) -> Result<()> {
    let plan = load(paths)?.partition_plan()?;
    print!("{}", render_plan(&plan));
    Ok(())
}

fn render_plan(plan: &PartitionPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "boot mode: {}", plan.boot_mode());
    for entry in plan.partitions() {
        let _ = writeln!(
            out,
            "{:>2}  {:<10} {:<5} {:>4}G  {}",
            entry.number,
            plan.device_path(entry),
            entry.spec.format,
            entry.spec.size_gb,
            entry.spec.mount_point
        );
    }
    let order: Vec<&str> = plan
        .mount_order()
        .iter()
        .map(|entry| entry.spec.mount_point.as_str())
        .collect();
    let _ = writeln!(out, "mount order: {}", order.join(" "));
    out
}

fn cmd_state(paths: &KdevPaths, reset: bool) -> Result<()> {
    let store = BuildStateStore::new(&paths.build_state_path);
    if reset {
        store.clear()?;
    }
    println!("{}", store.get_state());
    Ok(())
}

fn cmd_scripts(paths: &KdevPaths) -> Result<()> {
    let cfg = load(paths)?;
    let plan = cfg.partition_plan()?;
    write_launch_scripts(&cfg, paths, &plan, kvm_enabled(&cfg.qemu))?;
    println!("wrote {}", paths.run_script_path.display());
    Ok(())
}

fn cmd_clean(paths: &KdevPaths, all: bool, kernel: bool) -> Result<()> {
    if kernel {
        let cfg = load(paths)?;
        let store = BuildStateStore::new(&paths.build_state_path);
        KernelBuild::new(&SystemToolRunner, &store, paths, &cfg.kernel).clean()?;
    }
    if all {
        distclean(paths)?;
    }
    Ok(())
}
