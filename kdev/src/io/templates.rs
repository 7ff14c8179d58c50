//! Launch scripts and debugger descriptor rendered from minijinja templates.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{AutoEscape, Environment, context};
use serde::Serialize;
use tracing::info;

use crate::core::partition::PartitionPlan;
use crate::io::config::{KdevConfig, PortForward};
use crate::io::init::KdevPaths;
use crate::io::vm::{QEMU_BINARY, drive_arg};

const RUN_QEMU_TEMPLATE: &str = include_str!("../../templates/run-qemu.sh.j2");
const LAUNCH_JSON_TEMPLATE: &str = include_str!("../../templates/launch.json.j2");

/// Port QEMU's `-s` gdb stub listens on.
const GDB_PORT: u16 = 1234;

/// Values substituted into `run-qemu.sh.j2`.
#[derive(Debug, Clone, Serialize)]
pub struct RunScriptContext {
    pub qemu: String,
    pub kvm: bool,
    pub smp: u32,
    pub memory_gb: u32,
    pub drive: String,
    pub bzimage: String,
    pub root_device: String,
    /// Comma-joined `hostfwd=` rules; empty disables user networking.
    pub hostfwd: String,
}

impl RunScriptContext {
    pub fn new(cfg: &KdevConfig, paths: &KdevPaths, plan: &PartitionPlan, kvm: bool) -> Self {
        Self {
            qemu: QEMU_BINARY.to_string(),
            kvm,
            smp: cfg.qemu.run_smp,
            memory_gb: cfg.qemu.run_memory_gb,
            drive: drive_arg(
                &paths.image_path,
                cfg.rootfs.image_format,
                plan.boot_mode(),
            ),
            bzimage: paths.bzimage().display().to_string(),
            root_device: plan.device_path(plan.root()),
            hostfwd: hostfwd_option(&cfg.qemu.port_forwards),
        }
    }
}

#[derive(Serialize)]
struct RunScriptView<'a> {
    #[serde(flatten)]
    ctx: &'a RunScriptContext,
    debug: bool,
}

/// `hostfwd=tcp::<host>-:<guest>` rules joined for a single `-nic user`.
pub fn hostfwd_option(forwards: &[PortForward]) -> String {
    forwards
        .iter()
        .map(|f| format!("hostfwd=tcp::{}-:{}", f.host, f.guest))
        .collect::<Vec<_>>()
        .join(",")
}

fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    // Shell and JSON output are written verbatim.
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.add_template("run-qemu.sh", RUN_QEMU_TEMPLATE)
        .context("parse run-qemu template")?;
    env.add_template("launch.json", LAUNCH_JSON_TEMPLATE)
        .context("parse launch.json template")?;
    Ok(env)
}

/// Render the launch script; `debug` halts the guest for gdb (`-S -s`).
pub fn render_run_script(ctx: &RunScriptContext, debug: bool) -> Result<String> {
    let env = environment()?;
    let template = env.get_template("run-qemu.sh")?;
    let mut rendered = template
        .render(RunScriptView { ctx, debug })
        .context("render run-qemu template")?;
    rendered.push('\n');
    Ok(rendered)
}

pub fn render_launch_json(vmlinux: &Path, src_dir: &Path) -> Result<String> {
    let env = environment()?;
    let template = env.get_template("launch.json")?;
    let mut rendered = template
        .render(context! {
            vmlinux => vmlinux.display().to_string(),
            src_dir => src_dir.display().to_string(),
            gdb_port => GDB_PORT,
        })
        .context("render launch.json template")?;
    rendered.push('\n');
    Ok(rendered)
}

/// Write `run-qemu.sh`, `run-qemu-debug.sh` and the VS Code launch file.
pub fn write_launch_scripts(
    cfg: &KdevConfig,
    paths: &KdevPaths,
    plan: &PartitionPlan,
    kvm: bool,
) -> Result<()> {
    let ctx = RunScriptContext::new(cfg, paths, plan, kvm);
    write_executable(&paths.run_script_path, &render_run_script(&ctx, false)?)?;
    write_executable(&paths.debug_script_path, &render_run_script(&ctx, true)?)?;

    let launch = paths.vscode_launch();
    if let Some(parent) = launch.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(&launch, render_launch_json(&paths.vmlinux(), &paths.src_dir)?)
        .with_context(|| format!("write {}", launch.display()))?;

    info!(
        run = %paths.run_script_path.display(),
        debug = %paths.debug_script_path.display(),
        launch = %launch.display(),
        "launch scripts generated"
    );
    Ok(())
}

fn write_executable(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?
            .permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(path, perms)
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}
