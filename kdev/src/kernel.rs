//! Resumable kernel build: clone, configure and build with persisted
//! checkpoints.
//!
//! [`KernelBuild::dispatch`] reads the persisted [`BuildState`], runs the
//! pending stage, saves the next state only after every tool in that stage
//! succeeded, and cascades until `SRC_BUILT` or the first error. A failed
//! stage leaves the previous checkpoint in place, so the next run retries
//! exactly that stage.

use std::fs;
use std::num::NonZeroUsize;
use std::thread;

use tracing::{info, instrument, warn};

use crate::core::build_machine::{Stage, parallel_jobs, pending_stage, remaining_stages};
use crate::core::overlay::{KconfigOverlay, rust_overlays};
use crate::core::types::BuildState;
use crate::error::Result;
use crate::io::config::KernelConfig;
use crate::io::git::Git;
use crate::io::init::KdevPaths;
use crate::io::process::{ToolInvocation, ToolRunner};
use crate::io::state_store::BuildStateStore;

const REMOTE: &str = "origin";

/// `make -j` value when none is configured.
pub fn default_jobs() -> usize {
    let available = thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    parallel_jobs(available)
}

/// The kernel pipeline bound to one workspace.
pub struct KernelBuild<'a, R: ToolRunner> {
    runner: &'a R,
    store: &'a BuildStateStore,
    paths: &'a KdevPaths,
    cfg: &'a KernelConfig,
    jobs: usize,
}

impl<'a, R: ToolRunner> KernelBuild<'a, R> {
    pub fn new(
        runner: &'a R,
        store: &'a BuildStateStore,
        paths: &'a KdevPaths,
        cfg: &'a KernelConfig,
    ) -> Self {
        Self {
            runner,
            store,
            paths,
            cfg,
            jobs: cfg.jobs.unwrap_or_else(default_jobs),
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Resume from the persisted checkpoint and run to completion.
    #[instrument(skip_all, fields(version = %self.cfg.version, jobs = self.jobs))]
    pub fn dispatch(&self) -> Result<BuildState> {
        let current = self.store.get_state();
        match pending_stage(current) {
            Some(stage) => info!(
                state = %current,
                next = %stage,
                remaining = remaining_stages(current).len(),
                "resuming kernel build"
            ),
            None => info!(state = %current, "kernel already built"),
        }
        self.dispatch_from(current)
    }

    /// Run every stage pending from `current`, checkpointing after each.
    pub fn dispatch_from(&self, mut current: BuildState) -> Result<BuildState> {
        while let Some(stage) = pending_stage(current) {
            self.run_stage(stage)?;
            current = stage.completes();
            self.persist(current);
        }
        Ok(current)
    }

    /// Build again on top of an existing configuration.
    ///
    /// `SRC_BUILT` is rolled back to `SRC_CONFIGURED` first; earlier states
    /// simply resume.
    pub fn rebuild(&self) -> Result<BuildState> {
        let mut current = self.store.get_state();
        if current == BuildState::SrcBuilt {
            current = BuildState::SrcConfigured;
            self.persist(current);
        }
        self.dispatch_from(current)
    }

    #[instrument(skip_all, fields(stage = %stage))]
    pub fn run_stage(&self, stage: Stage) -> Result<()> {
        info!("stage started");
        match stage {
            Stage::Clone => self.clone_source()?,
            Stage::Configure => self.configure()?,
            Stage::Build => self.build()?,
        }
        info!("stage finished");
        Ok(())
    }

    /// `make clean` in the build directory. A built tree drops back to
    /// `SRC_CONFIGURED` so the next dispatch rebuilds.
    #[instrument(skip_all)]
    pub fn clean(&self) -> Result<()> {
        self.runner.run(&self.make(&["clean"]))?;
        if self.store.get_state() == BuildState::SrcBuilt {
            self.persist(BuildState::SrcConfigured);
        }
        Ok(())
    }

    fn clone_source(&self) -> Result<()> {
        let git = Git::new(self.runner, &self.paths.src_dir);
        git.init_with_remote(REMOTE, &self.cfg.repo)?;
        git.fetch_shallow(REMOTE, &format!("v{}", self.cfg.version))?;
        git.checkout("FETCH_HEAD")
    }

    fn configure(&self) -> Result<()> {
        self.runner.run(&self.make(&["defconfig"]))?;

        let script = self.paths.config_script().display().to_string();
        let config = self.paths.kernel_config().display().to_string();
        let overlays = self.overlays();
        info!(count = overlays.len(), "applying config overlays");
        for overlay in &overlays {
            let inv = ToolInvocation::new(script.as_str())
                .arg("--file")
                .arg(config.as_str())
                .args(overlay.script_args())
                .current_dir(&self.paths.src_dir);
            self.runner.run(&inv)?;
        }

        // resolve dependencies the overlays touched without prompting
        self.runner.run(&self.make(&["olddefconfig"]))
    }

    fn overlays(&self) -> Vec<KconfigOverlay> {
        let mut overlays = self.cfg.overlays.clone();
        if self.cfg.rust {
            overlays.extend(rust_overlays());
        }
        overlays
    }

    fn build(&self) -> Result<()> {
        let make = self.make(&[]);
        let mut inv = ToolInvocation::new("bear")
            .args(["--append", "--output"])
            .arg(self.paths.compile_commands().display().to_string())
            .arg("--")
            .arg(make.program)
            .args(make.args)
            .current_dir(&self.paths.src_dir);
        for (key, value) in &self.cfg.build_env {
            inv = inv.env(key.as_str(), value.as_str());
        }
        self.runner.run(&inv)?;

        if self.cfg.rust {
            self.generate_rust_project()?;
        }
        Ok(())
    }

    fn generate_rust_project(&self) -> Result<()> {
        self.runner.run(&self.make(&["rust-analyzer"]))?;
        let built = self.paths.built_rust_project();
        let dest = self.paths.rust_project();
        fs::copy(&built, &dest)?;
        info!(path = %dest.display(), "rust-project.json generated");
        Ok(())
    }

    fn make(&self, targets: &[&str]) -> ToolInvocation {
        let mut inv = ToolInvocation::new("make")
            .arg(format!("O={}", self.paths.build_dir.display()))
            .arg(format!("-j{}", self.jobs));
        if self.cfg.rust {
            inv = inv.arg("LLVM=1");
        }
        inv.args(targets.iter().copied())
            .current_dir(&self.paths.src_dir)
    }

    fn persist(&self, state: BuildState) {
        match self.store.set_state(state) {
            Ok(()) => info!(state = %state, "checkpoint saved"),
            Err(err) => warn!(err = %err, state = %state, "failed to save checkpoint"),
        }
    }
}
