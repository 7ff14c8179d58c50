//! Git adapter for the kernel source tree.
//!
//! Only the handful of commands needed for a shallow checkout of one tag are
//! wrapped. Every call goes through a [`ToolRunner`] so tests can script
//! outcomes.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::io::process::{ToolInvocation, ToolRunner};

/// Wrapper for executing git commands against one working tree.
#[derive(Debug)]
pub struct Git<'a, R: ToolRunner> {
    runner: &'a R,
    workdir: PathBuf,
}

impl<'a, R: ToolRunner> Git<'a, R> {
    pub fn new(runner: &'a R, workdir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            workdir: workdir.into(),
        }
    }

    /// `git init <workdir>`.
    pub fn init(&self) -> Result<()> {
        let inv = ToolInvocation::new("git")
            .arg("init")
            .arg(self.workdir.display().to_string());
        self.runner.run(&inv)
    }

    pub fn remote_add(&self, name: &str, url: &str) -> Result<()> {
        self.run(&["remote", "add", name, url])
    }

    /// Fetch a single ref with `--depth 1`.
    pub fn fetch_shallow(&self, remote: &str, reference: &str) -> Result<()> {
        self.run(&["fetch", "--depth", "1", remote, reference])
    }

    pub fn checkout(&self, rev: &str) -> Result<()> {
        self.run(&["checkout", rev])
    }

    /// Create the repository and register its remote as one unit.
    ///
    /// Skipped when the working tree already exists. If any step fails the
    /// partially created tree is removed before the error is returned, so a
    /// rerun starts from a clean slate.
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn init_with_remote(&self, remote: &str, url: &str) -> Result<()> {
        if self.workdir.exists() {
            debug!("working tree exists, skipping init");
            return Ok(());
        }

        let result = self.init().and_then(|()| self.remote_add(remote, url));
        if let Err(err) = result {
            warn!(err = %err, "repository setup failed, removing partial tree");
            if self.workdir.exists() {
                if let Err(cleanup) = fs::remove_dir_all(&self.workdir) {
                    warn!(err = %cleanup, "failed to remove partial tree");
                }
            }
            return Err(err);
        }
        info!(remote, url, "repository initialized");
        Ok(())
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let inv = ToolInvocation::new("git")
            .args(args.iter().copied())
            .current_dir(&self.workdir);
        self.runner.run(&inv)
    }
}
