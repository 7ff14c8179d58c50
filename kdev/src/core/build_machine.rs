//! Transition table for the resumable kernel build pipeline.
//!
//! ```text
//! NOT_INIT --clone--> SRC_CLONED --configure--> SRC_CONFIGURED --build--> SRC_BUILT
//! ```
//!
//! Each state names exactly one pending stage (none for `SRC_BUILT`). The
//! table is pure; running stages and persisting checkpoints happen in
//! [`crate::kernel`].

use std::fmt;

use crate::core::types::BuildState;

/// One unit of the pipeline with exactly one persisted checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Clone,
    Configure,
    Build,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Clone => "clone",
            Stage::Configure => "configure",
            Stage::Build => "build",
        }
    }

    /// State persisted once this stage's tools have all succeeded.
    pub fn completes(&self) -> BuildState {
        match self {
            Stage::Clone => BuildState::SrcCloned,
            Stage::Configure => BuildState::SrcConfigured,
            Stage::Build => BuildState::SrcBuilt,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage that runs next from `state`, or `None` when the pipeline is done.
pub fn pending_stage(state: BuildState) -> Option<Stage> {
    match state {
        BuildState::NotInit => Some(Stage::Clone),
        BuildState::SrcCloned => Some(Stage::Configure),
        BuildState::SrcConfigured => Some(Stage::Build),
        BuildState::SrcBuilt => None,
    }
}

/// All stages still to run from `state`, in order.
pub fn remaining_stages(state: BuildState) -> Vec<Stage> {
    let mut stages = Vec::new();
    let mut current = state;
    while let Some(stage) = pending_stage(current) {
        stages.push(stage);
        current = stage.completes();
    }
    stages
}

/// Parallelism for `make -j`: available processing units minus one, floor 1.
pub fn parallel_jobs(available: usize) -> usize {
    available.saturating_sub(1).max(1)
}
