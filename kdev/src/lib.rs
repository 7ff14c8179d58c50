//! Unattended Arch Linux rootfs provisioning and a resumable kernel build.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (partition planning, the build
//!   state transition table, config overlays). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting adapters (processes, the VM serial console,
//!   downloads, persisted state, templates). Each external effect sits behind
//!   a trait so tests can substitute scripted doubles.
//!
//! Orchestration modules ([`install`], [`kernel`], [`provision`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod install;
pub mod io;
pub mod kernel;
pub mod logging;
pub mod provision;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
