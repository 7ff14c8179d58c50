//! I/O adapters: processes, the VM console, persisted state and files.

pub mod artifacts;
pub mod config;
pub mod console;
pub mod git;
pub mod image;
pub mod init;
pub mod process;
pub mod state_store;
pub mod templates;
pub mod vm;
