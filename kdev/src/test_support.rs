//! Scripted doubles and fixtures for tests.
//!
//! Enabled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use crate::core::overlay::{KconfigOverlay, OverlayValue};
use crate::error::{ProvisionError, Result};
use crate::io::artifacts::ArtifactSource;
use crate::io::config::KdevConfig;
use crate::io::console::{Console, LINE_TERMINATOR, WaitTimeout};
use crate::io::init::KdevPaths;
use crate::io::process::{ToolInvocation, ToolRunner};
use crate::io::vm::ConsoleLauncher;

/// One interaction recorded by [`ScriptedConsole`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Await(String),
    Send(String),
    AwaitEof,
    Close,
}

/// Console double that answers every wait immediately and records all
/// traffic. Clones share one event log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConsole {
    events: Rc<RefCell<Vec<ConsoleEvent>>>,
    fail_at: Option<String>,
}

impl ScriptedConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time out on the first wait for exactly `pattern` (`<EOF>` for
    /// [`Console::await_eof`]).
    pub fn failing_at(pattern: &str) -> Self {
        Self {
            fail_at: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<ConsoleEvent> {
        self.events.borrow().clone()
    }

    /// Everything sent, with the line terminator stripped from full lines.
    pub fn sent(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ConsoleEvent::Send(text) => Some(
                    text.strip_suffix(LINE_TERMINATOR)
                        .unwrap_or(text)
                        .to_string(),
                ),
                _ => None,
            })
            .collect()
    }

    pub fn awaited(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ConsoleEvent::Await(pattern) => Some(pattern.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.events.borrow().contains(&ConsoleEvent::Close)
    }

    fn timeout_error(&self, pattern: &str, timeout: WaitTimeout) -> ProvisionError {
        ProvisionError::PatternTimeout {
            pattern: pattern.to_string(),
            timeout: match timeout {
                WaitTimeout::Bounded(d) => d,
                WaitTimeout::Unbounded => Duration::MAX,
            },
            tail: String::new(),
        }
    }
}

impl Console for ScriptedConsole {
    fn await_pattern(&mut self, pattern: &str, timeout: WaitTimeout) -> Result<String> {
        self.events
            .borrow_mut()
            .push(ConsoleEvent::Await(pattern.to_string()));
        if self.fail_at.as_deref() == Some(pattern) {
            self.fail_at = None;
            return Err(self.timeout_error(pattern, timeout));
        }
        Ok(pattern.to_string())
    }

    fn send(&mut self, text: &str) -> Result<()> {
        self.events
            .borrow_mut()
            .push(ConsoleEvent::Send(text.to_string()));
        Ok(())
    }

    fn await_eof(&mut self, timeout: WaitTimeout) -> Result<()> {
        self.events.borrow_mut().push(ConsoleEvent::AwaitEof);
        if self.fail_at.as_deref() == Some("<EOF>") {
            self.fail_at = None;
            return Err(self.timeout_error("<EOF>", timeout));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<Option<i32>> {
        self.events.borrow_mut().push(ConsoleEvent::Close);
        Ok(Some(0))
    }
}

/// Launcher that hands out clones of one [`ScriptedConsole`].
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    console: ScriptedConsole,
    launched: RefCell<Vec<ToolInvocation>>,
    fail_launch: bool,
}

impl ScriptedLauncher {
    pub fn new(console: ScriptedConsole) -> Self {
        Self {
            console,
            launched: RefCell::new(Vec::new()),
            fail_launch: false,
        }
    }

    /// Every launch fails as if the program were not installed.
    pub fn failing_to_launch() -> Self {
        Self {
            fail_launch: true,
            ..Self::default()
        }
    }

    pub fn console(&self) -> &ScriptedConsole {
        &self.console
    }

    pub fn launched(&self) -> Vec<ToolInvocation> {
        self.launched.borrow().clone()
    }
}

impl ConsoleLauncher for ScriptedLauncher {
    type Console = ScriptedConsole;

    fn launch(&self, invocation: &ToolInvocation) -> Result<ScriptedConsole> {
        self.launched.borrow_mut().push(invocation.clone());
        if self.fail_launch {
            return Err(ProvisionError::Spawn {
                program: invocation.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            });
        }
        Ok(self.console.clone())
    }
}

/// Tool runner that records invocations instead of spawning them.
///
/// `git init <dir>` and `qemu-img create` leave behind the directory or
/// image the real command would, so cleanup paths can be observed.
#[derive(Debug, Default)]
pub struct RecordingToolRunner {
    calls: RefCell<Vec<ToolInvocation>>,
    failures: RefCell<Vec<String>>,
}

impl RecordingToolRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first invocation whose command line contains `needle`.
    pub fn fail_on(self, needle: &str) -> Self {
        self.failures.borrow_mut().push(needle.to_string());
        self
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.borrow().clone()
    }

    /// Command lines of every recorded invocation.
    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(ToString::to_string).collect()
    }
}

impl ToolRunner for RecordingToolRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<()> {
        self.calls.borrow_mut().push(invocation.clone());
        let command = invocation.to_string();

        let mut failures = self.failures.borrow_mut();
        if let Some(pos) = failures.iter().position(|f| command.contains(f.as_str())) {
            failures.remove(pos);
            return Err(ProvisionError::ExternalTool {
                command,
                status: "exit status: 1".to_string(),
            });
        }

        let args: Vec<&str> = invocation.args.iter().map(String::as_str).collect();
        match (invocation.program.as_str(), args.as_slice()) {
            ("git", ["init", dir]) => fs::create_dir_all(dir)?,
            ("qemu-img", ["create", _, _, image, _]) => fs::write(image, b"")?,
            _ => {}
        }
        Ok(())
    }
}

/// Artifact source that writes a placeholder ISO.
#[derive(Debug, Default)]
pub struct FakeArtifactSource;

impl ArtifactSource for FakeArtifactSource {
    fn ensure_iso(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, b"iso")?;
        Ok(())
    }
}

/// Default config with deterministic, host-independent settings.
pub fn sample_config() -> KdevConfig {
    let mut cfg = KdevConfig::default();
    cfg.qemu.kvm = Some(false);
    cfg.kernel.jobs = Some(2);
    cfg.kernel.overlays = vec![
        KconfigOverlay::new("CONFIG_DEBUG_INFO", OverlayValue::Enable),
        KconfigOverlay::new("CONFIG_FRAME_WARN", OverlayValue::Num { value: 2048 }),
    ];
    cfg
}

/// Scratch workspace with placeholder UEFI firmware files.
pub struct TestWorkspace {
    dir: tempfile::TempDir,
    pub paths: KdevPaths,
}

impl TestWorkspace {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let firmware = dir.path().join("firmware");
        fs::create_dir_all(&firmware)?;
        fs::write(firmware.join("OVMF_CODE.fd"), b"code")?;
        fs::write(firmware.join("OVMF_VARS.fd"), b"vars")?;
        let paths = KdevPaths::new(dir.path());
        Ok(Self { dir, paths })
    }

    fn firmware(&self, name: &str) -> PathBuf {
        self.dir.path().join("firmware").join(name)
    }

    /// [`sample_config`] pointed at this workspace's firmware files.
    pub fn config(&self) -> KdevConfig {
        let mut cfg = sample_config();
        cfg.qemu.ovmf_code = self.firmware("OVMF_CODE.fd");
        cfg.qemu.ovmf_vars = self.firmware("OVMF_VARS.fd");
        cfg
    }
}
