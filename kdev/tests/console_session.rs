//! Console session tests against real child processes.
//!
//! These spawn `sh` and `cat`, so they only run on unix hosts.
#![cfg(unix)]

use std::io::{self, Write};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kdev::error::ProvisionError;
use kdev::io::console::{Console, ConsoleSession, WaitTimeout};

fn sh(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("lock")).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn silent_console_times_out_with_pattern_timeout() {
    let mut session = ConsoleSession::spawn(sh("echo booting; sleep 3"), Box::new(io::sink()))
        .expect("spawn");

    let started = Instant::now();
    let err = session
        .await_pattern("login:", WaitTimeout::secs(1))
        .expect_err("no prompt ever appears");

    assert!(started.elapsed() < Duration::from_secs(3));
    match err {
        ProvisionError::PatternTimeout {
            pattern, timeout, ..
        } => {
            assert_eq!(pattern, "login:");
            assert_eq!(timeout, Duration::from_secs(1));
        }
        other => panic!("unexpected error: {other}"),
    }
    session.close().expect("close");
}

#[test]
fn sent_lines_reach_the_child() {
    let mut session = ConsoleSession::spawn(Command::new("cat"), Box::new(io::sink()))
        .expect("spawn");

    session.send_line("hello console").expect("send");
    let echoed = session
        .await_pattern("hello \\w+", WaitTimeout::secs(5))
        .expect("echo");

    assert_eq!(echoed, "hello console");
    // closing stdin lets cat exit on its own
    assert_eq!(session.close().expect("close"), Some(0));
}

#[test]
fn run_command_answers_a_prompt() {
    let script = "printf 'Password: '; read answer; echo \"got $answer\"";
    let mut session = ConsoleSession::spawn(sh(script), Box::new(io::sink())).expect("spawn");

    session
        .run_command("Password:", "hunter2", WaitTimeout::secs(5))
        .expect("answer prompt");
    session
        .await_pattern("got hunter2", WaitTimeout::secs(5))
        .expect("reply");
    session.await_eof(WaitTimeout::secs(5)).expect("eof");
    session.close().expect("close");
}

#[test]
fn observer_sees_stdout_and_stderr() {
    let captured = Captured::default();
    let mut session = ConsoleSession::spawn(
        sh("echo to-stdout; echo to-stderr >&2"),
        Box::new(captured.clone()),
    )
    .expect("spawn");

    session.await_eof(WaitTimeout::secs(5)).expect("eof");
    session.close().expect("close");

    let text = captured.text();
    assert!(text.contains("to-stdout"));
    assert!(text.contains("to-stderr"));
}

#[test]
fn missing_executable_is_a_spawn_error() {
    let err = ConsoleSession::spawn(
        Command::new("/nonexistent/kdev-console-test"),
        Box::new(io::sink()),
    )
    .err()
    .expect("spawn should fail");
    assert!(matches!(err, ProvisionError::Spawn { .. }));
}
