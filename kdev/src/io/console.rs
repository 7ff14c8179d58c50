//! Interactive console over a spawned child process.
//!
//! [`ConsoleSession`] owns one child (the installer VM) and synchronizes with
//! its serial console purely by pattern matching on the output stream. Two
//! reader threads drain stdout and stderr; every chunk is mirrored to an
//! observer sink for the operator and forwarded over a channel to the
//! session, which keeps the unconsumed bytes in a buffer.
//!
//! The [`Console`] trait is the seam the installer is written against, so the
//! phase sequence can be exercised with a scripted double.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::bytes::Regex;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::{ProvisionError, Result};

/// Terminator appended by [`Console::send_line`].
pub const LINE_TERMINATOR: &str = "\n";

/// Time a child gets to exit on its own after stdin is closed.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Bytes of buffered output quoted in timeout errors.
const TAIL_BYTES: usize = 200;

/// Once the unconsumed buffer grows past this after a search that found no
/// match, the oldest bytes are dropped down to [`SEARCH_WINDOW`]. Only
/// matches longer than the window can be lost.
const MAX_BUFFER: usize = 1024 * 1024;
const SEARCH_WINDOW: usize = 64 * 1024;

/// How long a pattern wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    Bounded(Duration),
    /// For steps whose duration cannot be predicted (package installation).
    Unbounded,
}

impl WaitTimeout {
    pub fn secs(secs: u64) -> Self {
        WaitTimeout::Bounded(Duration::from_secs(secs))
    }

    /// `None` waits forever; a bound too large for [`Instant`] is treated
    /// the same way.
    fn deadline(&self, from: Instant) -> Option<Instant> {
        match self {
            WaitTimeout::Bounded(d) => from.checked_add(*d),
            WaitTimeout::Unbounded => None,
        }
    }

    fn duration(&self) -> Duration {
        match self {
            WaitTimeout::Bounded(d) => *d,
            WaitTimeout::Unbounded => Duration::MAX,
        }
    }
}

/// Blocking pattern-wait and send primitives over an interactive console.
pub trait Console {
    /// Block until the unconsumed output matches `pattern`.
    ///
    /// Returns the matched text; everything up to and including the end of
    /// the match is consumed.
    fn await_pattern(&mut self, pattern: &str, timeout: WaitTimeout) -> Result<String>;

    /// Write raw text with no terminator and no wait.
    fn send(&mut self, text: &str) -> Result<()>;

    fn send_line(&mut self, text: &str) -> Result<()> {
        self.send(&format!("{text}{LINE_TERMINATOR}"))
    }

    /// Block until the output stream ends.
    fn await_eof(&mut self, timeout: WaitTimeout) -> Result<()>;

    /// Release the child. Safe to call more than once.
    fn close(&mut self) -> Result<Option<i32>>;

    /// Wait for `pattern`, then send `line`.
    fn run_command(&mut self, pattern: &str, line: &str, timeout: WaitTimeout) -> Result<()> {
        self.await_pattern(pattern, timeout)?;
        self.send_line(line)
    }
}

/// Where mirrored console bytes go.
pub type ObserverSink = Box<dyn Write + Send>;

/// Writer that copies everything to several sinks.
pub struct TeeSink {
    sinks: Vec<ObserverSink>,
}

impl TeeSink {
    pub fn new(sinks: Vec<ObserverSink>) -> Self {
        Self { sinks }
    }
}

impl Write for TeeSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for sink in &mut self.sinks {
            sink.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

enum Received {
    Data(Vec<u8>),
    TimedOut,
    Closed,
}

/// One spawned interactive child and its output buffer.
pub struct ConsoleSession {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    chunks: Receiver<Vec<u8>>,
    readers: Vec<JoinHandle<()>>,
    buffer: Vec<u8>,
    eof: bool,
    exit_code: Option<Option<i32>>,
}

impl ConsoleSession {
    /// Spawn `command` with all three standard streams piped.
    #[instrument(skip_all)]
    pub fn spawn(mut command: Command, observer: ObserverSink) -> Result<Self> {
        let program = command.get_program().to_string_lossy().into_owned();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ProvisionError::Spawn {
            program: program.clone(),
            source,
        })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::other("console streams were not piped").into());
            }
        };
        let stdin = child.stdin.take();

        let (tx, rx) = mpsc::channel();
        let observer = Arc::new(Mutex::new(observer));
        let readers = vec![
            spawn_reader(stdout, tx.clone(), Arc::clone(&observer)),
            spawn_reader(stderr, tx, observer),
        ];

        info!(program = %program, pid = child.id(), "console session started");
        Ok(Self {
            program,
            child,
            stdin,
            chunks: rx,
            readers,
            buffer: Vec::new(),
            eof: false,
            exit_code: None,
        })
    }

    /// Last few buffered bytes, for error messages.
    fn tail(&self) -> String {
        let start = self.buffer.len().saturating_sub(TAIL_BYTES);
        String::from_utf8_lossy(&self.buffer[start..]).into_owned()
    }

    fn consume_match(&mut self, re: &Regex) -> Option<String> {
        let m = re.find(&self.buffer)?;
        let text = String::from_utf8_lossy(m.as_bytes()).into_owned();
        let end = m.end();
        self.buffer.drain(..end);
        Some(text)
    }

    /// Drop old output. Call only after the whole buffer was searched.
    fn trim_searched(&mut self) {
        if self.buffer.len() > MAX_BUFFER {
            let excess = self.buffer.len() - SEARCH_WINDOW;
            self.buffer.drain(..excess);
        }
    }

    fn receive(&mut self, deadline: Option<Instant>) -> Received {
        let outcome = match deadline {
            None => self.chunks.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.chunks.recv_timeout(remaining)
            }
        };
        match outcome {
            Ok(bytes) => Received::Data(bytes),
            Err(RecvTimeoutError::Timeout) => Received::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Received::Closed,
        }
    }

    /// Move everything already delivered into the buffer without blocking.
    fn drain_pending(&mut self) {
        while let Ok(bytes) = self.chunks.try_recv() {
            self.buffer.extend_from_slice(&bytes);
        }
    }
}

impl Console for ConsoleSession {
    fn await_pattern(&mut self, pattern: &str, timeout: WaitTimeout) -> Result<String> {
        let re = Regex::new(pattern).map_err(|source| ProvisionError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        let deadline = timeout.deadline(Instant::now());
        debug!(pattern, ?timeout, "awaiting console pattern");

        loop {
            if let Some(text) = self.consume_match(&re) {
                debug!(pattern, "console pattern matched");
                return Ok(text);
            }
            self.trim_searched();
            if self.eof {
                warn!(pattern, "console closed before pattern appeared");
                return Err(ProvisionError::ConsoleClosed {
                    pattern: pattern.to_string(),
                    tail: self.tail(),
                });
            }
            match self.receive(deadline) {
                Received::Data(bytes) => {
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_pending();
                }
                Received::TimedOut => {
                    warn!(pattern, ?timeout, "timed out waiting for console pattern");
                    return Err(ProvisionError::PatternTimeout {
                        pattern: pattern.to_string(),
                        timeout: timeout.duration(),
                        tail: self.tail(),
                    });
                }
                Received::Closed => self.eof = true,
            }
        }
    }

    fn send(&mut self, text: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "console stdin is closed"))?;
        stdin.write_all(text.as_bytes())?;
        stdin.flush()?;
        debug!(bytes = text.len(), "sent to console");
        Ok(())
    }

    fn await_eof(&mut self, timeout: WaitTimeout) -> Result<()> {
        let deadline = timeout.deadline(Instant::now());
        while !self.eof {
            match self.receive(deadline) {
                Received::Data(bytes) => self.buffer.extend_from_slice(&bytes),
                Received::TimedOut => {
                    return Err(ProvisionError::PatternTimeout {
                        pattern: "<EOF>".to_string(),
                        timeout: timeout.duration(),
                        tail: self.tail(),
                    });
                }
                Received::Closed => self.eof = true,
            }
        }
        debug!("console stream ended");
        Ok(())
    }

    fn close(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        drop(self.stdin.take());

        let status = match self.child.try_wait()? {
            Some(status) => status,
            None => match self.child.wait_timeout(CLOSE_GRACE)? {
                Some(status) => status,
                None => {
                    warn!(program = %self.program, "console child still running, killing");
                    // kill fails only if the child already exited; wait() reaps either way
                    let _ = self.child.kill();
                    self.child.wait()?
                }
            },
        };

        for handle in self.readers.drain(..) {
            if handle.join().is_err() {
                warn!("console reader thread panicked");
            }
        }

        let code = status.code();
        self.exit_code = Some(code);
        info!(program = %self.program, exit_code = ?code, "console session closed");
        Ok(code)
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            if let Err(err) = self.close() {
                warn!(err = %err, "failed to close console session on drop");
            }
        }
    }
}

fn spawn_reader<R>(
    mut stream: R,
    tx: Sender<Vec<u8>>,
    observer: Arc<Mutex<ObserverSink>>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut sink) = observer.lock() {
                        if let Err(e) = sink.write_all(&chunk[..n]).and_then(|()| sink.flush()) {
                            debug!(err = %e, "observer write failed");
                        }
                    }
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(err = %e, "console stream read failed");
                    break;
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn match_consumes_through_match_end() {
        let mut session =
            ConsoleSession::spawn(sh("printf 'login: first\\nlogin: second\\n'"), Box::new(io::sink()))
                .expect("spawn");

        let first = session
            .await_pattern("login: \\w+", WaitTimeout::secs(5))
            .expect("first");
        let second = session
            .await_pattern("login: \\w+", WaitTimeout::secs(5))
            .expect("second");

        assert_eq!(first, "login: first");
        assert_eq!(second, "login: second");
        session.close().expect("close");
    }

    #[test]
    fn stream_end_before_match_is_console_closed() {
        let mut session =
            ConsoleSession::spawn(sh("echo booting"), Box::new(io::sink())).expect("spawn");
        let err = session
            .await_pattern("never", WaitTimeout::secs(5))
            .expect_err("closed");
        match err {
            ProvisionError::ConsoleClosed { tail, .. } => assert!(tail.contains("booting")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_regex_is_reported() {
        let mut session = ConsoleSession::spawn(sh("true"), Box::new(io::sink())).expect("spawn");
        let err = session
            .await_pattern("(unclosed", WaitTimeout::secs(1))
            .expect_err("invalid");
        assert!(matches!(err, ProvisionError::InvalidPattern { .. }));
    }

    #[test]
    fn match_inside_a_large_burst_is_found() {
        let script = "printf 'MARKER\\n'; head -c 2000000 /dev/zero | tr '\\0' a";
        let mut session = ConsoleSession::spawn(sh(script), Box::new(io::sink())).expect("spawn");
        // let the whole burst queue up before the first wait
        thread::sleep(Duration::from_millis(1500));

        let text = session
            .await_pattern("MARKER", WaitTimeout::secs(3))
            .expect("marker");

        assert_eq!(text, "MARKER");
        session.close().expect("close");
    }

    #[test]
    fn huge_timeout_waits_without_a_deadline() {
        assert_eq!(WaitTimeout::secs(u64::MAX).deadline(Instant::now()), None);

        let mut session = ConsoleSession::spawn(sh("echo ready"), Box::new(io::sink())).expect("spawn");
        let text = session
            .await_pattern("ready", WaitTimeout::secs(u64::MAX))
            .expect("ready");
        assert_eq!(text, "ready");
        session.close().expect("close");
    }

    #[test]
    fn close_is_idempotent() {
        let mut session = ConsoleSession::spawn(sh("exit 7"), Box::new(io::sink())).expect("spawn");
        session.await_eof(WaitTimeout::secs(5)).expect("eof");
        assert_eq!(session.close().expect("close"), Some(7));
        assert_eq!(session.close().expect("close again"), Some(7));
    }

    #[test]
    fn tee_sink_writes_every_sink() {
        #[derive(Clone, Default)]
        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().expect("lock").extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let a = Shared::default();
        let b = Shared::default();
        let mut tee = TeeSink::new(vec![Box::new(a.clone()), Box::new(b.clone())]);
        tee.write_all(b"hello").expect("write");
        assert_eq!(a.0.lock().expect("lock").as_slice(), b"hello");
        assert_eq!(b.0.lock().expect("lock").as_slice(), b"hello");
    }
}
