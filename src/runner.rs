use anyhow::{Context, Result};
use std::{
    collections::HashSet,
    io::{self, Read, Write},
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Sender},
        Arc,
    },
    thread,
    time::Instant,
};

const READ_CHUNK_SIZE: usize = 1024;

/// Logical role of a captured child stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamRole::Stdout => write!(f, "stdout"),
            StreamRole::Stderr => write!(f, "stderr"),
        }
    }
}

/// What a reader thread pulled off its stream.
#[derive(Debug)]
pub enum Payload {
    /// A non-empty chunk of raw bytes.
    Data(Vec<u8>),
    /// Zero-length read: the stream is closed.
    Eof,
    /// The read failed (e.g. broken pipe); terminal for the stream.
    ReadError(io::Error),
}

/// One event on the shared queue: which stream, what happened, when.
#[derive(Debug)]
pub struct StreamEvent {
    pub role: StreamRole,
    pub payload: Payload,
    pub at: Instant,
}

/// Dedicated reader draining one child stream into the shared channel.
///
/// Posts exactly one terminal event (`Eof` or `ReadError`) before finishing.
/// `request_exit` is cooperative: the flag is checked between blocking reads,
/// so the thread only notices once the current read returns.
pub struct ReadThread {
    role: StreamRole,
    exit_requested: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ReadThread {
    pub fn spawn<R: Read + Send + 'static>(
        role: StreamRole,
        mut reader: R,
        tx: Sender<StreamEvent>,
    ) -> Self {
        let exit_requested = Arc::new(AtomicBool::new(false));
        let exit_flag = Arc::clone(&exit_requested);

        let handle = thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK_SIZE];

            loop {
                if exit_flag.load(Ordering::SeqCst) {
                    let _ = tx.send(StreamEvent {
                        role,
                        payload: Payload::Eof,
                        at: Instant::now(),
                    });
                    break;
                }

                match reader.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(StreamEvent {
                            role,
                            payload: Payload::Eof,
                            at: Instant::now(),
                        });
                        break;
                    }
                    Ok(n) => {
                        // Receiver gone means nobody wants the rest
                        if tx
                            .send(StreamEvent {
                                role,
                                payload: Payload::Data(buf[..n].to_vec()),
                                at: Instant::now(),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("read error on {}: {}", role, e);
                        let _ = tx.send(StreamEvent {
                            role,
                            payload: Payload::ReadError(e),
                            at: Instant::now(),
                        });
                        break;
                    }
                }
            }
        });

        Self {
            role,
            exit_requested,
            handle: Some(handle),
        }
    }

    /// Ask the thread to stop after its current read. Best-effort only; the
    /// channel may still need draining before the thread can finish a send.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::SeqCst);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("reader thread for {} panicked", self.role);
            }
        }
    }
}

/// Where the child's stdin comes from.
#[derive(Debug)]
pub enum StdinSource {
    /// Inherit the parent's stdin.
    Inherit,
    /// Connect stdin to /dev/null.
    Null,
    /// Feed the given bytes, then close.
    Bytes(Vec<u8>),
}

/// Command to run: argv vector plus launch options.
#[derive(Debug)]
pub struct RunCommand {
    argv: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    stdin: StdinSource,
}

impl RunCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            stdin: StdinSource::Null,
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, source: StdinSource) -> Self {
        self.stdin = source;
        self
    }
}

/// Caller-supplied state machine receiving process I/O events.
///
/// The runner creates a pipe for a stream iff the matching `want_` flag is
/// true; with neither set the child inherits the parent's streams and no
/// reader threads are started.
pub trait Protocol {
    type Output;

    fn want_stdout(&self) -> bool;
    fn want_stderr(&self) -> bool;

    /// Called right after spawn, before any output is read. The child handle
    /// allows immediate interaction (writing stdin, signalling).
    fn connection_made(&mut self, child: &mut Child) -> Result<()> {
        let _ = child;
        Ok(())
    }

    fn pipe_data_received(&mut self, role: StreamRole, data: &[u8]) {
        let _ = (role, data);
    }

    fn pipe_connection_lost(&mut self, role: StreamRole, err: Option<io::Error>) {
        let _ = (role, err);
    }

    fn process_exited(&mut self) {}

    fn connection_lost(&mut self, err: Option<io::Error>) {
        let _ = err;
    }

    /// Extract the final result once the child has exited. `exit_code` is
    /// signed: `-N` when the child was killed by signal `N`.
    fn take_result(&mut self, exit_code: i32) -> Self::Output;
}

/// Signed exit code: negative signal number when the child died to a signal.
#[cfg(unix)]
fn exit_code_of(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(0),
    }
}

#[cfg(not(unix))]
fn exit_code_of(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(0)
}

/// Runs an external command to completion, multiplexing its captured output
/// into a `Protocol`.
///
/// Per-stream event order matches the order bytes were produced; ordering
/// between stdout and stderr is whatever the OS delivers. A non-zero exit is
/// not an error here; it lands in the result via `take_result`.
///
/// Known limitation: the child is waited on only after every captured stream
/// has reported closed, so a child that exits while some other process holds
/// its pipe open keeps the event loop blocked. There are no timeouts.
pub struct Runner;

impl Runner {
    pub fn run<P: Protocol>(command: &RunCommand, mut protocol: P) -> Result<P::Output> {
        let program = command
            .argv
            .first()
            .context("empty argument vector")?;

        let mut cmd = Command::new(program);
        cmd.args(&command.argv[1..]);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        cmd.stdout(if protocol.want_stdout() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        cmd.stderr(if protocol.want_stderr() {
            Stdio::piped()
        } else {
            Stdio::inherit()
        });
        cmd.stdin(match &command.stdin {
            StdinSource::Inherit => Stdio::inherit(),
            StdinSource::Null => Stdio::null(),
            StdinSource::Bytes(_) => Stdio::piped(),
        });

        log::debug!("spawning: {:?}", command.argv);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;

        // Feed stdin from its own thread so a full pipe cannot deadlock us
        // against an unread stdout.
        let stdin_feeder = if let StdinSource::Bytes(bytes) = &command.stdin {
            let mut stdin = child.stdin.take().context("child stdin not piped")?;
            let bytes = bytes.clone();
            Some(thread::spawn(move || {
                if let Err(e) = stdin.write_all(&bytes) {
                    log::debug!("writing child stdin failed: {}", e);
                }
            }))
        } else {
            None
        };

        if let Err(e) = protocol.connection_made(&mut child) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::new();
        let mut active: HashSet<StreamRole> = HashSet::new();

        if protocol.want_stdout() {
            let out = child.stdout.take().context("child stdout not piped")?;
            readers.push(ReadThread::spawn(StreamRole::Stdout, out, tx.clone()));
            active.insert(StreamRole::Stdout);
        }
        if protocol.want_stderr() {
            let err = child.stderr.take().context("child stderr not piped")?;
            readers.push(ReadThread::spawn(StreamRole::Stderr, err, tx.clone()));
            active.insert(StreamRole::Stderr);
        }
        drop(tx);

        while !active.is_empty() {
            let event = match rx.recv() {
                Ok(event) => event,
                // All senders gone without terminal events: readers panicked.
                Err(_) => break,
            };
            match event.payload {
                Payload::Data(data) => protocol.pipe_data_received(event.role, &data),
                Payload::Eof => {
                    protocol.pipe_connection_lost(event.role, None);
                    active.remove(&event.role);
                }
                Payload::ReadError(e) => {
                    protocol.pipe_connection_lost(event.role, Some(e));
                    active.remove(&event.role);
                }
            }
        }

        let status = child.wait().context("Failed to wait on child process")?;
        for reader in &mut readers {
            reader.join();
        }
        if let Some(feeder) = stdin_feeder {
            let _ = feeder.join();
        }

        let code = exit_code_of(&status);
        log::debug!("{} exited with code {}", program, code);

        let result = protocol.take_result(code);
        protocol.process_exited();
        protocol.connection_lost(None);
        Ok(result)
    }
}

/// Captured output of a finished process.
#[derive(Debug)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Default protocol: buffer both streams, return them with the exit code.
#[derive(Debug, Default)]
pub struct CaptureOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Protocol for CaptureOutput {
    type Output = RunOutput;

    fn want_stdout(&self) -> bool {
        true
    }

    fn want_stderr(&self) -> bool {
        true
    }

    fn pipe_data_received(&mut self, role: StreamRole, data: &[u8]) {
        match role {
            StreamRole::Stdout => self.stdout.extend_from_slice(data),
            StreamRole::Stderr => self.stderr.extend_from_slice(data),
        }
    }

    fn take_result(&mut self, exit_code: i32) -> RunOutput {
        RunOutput {
            code: exit_code,
            stdout: std::mem::take(&mut self.stdout),
            stderr: std::mem::take(&mut self.stderr),
        }
    }
}

/// Protocol that captures nothing; the child inherits both streams.
#[derive(Debug, Default)]
pub struct NoCapture;

impl Protocol for NoCapture {
    type Output = i32;

    fn want_stdout(&self) -> bool {
        false
    }

    fn want_stderr(&self) -> bool {
        false
    }

    fn take_result(&mut self, exit_code: i32) -> i32 {
        exit_code
    }
}
