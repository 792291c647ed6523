use anyhow::{bail, Context, Result};
use std::{
    collections::HashMap,
    io::{BufRead, BufReader, Write},
    path::Path,
};

/// Protocol version announced to the host on startup.
const PROTOCOL_VERSION: u32 = 1;

/// Default cost reported for `GETCOST` when a remote does not override it.
pub const DEFAULT_COST: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Availability {
    Local,
    Global,
}

impl Availability {
    fn as_token(self) -> &'static str {
        match self {
            Availability::Local => "LOCAL",
            Availability::Global => "GLOBAL",
        }
    }
}

/// Outcome of a presence check against a remote.
#[derive(Debug)]
pub enum Presence {
    Present,
    Absent,
    /// Presence could not be determined; the message explains why.
    Unknown(String),
}

/// Loop driver decision returned by request handlers.
#[derive(Debug)]
pub enum LoopControl {
    Continue,
    Stop(Option<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EngineState {
    Idle,
    Active,
    Terminated,
}

/// Collapse an error message onto one line so it cannot break wire framing.
fn one_line(msg: &str) -> String {
    msg.replace(['\n', '\r'], "; ")
}

/// Line transport to the git-annex host, plus the outbound query helpers the
/// engine offers to concrete remotes.
///
/// `send` outside the active state is a logged no-op: the host is not
/// listening yet, or not anymore.
pub struct AnnexIo {
    input: Box<dyn BufRead + Send>,
    output: Box<dyn Write + Send>,
    state: EngineState,
}

impl AnnexIo {
    pub fn new(input: Box<dyn BufRead + Send>, output: Box<dyn Write + Send>) -> Self {
        Self {
            input,
            output,
            state: EngineState::Idle,
        }
    }

    /// Transport over the process's own stdin/stdout, the way git-annex
    /// launches an external remote.
    pub fn stdio() -> Self {
        Self::new(
            Box::new(BufReader::new(std::io::stdin())),
            Box::new(std::io::stdout()),
        )
    }

    pub fn send(&mut self, line: &str) {
        if self.state != EngineState::Active {
            log::debug!("dropping line while {:?}: {}", self.state, line);
            return;
        }
        log::debug!("=> {}", line);
        if writeln!(self.output, "{}", line).and_then(|_| self.output.flush()).is_err() {
            log::error!("failed to write to host: {}", line);
        }
    }

    /// Emit the final `ERROR` line regardless of engine state. Used exactly
    /// once, on the fatal-exit path, so the host is never left hanging.
    pub fn fatal(&mut self, msg: &str) {
        let line = format!("ERROR {}", one_line(msg));
        log::debug!("=> {}", line);
        let _ = writeln!(self.output, "{}", line);
        let _ = self.output.flush();
    }

    pub fn debug(&mut self, msg: &str) {
        self.send(&format!("DEBUG {}", one_line(msg)));
    }

    pub fn progress(&mut self, bytes: u64) {
        self.send(&format!("PROGRESS {}", bytes));
    }

    /// Read the next request line. `None` means end of input (or a bare
    /// empty line), which terminates the session cleanly.
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self
            .input
            .read_line(&mut line)
            .context("Failed to read from host")?;
        if n == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        log::debug!("<= {}", line);
        if line.is_empty() {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }

    /// Read one `VALUE <val>` reply to an outbound query. An empty value is
    /// returned as an empty string.
    fn read_value(&mut self) -> Result<String> {
        let line = self
            .read_line()?
            .context("Host closed the connection mid-query")?;
        if line == "VALUE" {
            return Ok(String::new());
        }
        line.strip_prefix("VALUE ")
            .map(str::to_string)
            .with_context(|| format!("expected VALUE reply, got: {}", line))
    }

    /// Two-level hash directory the host uses for `key`.
    pub fn dirhash(&mut self, key: &str) -> Result<String> {
        self.send(&format!("DIRHASH {}", key));
        self.read_value()
    }

    /// Value of a per-remote configuration setting.
    pub fn getconfig(&mut self, name: &str) -> Result<String> {
        self.send(&format!("GETCONFIG {}", name));
        self.read_value()
    }

    /// URLs recorded for `key` under one scheme prefix. The host answers
    /// with `VALUE` lines until an empty one ends the list.
    pub fn geturls(&mut self, key: &str, prefix: &str) -> Result<Vec<String>> {
        self.send(&format!("GETURLS {} {}", key, prefix));
        let mut urls = Vec::new();
        loop {
            let value = self.read_value()?;
            if value.is_empty() {
                return Ok(urls);
            }
            urls.push(value);
        }
    }

    /// All URLs recorded for `key` across the given schemes, order and
    /// duplicates preserved as received.
    pub fn urls_for_key(&mut self, schemes: &[&str], key: &str) -> Result<Vec<String>> {
        let mut all = Vec::new();
        for scheme in schemes {
            all.extend(self.geturls(key, &format!("{}:", scheme))?);
        }
        Ok(all)
    }
}

/// Behavior a concrete special remote plugs into the engine.
///
/// Hooks receive the transport so they can issue outbound queries
/// (`DIRHASH`, `GETURLS`, ...) and report `PROGRESS` mid-operation. Hook
/// errors never reach the host as anything but a protocol-level failure
/// response.
pub trait SpecialRemote {
    fn name(&self) -> &'static str;

    fn cost(&self) -> u32 {
        DEFAULT_COST
    }

    fn availability(&self) -> Availability {
        Availability::Local
    }

    /// URL schemes this remote claims via `CLAIMURL`.
    fn url_schemes(&self) -> &[&str];

    fn init(&mut self, io: &mut AnnexIo) -> Result<()> {
        let _ = io;
        Ok(())
    }

    fn prepare(&mut self, io: &mut AnnexIo) -> Result<()> {
        let _ = io;
        Ok(())
    }

    /// Size of the content behind `url`: `Ok(Some(n))` when known,
    /// `Ok(None)` for present-but-unknown size, `Err` when the URL cannot
    /// be resolved at all.
    fn check_url(&mut self, io: &mut AnnexIo, url: &str) -> Result<Option<u64>> {
        let _ = (io, url);
        bail!("CHECKURL not implemented by {}", self.name())
    }

    fn check_present(&mut self, io: &mut AnnexIo, key: &str) -> Result<Presence> {
        let _ = (io, key);
        bail!("CHECKPRESENT not implemented by {}", self.name())
    }

    /// Fetch the content for `key` into `dest`. The engine translates the
    /// result into the terminal `TRANSFER-SUCCESS`/`TRANSFER-FAILURE` line.
    fn retrieve(&mut self, io: &mut AnnexIo, key: &str, dest: &Path) -> Result<()> {
        let _ = (io, dest);
        bail!("{} cannot retrieve {}", self.name(), key)
    }

    fn remove(&mut self, io: &mut AnnexIo, key: &str) -> Result<()> {
        let _ = (io, key);
        bail!("removal not supported by {}", self.name())
    }

    fn whereis(&mut self, io: &mut AnnexIo, key: &str) -> Result<Option<String>> {
        let _ = (io, key);
        Ok(None)
    }
}

type Handler<R> = fn(&mut Engine<R>, &str) -> Result<LoopControl>;

/// Request loop for one special-remote session.
///
/// Requests are dispatched through an explicit verb table built at
/// construction; unknown verbs get `UNSUPPORTED-REQUEST` and the loop keeps
/// going. A failing handler is logged, reported to the host as a `DEBUG`
/// diagnostic, and never kills the session. Strictly one request is in
/// flight at a time; nested outbound queries complete before the next
/// request line is read.
pub struct Engine<R: SpecialRemote> {
    io: AnnexIo,
    remote: R,
    handlers: HashMap<&'static str, Handler<R>>,
}

impl<R: SpecialRemote> Engine<R> {
    pub fn new(remote: R, io: AnnexIo) -> Self {
        let mut handlers: HashMap<&'static str, Handler<R>> = HashMap::new();
        handlers.insert("INITREMOTE", Self::req_initremote);
        handlers.insert("PREPARE", Self::req_prepare);
        handlers.insert("GETCOST", Self::req_getcost);
        handlers.insert("GETAVAILABILITY", Self::req_getavailability);
        handlers.insert("CLAIMURL", Self::req_claimurl);
        handlers.insert("CHECKURL", Self::req_checkurl);
        handlers.insert("CHECKPRESENT", Self::req_checkpresent);
        handlers.insert("TRANSFER", Self::req_transfer);
        handlers.insert("REMOVE", Self::req_remove);
        handlers.insert("WHEREIS", Self::req_whereis);
        handlers.insert("EXPORTSUPPORTED", Self::req_exportsupported);
        handlers.insert("GETINFO", Self::req_getinfo);
        handlers.insert("ERROR", Self::req_error);
        Self {
            io,
            remote,
            handlers,
        }
    }

    /// Register an additional verb (or override a default one).
    pub fn with_handler(mut self, verb: &'static str, handler: Handler<R>) -> Self {
        self.handlers.insert(verb, handler);
        self
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Transport access for handlers registered via `with_handler`.
    pub fn io_mut(&mut self) -> &mut AnnexIo {
        &mut self.io
    }

    /// Run the request loop to completion. End of input terminates cleanly;
    /// only an unanticipated transport error escapes as `Err`.
    pub fn run(&mut self) -> Result<()> {
        self.io.state = EngineState::Active;
        self.io.send(&format!("VERSION {}", PROTOCOL_VERSION));

        let result = self.run_loop();
        self.io.state = EngineState::Terminated;
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            let line = match self.io.read_line()? {
                Some(line) => line,
                None => {
                    log::debug!("end of input from host, stopping");
                    return Ok(());
                }
            };

            let (verb, rest) = match line.split_once(' ') {
                Some((verb, rest)) => (verb, rest),
                None => (line.as_str(), ""),
            };

            let handler = match self.handlers.get(verb).copied() {
                Some(handler) => handler,
                None => {
                    log::warn!("unsupported request: {}", verb);
                    self.io.send("UNSUPPORTED-REQUEST");
                    continue;
                }
            };

            match handler(self, rest) {
                Ok(LoopControl::Continue) => {}
                Ok(LoopControl::Stop(msg)) => {
                    if let Some(msg) = msg {
                        log::info!("stopping: {}", msg);
                    }
                    return Ok(());
                }
                Err(e) => {
                    // Full chain for the log, one short line for the host.
                    log::debug!("request {} failed: {:#}", verb, e);
                    log::warn!("request {} failed: {}", verb, e);
                    self.io.debug(&format!("{} failed: {}", verb, e));
                }
            }
        }
    }

    fn req_initremote(&mut self, _rest: &str) -> Result<LoopControl> {
        match self.remote.init(&mut self.io) {
            Ok(()) => self.io.send("INITREMOTE-SUCCESS"),
            Err(e) => self.io.send(&format!("INITREMOTE-FAILURE {}", one_line(&format!("{:#}", e)))),
        }
        Ok(LoopControl::Continue)
    }

    fn req_prepare(&mut self, _rest: &str) -> Result<LoopControl> {
        match self.remote.prepare(&mut self.io) {
            Ok(()) => self.io.send("PREPARE-SUCCESS"),
            Err(e) => self.io.send(&format!("PREPARE-FAILURE {}", one_line(&format!("{:#}", e)))),
        }
        Ok(LoopControl::Continue)
    }

    fn req_getcost(&mut self, _rest: &str) -> Result<LoopControl> {
        let cost = self.remote.cost();
        self.io.send(&format!("COST {}", cost));
        Ok(LoopControl::Continue)
    }

    fn req_getavailability(&mut self, _rest: &str) -> Result<LoopControl> {
        let availability = self.remote.availability();
        self.io
            .send(&format!("AVAILABILITY {}", availability.as_token()));
        Ok(LoopControl::Continue)
    }

    fn req_claimurl(&mut self, rest: &str) -> Result<LoopControl> {
        let claimed = rest
            .split_once(':')
            .map(|(scheme, _)| self.remote.url_schemes().contains(&scheme))
            .unwrap_or(false);
        if claimed {
            self.io.send("CLAIMURL-SUCCESS");
        } else {
            self.io.send("CLAIMURL-FAILURE");
        }
        Ok(LoopControl::Continue)
    }

    fn req_checkurl(&mut self, rest: &str) -> Result<LoopControl> {
        match self.remote.check_url(&mut self.io, rest) {
            Ok(Some(size)) => self.io.send(&format!("CHECKURL-CONTENTS {}", size)),
            Ok(None) => self.io.send("CHECKURL-CONTENTS UNKNOWN"),
            Err(e) => {
                log::debug!("CHECKURL {} failed: {:#}", rest, e);
                self.io.send("CHECKURL-FAILURE");
            }
        }
        Ok(LoopControl::Continue)
    }

    fn req_checkpresent(&mut self, rest: &str) -> Result<LoopControl> {
        let key = rest;
        let presence = self
            .remote
            .check_present(&mut self.io, key)
            .unwrap_or_else(|e| Presence::Unknown(format!("{:#}", e)));
        match presence {
            Presence::Present => self.io.send(&format!("CHECKPRESENT-SUCCESS {}", key)),
            Presence::Absent => self.io.send(&format!("CHECKPRESENT-FAILURE {}", key)),
            Presence::Unknown(msg) => self
                .io
                .send(&format!("CHECKPRESENT-UNKNOWN {} {}", key, one_line(&msg))),
        }
        Ok(LoopControl::Continue)
    }

    fn req_transfer(&mut self, rest: &str) -> Result<LoopControl> {
        // The file path may contain spaces: limit-3 split.
        let mut parts = rest.splitn(3, ' ');
        let (direction, key, file) = match (parts.next(), parts.next(), parts.next()) {
            (Some(direction), Some(key), Some(file)) => (direction, key, file),
            _ => {
                log::warn!("malformed TRANSFER request: {}", rest);
                self.io.send("UNSUPPORTED-REQUEST");
                return Ok(LoopControl::Continue);
            }
        };

        if direction != "RETRIEVE" {
            self.io.send("UNSUPPORTED-REQUEST");
            return Ok(LoopControl::Continue);
        }

        match self.remote.retrieve(&mut self.io, key, Path::new(file)) {
            Ok(()) => self.io.send(&format!("TRANSFER-SUCCESS RETRIEVE {}", key)),
            Err(e) => self.io.send(&format!(
                "TRANSFER-FAILURE RETRIEVE {} {}",
                key,
                one_line(&format!("{:#}", e))
            )),
        }
        Ok(LoopControl::Continue)
    }

    fn req_remove(&mut self, rest: &str) -> Result<LoopControl> {
        let key = rest;
        match self.remote.remove(&mut self.io, key) {
            Ok(()) => self.io.send(&format!("REMOVE-SUCCESS {}", key)),
            Err(e) => self.io.send(&format!(
                "REMOVE-FAILURE {} {}",
                key,
                one_line(&format!("{:#}", e))
            )),
        }
        Ok(LoopControl::Continue)
    }

    fn req_whereis(&mut self, rest: &str) -> Result<LoopControl> {
        match self.remote.whereis(&mut self.io, rest) {
            Ok(Some(location)) => self
                .io
                .send(&format!("WHEREIS-SUCCESS {}", one_line(&location))),
            Ok(None) => self.io.send("WHEREIS-FAILURE"),
            Err(e) => {
                log::debug!("WHEREIS {} failed: {:#}", rest, e);
                self.io.send("WHEREIS-FAILURE");
            }
        }
        Ok(LoopControl::Continue)
    }

    fn req_exportsupported(&mut self, _rest: &str) -> Result<LoopControl> {
        self.io.send("EXPORTSUPPORTED-FAILURE");
        Ok(LoopControl::Continue)
    }

    fn req_getinfo(&mut self, _rest: &str) -> Result<LoopControl> {
        let name = self.remote.name();
        let cost = self.remote.cost();
        self.io.send("INFOFIELD remote type");
        self.io.send(&format!("INFOVALUE {}", name));
        self.io.send("INFOFIELD cost");
        self.io.send(&format!("INFOVALUE {}", cost));
        self.io.send("INFOEND");
        Ok(LoopControl::Continue)
    }

    /// The host reported a fatal error; stop the session.
    fn req_error(&mut self, rest: &str) -> Result<LoopControl> {
        Ok(LoopControl::Stop(Some(format!("host error: {}", rest))))
    }
}

/// Process wrapper around the engine: any error escaping the loop is logged,
/// reported to the host as a single `ERROR` line, and mapped to a non-zero
/// exit code. This is the only path by which the remote dies abnormally.
pub fn serve<R: SpecialRemote>(engine: &mut Engine<R>) -> i32 {
    match engine.run() {
        Ok(()) => 0,
        Err(e) => {
            log::error!("remote terminated: {:#}", e);
            engine.io.fatal(&format!("{:#}", e));
            1
        }
    }
}
