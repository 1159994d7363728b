//! Child process runner with output capture and a hard deadline.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, trace};

/// How long to keep reading pipes after the child is gone. Grandchildren that
/// inherited the pipes can keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const POLL: Duration = Duration::from_millis(100);

/// Result of a finished (or killed) child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the child was killed by a signal.
    pub status: Option<i32>,
    /// Interleaved stdout and stderr lines.
    pub output: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }

    /// Last `n` lines of captured output.
    pub fn tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.output.lines().collect();
        lines[lines.len().saturating_sub(n)..].join("\n")
    }
}

/// Builder around `std::process::Command`.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    dir: Option<PathBuf>,
    timeout: Option<Duration>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            dir: None,
            timeout: None,
            error_msg: None,
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_opt(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Message used by [`Cmd::run`] when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }

    /// Spawn, capture output and wait. Never fails on a non-zero exit; only
    /// spawn and pipe errors are reported as `Err`.
    pub fn capture(&self) -> io::Result<CommandOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        debug!(command = %self.display(), "spawning");
        let start = Instant::now();
        let mut child = cmd.spawn()?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx);
        }

        let deadline = self.timeout.map(|t| start + t);
        let mut lines = Vec::new();
        let mut timed_out = false;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status.code();
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                timed_out = true;
                kill_tree(&mut child);
                let status = child.wait()?;
                break status.code();
            }
            match rx.recv_timeout(POLL) {
                Ok(line) => lines.push(line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Pipes closed; the child is about to exit.
                    let status = match deadline {
                        Some(d) => wait_until(&mut child, d)?,
                        None => Some(child.wait()?),
                    };
                    match status {
                        Some(status) => break status.code(),
                        None => {
                            timed_out = true;
                            kill_tree(&mut child);
                            break child.wait()?.code();
                        }
                    }
                }
            }
        };

        drain(&rx, &mut lines);
        let duration = start.elapsed();
        trace!(command = %self.display(), ?status, ?duration, timed_out, "finished");

        Ok(CommandOutput {
            status,
            output: lines.join("\n"),
            duration,
            timed_out,
        })
    }

    /// Like [`Cmd::capture`] but a non-zero exit or a timeout is an error.
    pub fn run(&self) -> Result<CommandOutput> {
        let out = self
            .capture()
            .with_context(|| format!("Failed to spawn '{}'", self.program))?;
        if out.success() {
            return Ok(out);
        }
        let what = self
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.display()));
        if out.timed_out {
            bail!("{what}: timed out after {:?}\n{}", out.duration, out.tail(20));
        }
        match out.status {
            Some(code) => bail!("{what} (exit code {code})\n{}", out.tail(20)),
            None => bail!("{what} (killed by signal)\n{}", out.tail(20)),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: R, tx: mpsc::Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!(error = %e, "pipe read failed");
                    break;
                }
            }
            let end = buf.len() - buf.ends_with(b"\n") as usize;
            let line = String::from_utf8_lossy(&buf[..end]);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            // Read to EOF even after the receiver is gone.
            let _ = tx.send(line);
        }
    });
}

fn drain(rx: &Receiver<String>, lines: &mut Vec<String>) {
    let until = Instant::now() + DRAIN_GRACE;
    loop {
        let left = until.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        match rx.recv_timeout(left.min(POLL)) {
            Ok(line) => lines.push(line),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Kill the child's whole process group, then the child itself.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        match Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => debug!(group = %group, %status, "kill of process group failed"),
            Err(e) => debug!(group = %group, error = %e, "could not run kill"),
        }
    }
    if let Err(e) = child.kill() {
        debug!(pid = child.id(), error = %e, "kill of child failed");
    }
}
