//! Borg process spawning and control.
//!
//! `BorgCommand` assembles the argv for a single borg invocation with the
//! machine-readable flags forced on, and `BorgProcess` wraps the spawned
//! child with take-once access to its stdio handles.

use std::borrow::Cow;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The borg binary was not found.
    #[error("borg binary not found")]
    NotFound,
    /// Permission denied when spawning.
    #[error("permission denied")]
    PermissionDenied,
    /// Other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            _ => Self::Io(err),
        }
    }
}

/// Signals forwardable to a running borg subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorgSignal {
    /// SIGINT: checkpoint and stop.
    Interrupt,
    /// SIGTERM: shut down.
    Terminate,
}

/// Deliver `sig` to the process with the given pid.
#[cfg(unix)]
pub(crate) fn send_signal(pid: u32, sig: BorgSignal) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match sig {
        BorgSignal::Interrupt => Signal::SIGINT,
        BorgSignal::Terminate => Signal::SIGTERM,
    };
    let pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
    kill(pid, signal).map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

#[cfg(not(unix))]
pub(crate) fn send_signal(_pid: u32, _sig: BorgSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signal delivery is unix-only",
    ))
}

/// Builder for a single borg invocation.
///
/// The machine-readable flags (`--log-json --json`) are always prepended so
/// control messages arrive as line-delimited JSON on the structured stream.
#[derive(Debug, Clone)]
pub struct BorgCommand {
    command: String,
    options: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
    progress: bool,
    verbose: bool,
    capture_primary: bool,
    interactive: bool,
}

impl BorgCommand {
    /// Create a builder for the given borg subcommand.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            options: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            progress: false,
            verbose: false,
            capture_primary: false,
            interactive: true,
        }
    }

    /// Append one option.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.options.push(arg.into());
        self
    }

    /// Append options.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add environment variables for the subprocess.
    ///
    /// Secrets (the repository passphrase) travel here, never on argv.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the working directory for the subprocess.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Request per-line progress events on the structured stream.
    #[must_use]
    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Insert `--verbose` ahead of the subcommand options.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Accumulate primary-stream lines instead of yielding them as events.
    #[must_use]
    pub fn capture_primary(mut self, capture: bool) -> Self {
        self.capture_primary = capture;
        self
    }

    /// Detach stdin; prompt answering becomes unsupported for this run.
    #[must_use]
    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }

    /// Whether primary-stream lines are captured for this call.
    #[must_use]
    pub fn captures_primary(&self) -> bool {
        self.capture_primary
    }

    /// Whether an input channel will be attached to the subprocess.
    #[must_use]
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// Build the command-line arguments.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec!["--log-json".to_string(), "--json".to_string()];
        if self.progress {
            args.push("--progress".to_string());
        }
        args.push(self.command.clone());
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args.extend(self.options.iter().cloned());
        args
    }

    /// Render the full command line for logging, shell-escaped.
    #[must_use]
    pub fn render(&self, binary: &str) -> String {
        std::iter::once(binary.to_string())
            .chain(self.build_args())
            .map(|arg| shell_escape::escape(Cow::from(arg)).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A running borg subprocess.
#[derive(Debug)]
pub struct BorgProcess {
    child: Child,
}

impl BorgProcess {
    /// Spawn a borg subprocess for the given command.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn(binary: &str, command: &BorgCommand) -> Result<Self, SpawnError> {
        let mut cmd = Command::new(binary);
        cmd.args(command.build_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        cmd.stdin(if command.interactive {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        if let Some(ref dir) = command.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(SpawnError::from_io)?;
        Ok(Self { child })
    }

    /// Take ownership of the stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take ownership of the stderr handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Take ownership of the stdin handle.
    ///
    /// `None` when the process was spawned non-interactively, or on a
    /// second call.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Get the process ID, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Forcefully kill the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill signal cannot be sent.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_args_forces_machine_readable_flags() {
        let args = BorgCommand::new("create").build_args();
        assert_eq!(args[0], "--log-json");
        assert_eq!(args[1], "--json");
        assert_eq!(args[2], "create");
    }

    #[test]
    fn build_args_progress_before_subcommand() {
        let args = BorgCommand::new("create").progress(true).build_args();
        assert_eq!(args, vec!["--log-json", "--json", "--progress", "create"]);
    }

    #[test]
    fn build_args_verbose_leads_the_options() {
        let args = BorgCommand::new("prune")
            .verbose(true)
            .args(["--keep-daily", "7"])
            .build_args();
        assert_eq!(
            args,
            vec!["--log-json", "--json", "prune", "--verbose", "--keep-daily", "7"]
        );
    }

    #[test]
    fn render_escapes_shell_metacharacters() {
        let rendered = BorgCommand::new("create")
            .arg("path with spaces")
            .render("borg");
        assert!(rendered.starts_with("borg --log-json --json create"));
        assert!(rendered.contains("'path with spaces'"));
    }

    #[test]
    fn builder_is_clone() {
        let command = BorgCommand::new("list").arg("::");
        assert_eq!(command.build_args(), command.clone().build_args());
    }

    #[tokio::test]
    async fn spawn_and_wait() {
        let command = BorgCommand::new("ignored");
        let mut process = BorgProcess::spawn("true", &command).expect("spawn true");
        assert!(process.id().is_some());
        // `true` ignores the extra flags and exits 0
        let status = process.wait().await.expect("wait");
        assert!(status.success());
    }

    #[tokio::test]
    async fn spawn_missing_binary_is_not_found() {
        let command = BorgCommand::new("create");
        let result = BorgProcess::spawn("borg-binary-that-does-not-exist-12345", &command);
        assert!(matches!(result, Err(SpawnError::NotFound)));
    }

    #[tokio::test]
    async fn stdio_handles_take_once() {
        let command = BorgCommand::new("ignored");
        let mut process = BorgProcess::spawn("true", &command).expect("spawn true");
        assert!(process.take_stdout().is_some());
        assert!(process.take_stdout().is_none());
        assert!(process.take_stderr().is_some());
        assert!(process.take_stderr().is_none());
        assert!(process.take_stdin().is_some());
        assert!(process.take_stdin().is_none());
        process.wait().await.expect("wait");
    }

    #[tokio::test]
    async fn non_interactive_spawn_has_no_stdin() {
        let command = BorgCommand::new("ignored").non_interactive();
        let mut process = BorgProcess::spawn("true", &command).expect("spawn true");
        assert!(process.take_stdin().is_none());
        process.wait().await.expect("wait");
    }
}
