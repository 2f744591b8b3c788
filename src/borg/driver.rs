//! The borg process controller.
//!
//! [`Borg`] owns the lifecycle of one subprocess at a time: it spawns borg
//! with the machine-readable flags, fans both output streams into a
//! [`LineMux`], and hands back an [`EventStream`] that lazily decodes the
//! structured stream while the process is still running. Signal forwarding
//! and prompt answering go through the controller, guarded by the lifecycle
//! state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;

use super::error::BorgError;
use super::events::{classify_msgid, BorgEvent, BorgMessage, Classification};
use super::mux::{LineMux, RawLine, StreamTag};
use super::process::{send_signal, BorgCommand, BorgProcess, BorgSignal};

/// Lifecycle of the controller's current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No subprocess; a new run may start.
    Idle,
    /// A subprocess is alive and its streams are being drained.
    Running,
    /// The subprocess exited with the recorded code.
    Finished(Option<i32>),
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Finished(_) => "finished",
        }
    }
}

/// State shared between the controller and the event stream of the active run.
#[derive(Debug)]
struct Shared {
    lifecycle: Lifecycle,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    awaiting_prompt: bool,
}

impl Shared {
    fn transition(&mut self, to: Lifecycle) {
        tracing::debug!(from = ?self.lifecycle, to = ?to, "lifecycle transition");
        self.lifecycle = to;
    }

    fn clear_run(&mut self) {
        self.pid = None;
        self.stdin = None;
        self.awaiting_prompt = false;
    }
}

fn lock_shared(shared: &Arc<Mutex<Shared>>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a fully-drained run produced.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    /// Primary-stream lines accumulated when capture was on, in read order.
    pub captured: Vec<String>,
    /// Exit code of the subprocess, `None` if killed by a signal.
    pub exit_code: Option<i32>,
}

/// Drives borg subprocesses.
///
/// One controller runs at most one subprocess at a time and is reusable
/// across sequential runs; starting a run while another is active fails with
/// [`BorgError::InvalidState`].
#[derive(Debug)]
pub struct Borg {
    binary: String,
    dryrun: bool,
    verbose: bool,
    shared: Arc<Mutex<Shared>>,
}

impl Borg {
    /// Create a controller for the `borg` binary on PATH.
    #[must_use]
    pub fn new(dryrun: bool, verbose: bool) -> Self {
        Self::with_binary("borg", dryrun, verbose)
    }

    /// Create a controller for a specific binary (also used by tests).
    #[must_use]
    pub fn with_binary(binary: impl Into<String>, dryrun: bool, verbose: bool) -> Self {
        Self {
            binary: binary.into(),
            dryrun,
            verbose,
            shared: Arc::new(Mutex::new(Shared {
                lifecycle: Lifecycle::Idle,
                pid: None,
                stdin: None,
                awaiting_prompt: false,
            })),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        lock_shared(&self.shared).lifecycle
    }

    /// Whether this controller echoes commands instead of executing them.
    #[must_use]
    pub fn is_dryrun(&self) -> bool {
        self.dryrun
    }

    /// Start a run and return its lazily-consumed event stream.
    ///
    /// In dry-run mode the command line is logged and an empty stream is
    /// returned without spawning anything.
    ///
    /// # Errors
    ///
    /// [`BorgError::InvalidState`] if a run is already active, or
    /// [`BorgError::Spawn`] if the executable cannot be launched.
    pub fn run(&self, command: BorgCommand) -> Result<EventStream, BorgError> {
        let command = command.verbose(self.verbose);

        if self.dryrun {
            tracing::info!(command = %command.render(&self.binary), "dry run, not executing");
            return Ok(EventStream::empty(Arc::clone(&self.shared)));
        }

        let mut shared = lock_shared(&self.shared);
        if shared.lifecycle != Lifecycle::Idle {
            return Err(BorgError::InvalidState {
                operation: "start a run",
                state: shared.lifecycle.name(),
            });
        }

        let mut process = BorgProcess::spawn(&self.binary, &command)?;
        let (tap, mux) = LineMux::channel();
        if let Some(stdout) = process.take_stdout() {
            tap.attach(StreamTag::Primary, stdout);
        }
        if let Some(stderr) = process.take_stderr() {
            tap.attach(StreamTag::Secondary, stderr);
        }
        drop(tap);

        shared.transition(Lifecycle::Running);
        shared.pid = process.id();
        shared.stdin = process.take_stdin();
        shared.awaiting_prompt = false;
        tracing::debug!(pid = ?shared.pid, command = %command.render(&self.binary), "borg spawned");

        Ok(EventStream::new(
            Arc::clone(&self.shared),
            mux,
            process,
            command.captures_primary(),
        ))
    }

    /// Forward a signal to the running subprocess.
    ///
    /// # Errors
    ///
    /// [`BorgError::InvalidState`] unless a run is active.
    pub fn signal(&self, sig: BorgSignal) -> Result<(), BorgError> {
        let shared = lock_shared(&self.shared);
        if shared.lifecycle != Lifecycle::Running {
            return Err(BorgError::InvalidState {
                operation: "signal the process",
                state: shared.lifecycle.name(),
            });
        }
        let Some(pid) = shared.pid else {
            return Err(BorgError::InvalidState {
                operation: "signal the process",
                state: "running without a pid",
            });
        };
        send_signal(pid, sig)?;
        Ok(())
    }

    /// Send SIGINT: borg checkpoints and stops.
    ///
    /// # Errors
    ///
    /// See [`Borg::signal`].
    pub fn interrupt(&self) -> Result<(), BorgError> {
        self.signal(BorgSignal::Interrupt)
    }

    /// Send SIGTERM.
    ///
    /// # Errors
    ///
    /// See [`Borg::signal`].
    pub fn terminate(&self) -> Result<(), BorgError> {
        self.signal(BorgSignal::Terminate)
    }

    /// Answer the prompt borg is currently waiting on.
    ///
    /// Valid only while a run is active and the most recently yielded event
    /// was a prompt. The answer is written to the subprocess stdin followed
    /// by a newline.
    ///
    /// # Errors
    ///
    /// [`BorgError::InvalidState`] outside a pending prompt,
    /// [`BorgError::NotSupported`] when the run has no input channel.
    pub async fn answer_prompt(&self, answer: &str) -> Result<(), BorgError> {
        let mut stdin = {
            let mut shared = lock_shared(&self.shared);
            if shared.lifecycle != Lifecycle::Running {
                return Err(BorgError::InvalidState {
                    operation: "answer a prompt",
                    state: shared.lifecycle.name(),
                });
            }
            if !shared.awaiting_prompt {
                return Err(BorgError::InvalidState {
                    operation: "answer a prompt",
                    state: "running with no pending prompt",
                });
            }
            shared.stdin.take().ok_or(BorgError::NotSupported)?
        };

        let written = async {
            stdin.write_all(answer.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        let mut shared = lock_shared(&self.shared);
        shared.stdin = Some(stdin);
        written?;
        shared.awaiting_prompt = false;
        Ok(())
    }

    /// Answer the pending prompt with `YES`.
    ///
    /// # Errors
    ///
    /// See [`Borg::answer_prompt`].
    pub async fn yes(&self) -> Result<(), BorgError> {
        self.answer_prompt("YES").await
    }

    /// Answer the pending prompt with `NO`.
    ///
    /// # Errors
    ///
    /// See [`Borg::answer_prompt`].
    pub async fn no(&self) -> Result<(), BorgError> {
        self.answer_prompt("NO").await
    }
}

/// Lazily yields the events of one run.
///
/// Exhausting the stream waits on the subprocess, records its exit code, and
/// returns the controller to `Idle`. Dropping it early still reaps the
/// subprocess and resets the controller, so no zombie is left behind either
/// way.
pub struct EventStream {
    shared: Arc<Mutex<Shared>>,
    mux: Option<LineMux>,
    process: Option<BorgProcess>,
    capture_primary: bool,
    captured: Vec<String>,
    exit_code: Option<i32>,
    done: bool,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("capture_primary", &self.capture_primary)
            .field("captured", &self.captured)
            .field("exit_code", &self.exit_code)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    fn new(
        shared: Arc<Mutex<Shared>>,
        mux: LineMux,
        process: BorgProcess,
        capture_primary: bool,
    ) -> Self {
        Self {
            shared,
            mux: Some(mux),
            process: Some(process),
            capture_primary,
            captured: Vec::new(),
            exit_code: None,
            done: false,
        }
    }

    fn empty(shared: Arc<Mutex<Shared>>) -> Self {
        Self {
            shared,
            mux: None,
            process: None,
            capture_primary: false,
            captured: Vec::new(),
            exit_code: None,
            done: true,
        }
    }

    /// The next event, or `None` once both streams closed and the process
    /// has been waited on.
    ///
    /// # Errors
    ///
    /// [`BorgError::ToolReported`] when a fatal message id arrives,
    /// [`BorgError::MalformedEvent`] on a protocol violation. In both cases
    /// the remaining stream data is drained and the process reaped before
    /// the error is returned; the stream yields nothing afterwards.
    pub async fn next_event(&mut self) -> Result<Option<BorgEvent>, BorgError> {
        if self.done {
            return Ok(None);
        }
        loop {
            let line = match self.mux.as_mut() {
                Some(mux) => mux.recv().await,
                None => None,
            };
            let Some(RawLine { tag, text }) = line else {
                self.complete().await?;
                return Ok(None);
            };

            match tag {
                StreamTag::Primary => {
                    if self.capture_primary {
                        self.captured.push(text);
                        continue;
                    }
                    lock_shared(&self.shared).awaiting_prompt = false;
                    return Ok(Some(BorgEvent::RawOutput(text)));
                }
                StreamTag::Secondary => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    let msg = match BorgMessage::parse(&text) {
                        Ok(msg) => msg,
                        Err(err) => {
                            self.drain_and_reap().await;
                            return Err(err);
                        }
                    };
                    if let BorgMessage::LogMessage(log) = &msg {
                        match classify_msgid(log.msgid.as_deref()) {
                            Classification::Fatal => {
                                let err = log.to_tool_reported();
                                self.drain_and_reap().await;
                                return Err(err);
                            }
                            Classification::Prompt => {
                                lock_shared(&self.shared).awaiting_prompt = true;
                                return Ok(Some(BorgEvent::Message(msg)));
                            }
                            Classification::Info => {}
                        }
                    }
                    lock_shared(&self.shared).awaiting_prompt = false;
                    return Ok(Some(BorgEvent::Message(msg)));
                }
            }
        }
    }

    /// Consume the remaining events and return the run outcome.
    ///
    /// # Errors
    ///
    /// Propagates any error [`EventStream::next_event`] would return.
    pub async fn finish(mut self) -> Result<RunOutcome, BorgError> {
        while self.next_event().await?.is_some() {}
        Ok(RunOutcome {
            captured: std::mem::take(&mut self.captured),
            exit_code: self.exit_code,
        })
    }

    /// Adapt the stream to a [`futures_core::Stream`] of event results.
    ///
    /// After an error item the stream ends.
    pub fn into_stream(self) -> impl futures_core::Stream<Item = Result<BorgEvent, BorgError>> {
        futures_util::stream::unfold(self, |mut events| async move {
            match events.next_event().await {
                Ok(Some(event)) => Some((Ok(event), events)),
                Ok(None) => None,
                Err(err) => Some((Err(err), events)),
            }
        })
    }

    /// Primary-stream lines captured so far.
    #[must_use]
    pub fn captured(&self) -> &[String] {
        &self.captured
    }

    /// Both streams hit end-of-file: wait on the child, record the exit
    /// code, and return the controller to `Idle`.
    async fn complete(&mut self) -> Result<(), BorgError> {
        self.done = true;
        self.mux = None;

        let waited = match self.process.take() {
            Some(mut process) => process.wait().await.map(Some),
            None => Ok(None),
        };
        let code = match &waited {
            Ok(Some(status)) => status.code(),
            _ => None,
        };
        self.exit_code = code;

        let mut shared = lock_shared(&self.shared);
        shared.clear_run();
        shared.transition(Lifecycle::Finished(code));
        shared.transition(Lifecycle::Idle);
        drop(shared);

        waited?;
        Ok(())
    }

    /// Error path: let both readers reach end-of-stream (a full pipe would
    /// otherwise stall the child forever), then reap the process. The
    /// original error wins over any failure during cleanup.
    async fn drain_and_reap(&mut self) {
        if let Some(mux) = self.mux.as_mut() {
            while let Some(line) = mux.recv().await {
                if line.tag == StreamTag::Primary && self.capture_primary {
                    self.captured.push(line.text);
                }
            }
        }
        if let Err(error) = self.complete().await {
            tracing::debug!(%error, "wait after aborted run failed");
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // abandoned mid-run: reap the child off-task and reset the
        // controller; dropping the shared stdin unblocks a pending prompt
        if let Some(mut process) = self.process.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = process.wait().await;
                });
            }
        }
        let mut shared = lock_shared(&self.shared);
        shared.clear_run();
        shared.transition(Lifecycle::Idle);
    }
}
