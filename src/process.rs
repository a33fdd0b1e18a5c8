//! Interactive driver for a single subprocess.
//!
//! Output from stdout and stderr is buffered from the moment the child is
//! spawned. A wait registers one predicate that is evaluated against the
//! unconsumed text of both channels; the first channel to satisfy it wins and
//! the matched text is consumed so it can never satisfy a later step.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const READ_CHUNK_BYTES: usize = 8 * 1024;
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Stdout, Channel::Stderr];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
        }
    }

    fn index(self) -> usize {
        match self {
            Channel::Stdout => 0,
            Channel::Stderr => 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    pub env_remove: Vec<OsString>,
    /// Written to stdin right after spawn; stdin is closed afterwards.
    /// Cannot be combined with `inherit_stdin`.
    pub input: Option<String>,
    pub inherit_stdin: bool,
    /// Makes `finish` fail with `NonZeroExit` unless the child exits with 0.
    pub reject_on_failure: bool,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_remove(mut self, key: impl Into<OsString>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn inherit_stdin(mut self, inherit: bool) -> Self {
        self.inherit_stdin = inherit;
        self
    }

    pub fn reject_on_failure(mut self, reject: bool) -> Self {
        self.reject_on_failure = reject;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn channel(&self, channel: Channel) -> &str {
        match channel {
            Channel::Stdout => &self.stdout,
            Channel::Stderr => &self.stderr,
        }
    }
}

/// The outcome of a satisfied wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMatch {
    pub channel: Channel,
    /// Text consumed by this match, from the previous cursor up to the
    /// shortest line-aligned prefix (or the whole buffer) that satisfied
    /// the predicate.
    pub text: String,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to write to stdin: {0}")]
    Write(String),
    #[error("wait_for_output called while another wait is pending on the same process")]
    ProtocolViolation,
    #[error("process {} before the expected output appeared", describe_exit(.output.exit_code))]
    ProcessExited { output: ProcessOutput },
    #[error("expected output did not appear within {timeout:?}")]
    WaitTimeout {
        timeout: Duration,
        output: ProcessOutput,
    },
    #[error("process {}", describe_exit(.output.exit_code))]
    NonZeroExit { output: ProcessOutput },
    #[error("invalid spawn options: {0}")]
    InvalidOptions(&'static str),
    #[error("process io error: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// Output accumulated up to the failure, when the error carries it.
    pub fn output(&self) -> Option<&ProcessOutput> {
        match self {
            ProcessError::ProcessExited { output }
            | ProcessError::WaitTimeout { output, .. }
            | ProcessError::NonZeroExit { output } => Some(output),
            _ => None,
        }
    }
}

pub(crate) fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

#[derive(Debug, Default)]
struct OutputState {
    buffers: [String; 2],
    closed: [bool; 2],
    exited: bool,
    exit_code: Option<i32>,
}

impl OutputState {
    fn finished(&self) -> bool {
        self.exited && self.closed.iter().all(|closed| *closed)
    }

    fn snapshot(&self) -> ProcessOutput {
        ProcessOutput {
            exit_code: self.exit_code,
            stdout: self.buffers[Channel::Stdout.index()].clone(),
            stderr: self.buffers[Channel::Stderr.index()].clone(),
        }
    }
}

/// One spawned subprocess, owned by a single scenario.
///
/// Methods take `&self` so `finish` or `kill` can run while a wait is still
/// pending. Dropping the handle kills the child if it is still running.
#[derive(Debug)]
pub struct ManagedProcess {
    program: String,
    pid: Option<u32>,
    state: Arc<watch::Sender<OutputState>>,
    cursors: Mutex<[usize; 2]>,
    waiting: AtomicBool,
    stdin: AsyncMutex<Option<ChildStdin>>,
    kill_switch: Mutex<Option<oneshot::Sender<()>>>,
    reject_on_failure: bool,
}

impl ManagedProcess {
    /// Spawns `program` with `args`. Must be called from within a tokio
    /// runtime.
    pub fn spawn<I, S>(
        program: impl AsRef<OsStr>,
        args: I,
        options: SpawnOptions,
    ) -> Result<Self, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.as_ref();
        let label = program.to_string_lossy().into_owned();
        if options.inherit_stdin && options.input.is_some() {
            return Err(ProcessError::InvalidOptions(
                "initial input cannot be written to an inherited stdin",
            ));
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if options.inherit_stdin {
            cmd.stdin(Stdio::inherit());
        } else {
            cmd.stdin(Stdio::piped());
        }
        if let Some(dir) = options.working_dir.as_ref() {
            cmd.current_dir(dir);
        }
        for key in &options.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: label.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(program = %label, pid, "spawned process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("failed to capture stderr"))?;

        let (state, _) = watch::channel(OutputState::default());
        let state = Arc::new(state);
        let readers = [
            spawn_reader(stdout, Channel::Stdout, Arc::clone(&state)),
            spawn_reader(stderr, Channel::Stderr, Arc::clone(&state)),
        ];

        let stdin = match (child.stdin.take(), options.input) {
            (Some(pipe), Some(input)) => {
                write_initial_input(pipe, input);
                None
            }
            (pipe, _) => pipe,
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(
            child,
            kill_rx,
            Arc::clone(&state),
            readers,
            label.clone(),
        ));

        Ok(Self {
            program: label,
            pid,
            state,
            cursors: Mutex::new([0, 0]),
            waiting: AtomicBool::new(false),
            stdin: AsyncMutex::new(stdin),
            kill_switch: Mutex::new(Some(kill_tx)),
            reject_on_failure: options.reject_on_failure,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.state.borrow().exited
    }

    /// Everything received so far, matched or not.
    pub fn snapshot(&self) -> ProcessOutput {
        self.state.borrow().snapshot()
    }

    /// Resolves once either channel's unconsumed text satisfies `predicate`.
    ///
    /// Already buffered text is checked first, then the whole unconsumed text
    /// of a channel again whenever it grows. Fails with `ProcessExited` if the
    /// child exits and both channels close without a match, and with
    /// `ProtocolViolation` if another wait is pending on this process.
    pub async fn wait_for_output<P>(&self, predicate: P) -> Result<PromptMatch, ProcessError>
    where
        P: Fn(&str) -> bool,
    {
        let _guard = WaitGuard::acquire(&self.waiting)?;
        let cursors = *self.lock_cursors();
        let mut evaluated = [None::<usize>; 2];
        let mut receiver = self.state.subscribe();

        loop {
            let (grown, exited_output) = {
                let state = receiver.borrow_and_update();
                let grown = Channel::ALL.map(|channel| {
                    let index = channel.index();
                    let buffer = &state.buffers[index];
                    let unseen = evaluated[index].is_none_or(|len| buffer.len() > len);
                    unseen.then(|| buffer[cursors[index]..].to_string())
                });
                (grown, state.finished().then(|| state.snapshot()))
            };

            // Predicates run outside the state lock so readers keep draining.
            let mut consumed = [None::<usize>; 2];
            for channel in Channel::ALL {
                let index = channel.index();
                let Some(pending) = grown[index].as_deref() else {
                    continue;
                };
                evaluated[index] = Some(cursors[index] + pending.len());
                if !pending.is_empty() && predicate(pending) {
                    consumed[index] = Some(shortest_match(pending, &predicate));
                }
            }

            if let Some(channel) = Channel::ALL
                .into_iter()
                .find(|channel| consumed[channel.index()].is_some())
            {
                let mut cursor_guard = self.lock_cursors();
                for other in Channel::ALL {
                    let index = other.index();
                    if let Some(end) = consumed[index] {
                        cursor_guard[index] = cursors[index] + end;
                        if other != channel {
                            debug!(
                                program = %self.program,
                                channel = other.as_str(),
                                bytes = end,
                                "also consumed matching text on the other channel"
                            );
                        }
                    }
                }
                drop(cursor_guard);

                let index = channel.index();
                let end = consumed[index].unwrap_or_default();
                let text = grown[index]
                    .as_deref()
                    .map(|pending| pending[..end].to_string())
                    .unwrap_or_default();
                debug!(
                    program = %self.program,
                    channel = channel.as_str(),
                    bytes = text.len(),
                    "output matched"
                );
                return Ok(PromptMatch { channel, text });
            }

            if let Some(output) = exited_output {
                debug!(program = %self.program, "process exited before output matched");
                return Err(ProcessError::ProcessExited { output });
            }

            receiver
                .changed()
                .await
                .map_err(|_| io::Error::other("output state closed"))?;
        }
    }

    /// `wait_for_output` bounded by `timeout`. Buffered text is left intact
    /// when the timeout fires.
    pub async fn wait_for_output_timeout<P>(
        &self,
        predicate: P,
        timeout: Duration,
    ) -> Result<PromptMatch, ProcessError>
    where
        P: Fn(&str) -> bool,
    {
        match tokio::time::timeout(timeout, self.wait_for_output(predicate)).await {
            Ok(result) => result,
            Err(_) => Err(ProcessError::WaitTimeout {
                timeout,
                output: self.snapshot(),
            }),
        }
    }

    /// Writes `text` verbatim to the child's stdin. No newline is added.
    pub async fn send(&self, text: &str) -> Result<(), ProcessError> {
        if self.has_exited() {
            return Err(ProcessError::Write("process has exited".to_string()));
        }
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            return Err(ProcessError::Write("stdin is closed".to_string()));
        };
        pipe.write_all(text.as_bytes())
            .await
            .map_err(|err| ProcessError::Write(err.to_string()))?;
        pipe.flush()
            .await
            .map_err(|err| ProcessError::Write(err.to_string()))?;
        trace!(program = %self.program, bytes = text.len(), "sent input");
        Ok(())
    }

    pub async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    /// Waits for the child to exit and both output channels to close.
    pub async fn finish(&self) -> Result<ProcessOutput, ProcessError> {
        let mut receiver = self.state.subscribe();
        let output = {
            let state = receiver
                .wait_for(OutputState::finished)
                .await
                .map_err(|_| io::Error::other("output state closed"))?;
            state.snapshot()
        };
        self.stdin.lock().await.take();

        if self.reject_on_failure && !output.success() {
            return Err(ProcessError::NonZeroExit { output });
        }
        Ok(output)
    }

    /// Kills the child. Pending waits then fail with `ProcessExited`.
    pub fn kill(&self) {
        let switch = self
            .kill_switch
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();
        if let Some(switch) = switch {
            debug!(program = %self.program, "killing process");
            let _ = switch.send(());
        }
    }

    fn lock_cursors(&self) -> MutexGuard<'_, [usize; 2]> {
        self.cursors
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

struct WaitGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> WaitGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ProcessError> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(ProcessError::ProtocolViolation);
        }
        Ok(Self { flag })
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// Bisects over line ends, then the end of the text. `text` as a whole must
// satisfy `predicate`. The result always satisfies it and is the shortest
// such prefix for predicates that stay true as text is appended.
fn shortest_match<P>(text: &str, predicate: &P) -> usize
where
    P: Fn(&str) -> bool,
{
    let mut ends: Vec<usize> = text.match_indices('\n').map(|(offset, _)| offset + 1).collect();
    if ends.last() != Some(&text.len()) {
        ends.push(text.len());
    }
    let (mut low, mut high) = (0, ends.len() - 1);
    while low < high {
        let mid = low + (high - low) / 2;
        if predicate(&text[..ends[mid]]) {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    ends[high]
}

fn spawn_reader<R>(
    reader: R,
    channel: Channel,
    state: Arc<watch::Sender<OutputState>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        let mut decoder = Utf8Decoder::default();
        let index = channel.index();
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(read) => {
                    let text = decoder.push(&chunk[..read]);
                    if text.is_empty() {
                        continue;
                    }
                    trace!(channel = channel.as_str(), bytes = read, "output chunk");
                    state.send_modify(|state| state.buffers[index].push_str(&text));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(channel = channel.as_str(), error = %err, "output read failed");
                    break;
                }
            }
        }
        let rest = decoder.finish();
        state.send_modify(|state| {
            state.buffers[index].push_str(&rest);
            state.closed[index] = true;
        });
    })
}

fn write_initial_input(mut pipe: ChildStdin, input: String) {
    tokio::spawn(async move {
        if let Err(err) = pipe.write_all(input.as_bytes()).await {
            debug!(error = %err, "failed to write initial input");
        }
    });
}

async fn supervise(
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    state: Arc<watch::Sender<OutputState>>,
    mut readers: [JoinHandle<()>; 2],
    program: String,
) {
    // A dropped kill switch means the owning handle is gone.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            if let Err(err) = child.start_kill() {
                debug!(program = %program, error = %err, "kill failed");
            }
            child.wait().await
        }
    };
    let exit_code = match status {
        Ok(status) => exit_code_of(status),
        Err(err) => {
            warn!(program = %program, error = %err, "failed to wait for process");
            None
        }
    };
    debug!(program = %program, ?exit_code, "process exited");
    state.send_modify(|state| {
        state.exited = true;
        state.exit_code = exit_code;
    });

    // A background grandchild may inherit the pipes and hold them open.
    let drained = tokio::time::timeout(EXIT_DRAIN_GRACE, async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        debug!(program = %program, "output still open after exit, closing channels");
        for reader in &readers {
            reader.abort();
        }
        state.send_modify(|state| state.closed = [true, true]);
    }
}

fn exit_code_of(status: ExitStatus) -> Option<i32> {
    status.code()
}

/// Decodes UTF-8 across chunk boundaries, holding back an incomplete
/// trailing sequence until the next chunk arrives.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut decoded = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    decoded.push_str(text);
                    self.pending.clear();
                    return decoded;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return decoded;
                        }
                        Some(invalid) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
