//! Process-backed workers.
//!
//! Each worker thread owns one long-lived child process and talks to it over
//! its standard streams, one JSON document per line:
//!
//! ```text
//! parent -> child   <item as JSON>\n
//! child  -> parent  {"ok": <result as JSON>}\n
//!                   {"error": "<message>"}\n
//!                   {"panic": "<message>"}\n
//! ```
//!
//! The child's standard error is inherited. When the stream breaks or a
//! reply cannot be decoded the item fails with a transport error, the child
//! is killed, and a fresh one is started for the next item. The child side
//! of the protocol lives in [`serve_stdio`](super::serve_stdio).

use super::{panic_message, Disposition, Envelope};
use crate::errors::ItemError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use thiserror::Error;
use tracing::{debug, warn};

/// How to start the child process behind a process stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCommand {
    /// Program to execute, resolved through `PATH`.
    pub program: String,
    /// Command line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProcessCommand {
    /// Creates a command for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Creates a command that re-executes the running binary.
    ///
    /// Pair it with [`env`](Self::env) and a check in `main` that hands
    /// control to [`serve_stdio`](super::serve_stdio), so a Rust stage
    /// function can run in a child process.
    ///
    /// # Errors
    ///
    /// Returns an error if the path of the running binary is unavailable.
    pub fn current_exe() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe.to_string_lossy()))
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        command
    }
}

/// One reply line from a child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reply<T> {
    /// The item was processed.
    Ok(T),
    /// The child reported a failure for this item.
    Error(String),
    /// The stage function panicked inside the child.
    Panic(String),
}

/// Failure to move an item across the process boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The child could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Reading from or writing to the child failed.
    #[error("pipe error: {0}")]
    Io(#[from] io::Error),

    /// The item could not be serialized.
    #[error("could not encode item: {0}")]
    Encode(#[source] serde_json::Error),

    /// The reply line was not a valid reply document.
    #[error("could not decode reply: {0}")]
    Decode(#[source] serde_json::Error),

    /// The child closed its output before replying.
    #[error("child process exited before replying")]
    Closed,
}

/// A running child and its pipes.
struct ChildSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    line: String,
}

impl ChildSession {
    fn start(command: &ProcessCommand) -> Result<Self, TransportError> {
        let spawn_error = |source: io::Error| TransportError::Spawn {
            program: command.program.clone(),
            source,
        };

        let mut child = command.to_command().spawn().map_err(spawn_error)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(spawn_error(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "child standard streams were not captured",
            )));
        };

        debug!(program = %command.program, pid = child.id(), "child process started");
        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            line: String::new(),
        })
    }

    /// Sends one encoded item (newline included) and reads the reply line.
    fn call<O: DeserializeOwned>(&mut self, frame: &[u8]) -> Result<Reply<O>, TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;
        stdin.write_all(frame)?;
        stdin.flush()?;

        self.line.clear();
        if self.stdout.read_line(&mut self.line)? == 0 {
            return Err(TransportError::Closed);
        }
        serde_json::from_str(self.line.trim_end()).map_err(TransportError::Decode)
    }

    fn kill(mut self) {
        let _ = self.child.kill();
    }
}

impl Drop for ChildSession {
    fn drop(&mut self) {
        // Closing stdin is the end-of-input signal.
        drop(self.stdin.take());
        match self.child.wait() {
            Ok(status) => debug!(pid = self.child.id(), %status, "child process exited"),
            Err(err) => warn!(pid = self.child.id(), error = %err, "failed to reap child process"),
        }
    }
}

/// Per-worker client that feeds items to a child process.
///
/// The child is started eagerly and restarted lazily after a transport
/// failure. Dropping the client closes the child's input and waits for it.
pub(crate) struct ProcessClient<I, O> {
    stage: String,
    command: ProcessCommand,
    session: Option<ChildSession>,
    restarts: u64,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> ProcessClient<I, O>
where
    I: Serialize,
    O: DeserializeOwned,
{
    pub(crate) fn start(stage: &str, command: ProcessCommand) -> Self {
        let session = match ChildSession::start(&command) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!(stage, error = %err, "child process failed to start; retrying on first item");
                None
            }
        };

        Self {
            stage: stage.to_string(),
            command,
            session,
            restarts: 0,
            _types: PhantomData,
        }
    }

    /// Handles one envelope. Upstream failures are forwarded untouched.
    pub(crate) fn handle(&mut self, envelope: Envelope<I>) -> (Envelope<O>, Disposition) {
        let (seq, item) = match envelope.open() {
            Ok(parts) => parts,
            Err(forwarded) => return (forwarded, Disposition::Forwarded),
        };

        match self.call(seq, &item) {
            Ok(value) => (Envelope::new(seq, value), Disposition::Processed),
            Err(err) => (Envelope::failed(err), Disposition::Failed),
        }
    }

    fn call(&mut self, seq: u64, item: &I) -> Result<O, ItemError> {
        let frame = self.encode(seq, item)?;
        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                let session = ChildSession::start(&self.command)
                    .map_err(|err| self.transport_failure(seq, &err))?;
                self.restarts += 1;
                debug!(stage = %self.stage, restarts = self.restarts, "child process restarted");
                session
            }
        };

        match session.call(&frame) {
            Ok(reply) => {
                self.session = Some(session);
                match reply {
                    Reply::Ok(value) => Ok(value),
                    Reply::Error(message) => {
                        warn!(stage = %self.stage, seq, error = %message, "item failed in child process");
                        Err(ItemError::failed(seq, &self.stage, message))
                    }
                    Reply::Panic(message) => {
                        warn!(stage = %self.stage, seq, panic = %message, "stage function panicked in child process");
                        Err(ItemError::panicked(seq, &self.stage, message))
                    }
                }
            }
            Err(err) => {
                session.kill();
                Err(self.transport_failure(seq, &err))
            }
        }
    }

    /// Encodes `item` as one protocol line before any child is involved, so
    /// a failing `Serialize` impl leaves the running child untouched.
    fn encode(&self, seq: u64, item: &I) -> Result<Vec<u8>, ItemError> {
        match catch_unwind(AssertUnwindSafe(|| serde_json::to_vec(item))) {
            Ok(Ok(mut frame)) => {
                frame.push(b'\n');
                Ok(frame)
            }
            Ok(Err(err)) => Err(self.transport_failure(seq, &TransportError::Encode(err))),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(stage = %self.stage, seq, panic = %message, "item panicked while being encoded");
                Err(ItemError::panicked(seq, &self.stage, message))
            }
        }
    }

    fn transport_failure(&self, seq: u64, err: &TransportError) -> ItemError {
        warn!(stage = %self.stage, seq, error = %err, "process transport failed");
        ItemError::transport(seq, &self.stage, err.to_string())
    }

    #[cfg(test)]
    fn restarts(&self) -> u64 {
        self.restarts
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::errors::ItemErrorKind;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn script(body: &str) -> (NamedTempFile, ProcessCommand) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.flush().unwrap();
        let command = ProcessCommand::new("sh").arg(file.path().to_string_lossy());
        (file, command)
    }

    const DOUBLER: &str = r#"
while read -r n; do
  echo "{\"ok\": $((n * 2))}"
done
"#;

    #[test]
    fn test_reply_wire_format() {
        let ok: Reply<i64> = serde_json::from_str(r#"{"ok": 4}"#).unwrap();
        let err: Reply<i64> = serde_json::from_str(r#"{"error": "nope"}"#).unwrap();

        assert_eq!(ok, Reply::Ok(4));
        assert_eq!(err, Reply::Error("nope".to_string()));
        assert_eq!(serde_json::to_string(&Reply::Ok("a")).unwrap(), r#"{"ok":"a"}"#);
    }

    #[test]
    fn test_command_from_json() {
        let command: ProcessCommand =
            serde_json::from_str(r#"{"program": "python3", "args": ["-u", "worker.py"]}"#).unwrap();

        assert_eq!(command, ProcessCommand::new("python3").args(["-u", "worker.py"]));
        assert!(command.env.is_empty());
    }

    #[test]
    fn test_client_round_trips_items() {
        let (_file, command) = script(DOUBLER);
        let mut client = ProcessClient::<i64, i64>::start("double", command);

        for seq in 0..5_u64 {
            let value = i64::try_from(seq).unwrap();
            let (out, disposition) = client.handle(Envelope::new(seq, value));
            assert_eq!(disposition, Disposition::Processed);
            assert_eq!(out, Envelope::new(seq, value * 2));
        }
        assert_eq!(client.restarts(), 0);
    }

    #[test]
    fn test_child_reported_error_keeps_child() {
        let (_file, command) = script(
            r#"
while read -r n; do
  if [ $((n % 3)) -eq 0 ]; then
    echo "{\"error\": \"multiple of three: $n\"}"
  else
    echo "{\"ok\": $n}"
  fi
done
"#,
        );
        let mut client = ProcessClient::<u64, u64>::start("threes", command);

        let (out, disposition) = client.handle(Envelope::new(0, 3));
        assert_eq!(disposition, Disposition::Failed);
        let err = out.body.unwrap_err();
        assert_eq!(err.kind, ItemErrorKind::Failed);
        assert_eq!(err.message, "multiple of three: 3");

        let (out, _) = client.handle(Envelope::new(1, 4));
        assert_eq!(out.body, Ok(4));
        assert_eq!(client.restarts(), 0);
    }

    #[test]
    fn test_child_exit_is_transport_error_and_restarts() {
        // Answers a single item, then exits.
        let (_file, command) = script(
            r#"
read -r n
echo "{\"ok\": $n}"
"#,
        );
        let mut client = ProcessClient::<u32, u32>::start("once", command);

        let (first, _) = client.handle(Envelope::new(0, 10));
        let (second, _) = client.handle(Envelope::new(1, 11));
        let (third, _) = client.handle(Envelope::new(2, 12));

        assert_eq!(first.body, Ok(10));
        assert_eq!(second.body.unwrap_err().kind, ItemErrorKind::Transport);
        assert_eq!(third.body, Ok(12));
        assert_eq!(client.restarts(), 1);
    }

    #[test]
    fn test_garbage_reply_is_transport_error() {
        let (_file, command) = script(
            r#"
while read -r n; do
  echo "not json"
done
"#,
        );
        let mut client = ProcessClient::<u8, u8>::start("garbage", command);

        let (out, disposition) = client.handle(Envelope::new(0, 1));
        assert_eq!(disposition, Disposition::Failed);
        let err = out.body.unwrap_err();
        assert_eq!(err.kind, ItemErrorKind::Transport);
        assert!(err.message.starts_with("could not decode reply"));
    }

    #[test]
    fn test_missing_program_fails_every_item() {
        let command = ProcessCommand::new("/nonexistent/conveyor-worker");
        let mut client = ProcessClient::<u8, u8>::start("missing", command);

        for seq in 0..2 {
            let (out, _) = client.handle(Envelope::new(seq, 0));
            let err = out.body.unwrap_err();
            assert_eq!(err.kind, ItemErrorKind::Transport);
            assert!(err.message.contains("failed to start"));
        }
    }

    #[test]
    fn test_upstream_failure_not_sent_to_child() {
        let (_file, command) = script(DOUBLER);
        let mut client = ProcessClient::<i64, i64>::start("double", command);

        let upstream = Envelope::failed(ItemError::panicked(4, "parse", "bad"));
        let (out, disposition) = client.handle(upstream);

        assert_eq!(disposition, Disposition::Forwarded);
        assert_eq!(out.body.unwrap_err().stage, "parse");
    }

    /// Serializes as its number, except that 1 panics.
    struct Touchy(u32);

    impl Serialize for Touchy {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            assert!(self.0 != 1, "refusing to encode {}", self.0);
            serializer.serialize_u32(self.0)
        }
    }

    #[test]
    fn test_panicking_serialize_fails_item_and_keeps_child() {
        let (_file, command) = script(DOUBLER);
        let mut client = ProcessClient::<Touchy, u32>::start("touchy", command);

        let (first, _) = client.handle(Envelope::new(0, Touchy(0)));
        let (second, disposition) = client.handle(Envelope::new(1, Touchy(1)));
        let (third, _) = client.handle(Envelope::new(2, Touchy(2)));

        assert_eq!(first.body, Ok(0));
        assert_eq!(disposition, Disposition::Failed);
        let err = second.body.unwrap_err();
        assert_eq!(err.kind, ItemErrorKind::Panicked);
        assert_eq!(err.message, "refusing to encode 1");
        assert_eq!(third.body, Ok(4));
        assert_eq!(client.restarts(), 0);
    }

    #[test]
    fn test_panicking_serialize_does_not_stall_pipeline() {
        let (_file, command) = script(DOUBLER);
        let pipeline = crate::pipeline::PipelineBuilder::<Touchy, Touchy>::new("touchy")
            .process_stage::<u32>(crate::pipeline::StageConfig::new("double").with_capacity(1), command)
            .order(crate::pipeline::OrderPolicy::Submission)
            .build()
            .unwrap();

        let report = pipeline.run((0..6).map(Touchy)).unwrap();

        assert_eq!(report.processed, 6);
        assert_eq!(report.outputs, vec![0, 4, 6, 8, 10]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].seq, 1);
        assert_eq!(report.errors[0].kind, ItemErrorKind::Panicked);
    }

    #[test]
    fn test_child_reported_panic_is_panicked_item() {
        let (_file, command) = script(
            r#"
while read -r n; do
  echo "{\"panic\": \"boom on $n\"}"
done
"#,
        );
        let mut client = ProcessClient::<u8, u8>::start("boom", command);

        let (out, disposition) = client.handle(Envelope::new(0, 9));

        assert_eq!(disposition, Disposition::Failed);
        let err = out.body.unwrap_err();
        assert_eq!(err.kind, ItemErrorKind::Panicked);
        assert_eq!(err.message, "boom on 9");
        assert_eq!(client.restarts(), 0);
    }
}
