//! Control-channel client
//!
//! Owns the single stream connection to the emulator's control endpoint (a
//! QMP-style Unix socket). Commands are JSON objects of the shape
//!
//! ```text
//! {"execute": "screendump", "arguments": {"filename": "captures/0"}}
//! ```
//!
//! written without framing. Replies arrive as a stream of JSON values: an
//! optional greeting, asynchronous events, and exactly one `return` or `error`
//! per command.
//!
//! At most one command is ever in flight: [`ControlChannel::execute`] writes a
//! command and consumes its acknowledgement before returning.

use serde::Serialize;
use serde_json::{Map, Value};
use std::io::{self, BufReader, ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::error::RecorderError;

/// Capability negotiation, sent once right after connecting.
pub const CMD_CAPABILITIES: &str = "qmp_capabilities";
/// Dump the current frame buffer to a file.
pub const CMD_SCREENDUMP: &str = "screendump";

type ReplyStream =
    serde_json::StreamDeserializer<'static, serde_json::de::IoRead<BufReader<UnixStream>>, Value>;

/// A structured request: command name plus named arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    execute: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    arguments: Map<String, Value>,
}

impl Command {
    /// Command with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            execute: name.into(),
            arguments: Map::new(),
        }
    }

    /// Add a named argument.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn capabilities() -> Self {
        Self::new(CMD_CAPABILITIES)
    }

    /// Frame dump into `path`. The emulator resolves relative paths against its
    /// own working directory, so callers should pass absolute paths.
    pub fn screendump(path: &Path) -> Result<Self, RecorderError> {
        let filename = path.to_str().ok_or_else(|| {
            RecorderError::Config(format!("capture path is not UTF-8: {}", path.display()))
        })?;
        Ok(Self::new(CMD_SCREENDUMP).arg("filename", filename))
    }

    pub fn name(&self) -> &str {
        &self.execute
    }

    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }

    /// Serialize to the wire format (no trailing newline).
    pub fn to_bytes(&self) -> Result<Vec<u8>, RecorderError> {
        serde_json::to_vec(self)
            .map_err(|e| RecorderError::ProtocolViolation(format!("unencodable command: {}", e)))
    }
}

/// One message read from the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Connection banner sent before any command.
    Greeting(Value),
    /// Asynchronous notification unrelated to the pending command.
    Event(String),
    /// Successful acknowledgement of the pending command.
    Return(Value),
    /// Failed acknowledgement of the pending command.
    Error { class: String, desc: String },
}

impl Reply {
    /// Classify a decoded JSON message.
    pub fn classify(value: Value) -> Result<Self, RecorderError> {
        let Value::Object(mut obj) = value else {
            return Err(RecorderError::ProtocolViolation(format!(
                "expected a JSON object, got {}",
                value
            )));
        };

        if let Some(ret) = obj.remove("return") {
            return Ok(Self::Return(ret));
        }
        if let Some(err) = obj.remove("error") {
            let field = |name: &str| {
                err.get(name)
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string()
            };
            return Ok(Self::Error {
                class: field("class"),
                desc: field("desc"),
            });
        }
        if let Some(event) = obj.remove("event") {
            let name = event.as_str().unwrap_or("unknown").to_string();
            return Ok(Self::Event(name));
        }
        if let Some(banner) = obj.remove("QMP") {
            return Ok(Self::Greeting(banner));
        }

        Err(RecorderError::ProtocolViolation(format!(
            "unrecognized message: {}",
            Value::Object(obj)
        )))
    }
}

/// Persistent connection to the emulator's control endpoint.
pub struct ControlChannel {
    writer: UnixStream,
    replies: ReplyStream,
    commands_sent: u64,
    closed: bool,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("commands_sent", &self.commands_sent)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ControlChannel {
    /// Connect to the control socket at `path` and negotiate capabilities.
    ///
    /// `ack_timeout` bounds every subsequent wait for an acknowledgement.
    ///
    /// # Errors
    ///
    /// [`RecorderError::Connection`] if the socket does not exist, refuses the
    /// connection, or does not acknowledge capability negotiation.
    pub fn connect(path: &Path, ack_timeout: Duration) -> Result<Self, RecorderError> {
        let stream = UnixStream::connect(path).map_err(|e| {
            RecorderError::Connection(format!("{}: {}", path.display(), e))
        })?;
        stream
            .set_read_timeout(Some(ack_timeout))
            .map_err(|e| RecorderError::Connection(format!("failed to set read timeout: {}", e)))?;
        let reader = stream
            .try_clone()
            .map_err(|e| RecorderError::Connection(format!("failed to clone stream: {}", e)))?;

        let mut channel = Self {
            writer: stream,
            replies: serde_json::Deserializer::from_reader(BufReader::new(reader))
                .into_iter::<Value>(),
            commands_sent: 0,
            closed: false,
        };

        channel
            .execute(&Command::capabilities())
            .map_err(|e| RecorderError::Connection(format!("capability negotiation failed: {}", e)))?;

        tracing::info!("Connected to emulator control channel at {}", path.display());
        Ok(channel)
    }

    /// Write one command. Does not wait for the reply.
    pub fn send_command(&mut self, command: &Command) -> Result<(), RecorderError> {
        if self.closed {
            return Err(RecorderError::Transport("control channel is closed".into()));
        }

        let bytes = command.to_bytes()?;
        self.writer
            .write_all(&bytes)
            .and_then(|()| self.writer.flush())
            .map_err(|e| {
                RecorderError::Transport(format!("failed to send `{}`: {}", command.name(), e))
            })?;
        self.commands_sent += 1;
        Ok(())
    }

    /// Read the acknowledgement for the command in flight.
    ///
    /// Greetings and asynchronous events are skipped.
    pub fn read_ack(&mut self) -> Result<Value, RecorderError> {
        loop {
            let value = match self.replies.next() {
                Some(Ok(value)) => value,
                Some(Err(e)) => return Err(classify_read_error(e)),
                None => {
                    return Err(RecorderError::Transport(
                        "connection closed by emulator".into(),
                    ));
                }
            };

            match Reply::classify(value)? {
                Reply::Return(ret) => return Ok(ret),
                Reply::Error { class, desc } => {
                    return Err(RecorderError::ProtocolViolation(format!(
                        "command rejected ({}): {}",
                        class, desc
                    )));
                }
                Reply::Event(name) => tracing::debug!("Ignoring emulator event {}", name),
                Reply::Greeting(_) => tracing::debug!("Received control channel greeting"),
            }
        }
    }

    /// Send a command and wait for its acknowledgement.
    pub fn execute(&mut self, command: &Command) -> Result<Value, RecorderError> {
        self.send_command(command)?;
        self.read_ack()
    }

    /// Number of commands written so far, including capability negotiation.
    pub fn commands_sent(&self) -> u64 {
        self.commands_sent
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Shut the connection down. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.writer.shutdown(Shutdown::Both) {
            // Already torn down by the peer.
            if e.kind() != ErrorKind::NotConnected {
                tracing::warn!("Failed to shut down control channel: {}", e);
            }
        }
        tracing::debug!("Control channel closed after {} commands", self.commands_sent);
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn classify_read_error(err: serde_json::Error) -> RecorderError {
    match err.io_error_kind() {
        Some(io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            RecorderError::ProtocolViolation("timed out waiting for acknowledgement".into())
        }
        Some(kind) => RecorderError::Transport(format!("read failed ({:?}): {}", kind, err)),
        None if err.is_eof() => RecorderError::Transport("connection closed by emulator".into()),
        None => RecorderError::ProtocolViolation(format!("malformed reply: {}", err)),
    }
}
