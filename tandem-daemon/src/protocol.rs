use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

pub const CMD_STATUS: &str = "status";
pub const CMD_SYNC: &str = "sync";
pub const CMD_PULL: &str = "pull";
pub const CMD_STOP: &str = "stop";

/// How long `status` keeps retrying while the socket is not there yet.
const STATUS_GRACE: Duration = Duration::from_millis(500);
const STATUS_POLL: Duration = Duration::from_millis(100);
/// Upper bound on waiting for a reply line.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
}

impl DaemonRequest {
    pub fn new(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Blocking client for the control socket. One connection per command.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket: PathBuf,
    read_timeout: Duration,
}

impl ControlClient {
    pub fn new(home: &Path) -> Self {
        Self {
            socket: socket_path(home),
            read_timeout: REPLY_TIMEOUT,
        }
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Send `request` and read the single reply line.
    pub fn exchange(&self, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
        let stream = UnixStream::connect(&self.socket).map_err(|err| self.connect_error(err))?;
        stream
            .set_read_timeout(Some(self.read_timeout))
            .map_err(|e| io_err(&self.socket, e))?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        (&stream)
            .write_all(line.as_bytes())
            .map_err(|e| io_err(&self.socket, e))?;

        let mut reply = String::new();
        match BufReader::new(&stream).read_line(&mut reply) {
            Ok(0) => Err(DaemonError::Protocol(format!(
                "daemon closed the connection without answering '{}'",
                request.cmd
            ))),
            Ok(_) => Ok(serde_json::from_str(reply.trim_end())?),
            Err(err) => Err(io_err(&self.socket, err)),
        }
    }

    /// Run `cmd` and unwrap its payload.
    pub fn call(&self, cmd: &str) -> Result<Value, DaemonError> {
        self.exchange(&DaemonRequest::new(cmd))?.into_result()
    }

    /// `status`, tolerating a daemon that has not bound its socket yet.
    pub fn status(&self) -> Result<Value, DaemonError> {
        let deadline = Instant::now() + STATUS_GRACE;
        loop {
            match self.call(CMD_STATUS) {
                Err(DaemonError::DaemonNotRunning { .. }) if Instant::now() < deadline => {
                    sleep(STATUS_POLL);
                }
                result => return result,
            }
        }
    }

    fn connect_error(&self, err: std::io::Error) -> DaemonError {
        match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                DaemonError::DaemonNotRunning {
                    socket: self.socket.clone(),
                }
            }
            _ => io_err(&self.socket, err),
        }
    }
}

impl DaemonResponse {
    fn into_result(self) -> Result<Value, DaemonError> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.data.unwrap_or(Value::Null)),
            (false, error) => Err(DaemonError::Protocol(
                error.unwrap_or_else(|| "daemon refused the command".to_string()),
            )),
        }
    }
}

pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    ControlClient::new(home).exchange(request)
}

pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    ControlClient::new(home).status()
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    ControlClient::new(home).call(CMD_STOP).map(|_| ())
}

pub fn request_sync(home: &Path) -> Result<Value, DaemonError> {
    ControlClient::new(home).call(CMD_SYNC)
}

pub fn request_pull(home: &Path) -> Result<Value, DaemonError> {
    ControlClient::new(home).call(CMD_PULL)
}
