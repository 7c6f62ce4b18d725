//! Blocking UDS client for the four daemon endpoints.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use authkeeper_core::record::{RecordError, RecordReader, RecordWriter};
use authkeeper_core::{Endpoint, PasswordKind, PolicyUpdate, RequestHeader, StatusCode};

/// Largest reply this client accepts. Replies are a status plus at most
/// three counters.
const MAX_REPLY_SIZE: usize = 4096;

/// Failures talking to the daemon.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The endpoint socket does not exist or refused the connection.
    #[error("daemon is not running (socket unavailable)")]
    DaemonNotRunning,

    /// Transport failure mid-request.
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    /// The daemon closed the connection without a full reply.
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,

    /// The reply frame declared an unreasonable size.
    #[error("reply of {size} bytes exceeds maximum of {max}")]
    ReplyTooLarge {
        /// Declared size.
        size: usize,
        /// Permitted maximum.
        max: usize,
    },

    /// The reply body could not be decoded.
    #[error("malformed reply: {0}")]
    Malformed(#[from] RecordError),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                Self::DaemonNotRunning
            }
            _ => Self::Io(err),
        }
    }
}

/// Status plus the counters a check-endpoint reply may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    pub status: StatusCode,
    /// `(attempt, max_attempt, seconds_left)`, present on the statuses
    /// that carry counters.
    pub counters: Option<(u32, u32, u32)>,
}

/// Stateless client addressing the daemon's runtime directory.
pub struct Client {
    runtime_dir: PathBuf,
}

impl Client {
    /// Client for the sockets under `runtime_dir`.
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Verifies `challenge` against the stored password.
    pub fn check_password(
        &self,
        kind: PasswordKind,
        challenge: &str,
    ) -> Result<CheckReport, ClientError> {
        let mut w = RecordWriter::new();
        w.put_i32(RequestHeader::CheckPassword.code());
        w.put_u32(kind.code());
        w.put_str(challenge);
        let reply = self.request(Endpoint::Check, &w.into_bytes())?;
        parse_check_reply(&reply)
    }

    /// Reads the password state without counting an attempt.
    pub fn check_state(&self, kind: PasswordKind) -> Result<CheckReport, ClientError> {
        let mut w = RecordWriter::new();
        w.put_i32(RequestHeader::CheckPasswordState.code());
        w.put_u32(kind.code());
        let reply = self.request(Endpoint::Check, &w.into_bytes())?;
        parse_check_reply(&reply)
    }

    /// Asks whether `candidate` is in the reuse history. The flag is
    /// present only on success.
    pub fn check_reused(
        &self,
        kind: PasswordKind,
        candidate: &str,
    ) -> Result<(StatusCode, Option<bool>), ClientError> {
        let mut w = RecordWriter::new();
        w.put_i32(RequestHeader::CheckPasswordReused.code());
        w.put_u32(kind.code());
        w.put_str(candidate);
        let reply = self.request(Endpoint::Set, &w.into_bytes())?;

        let mut r = RecordReader::new(&reply);
        let status = StatusCode::from_code(r.get_i32()?);
        let reused = if status.is_success() {
            Some(r.get_u32()? != 0)
        } else {
            None
        };
        Ok((status, reused))
    }

    /// Rotates a credential, proving knowledge of the current one.
    pub fn set_password(
        &self,
        kind: PasswordKind,
        current: &str,
        new: &str,
    ) -> Result<StatusCode, ClientError> {
        let mut w = RecordWriter::new();
        w.put_i32(RequestHeader::SetPassword.code());
        w.put_u32(kind.code());
        w.put_str(current);
        w.put_str(new);
        let reply = self.request(Endpoint::Set, &w.into_bytes())?;
        parse_status(&reply)
    }

    /// Rewrites the Normal password via the recovery credential.
    pub fn set_password_recovery(
        &self,
        current_recovery: &str,
        new: &str,
    ) -> Result<StatusCode, ClientError> {
        let mut w = RecordWriter::new();
        w.put_i32(RequestHeader::SetPasswordRecovery.code());
        w.put_str(current_recovery);
        w.put_str(new);
        let reply = self.request(Endpoint::Set, &w.into_bytes())?;
        parse_status(&reply)
    }

    /// Administrative reset of `uid`'s credential.
    pub fn reset_password(
        &self,
        kind: PasswordKind,
        new: &str,
        uid: u32,
    ) -> Result<StatusCode, ClientError> {
        let mut w = RecordWriter::new();
        w.put_i32(RequestHeader::ResetPassword.code());
        w.put_u32(kind.code());
        w.put_str(new);
        w.put_u32(uid);
        let reply = self.request(Endpoint::Reset, &w.into_bytes())?;
        parse_status(&reply)
    }

    /// Installs or updates a policy.
    pub fn set_policy(&self, update: &PolicyUpdate) -> Result<StatusCode, ClientError> {
        let mut w = RecordWriter::new();
        w.put_i32(RequestHeader::SetPasswordPolicy.code());
        update.encode(&mut w);
        let reply = self.request(Endpoint::Policy, &w.into_bytes())?;
        parse_status(&reply)
    }

    /// Disables and clears `uid`'s policy.
    pub fn disable_policy(&self, uid: u32) -> Result<StatusCode, ClientError> {
        let mut w = RecordWriter::new();
        w.put_i32(RequestHeader::DisablePasswordPolicy.code());
        w.put_u32(uid);
        let reply = self.request(Endpoint::Policy, &w.into_bytes())?;
        parse_status(&reply)
    }

    /// Connect, send one frame, read one reply frame.
    fn request(&self, endpoint: Endpoint, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let path = self.runtime_dir.join(endpoint.socket_name());
        let mut stream = connect(&path)?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        stream.write_all(&frame)?;
        stream.flush()?;

        let mut header = [0u8; 4];
        read_exact(&mut stream, &mut header)?;
        let length = u32::from_le_bytes(header) as usize;
        if length > MAX_REPLY_SIZE {
            return Err(ClientError::ReplyTooLarge {
                size: length,
                max: MAX_REPLY_SIZE,
            });
        }

        let mut reply = vec![0u8; length];
        read_exact(&mut stream, &mut reply)?;
        Ok(reply)
    }
}

fn connect(path: &Path) -> Result<UnixStream, ClientError> {
    UnixStream::connect(path).map_err(ClientError::from)
}

fn read_exact(stream: &mut UnixStream, buf: &mut [u8]) -> Result<(), ClientError> {
    stream.read_exact(buf).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ClientError::ConnectionClosed
        } else {
            ClientError::Io(err)
        }
    })
}

fn parse_status(reply: &[u8]) -> Result<StatusCode, ClientError> {
    let mut r = RecordReader::new(reply);
    Ok(StatusCode::from_code(r.get_i32()?))
}

fn parse_check_reply(reply: &[u8]) -> Result<CheckReport, ClientError> {
    let mut r = RecordReader::new(reply);
    let status = StatusCode::from_code(r.get_i32()?);
    let counters = match status {
        StatusCode::Success
        | StatusCode::Mismatch
        | StatusCode::MaxAttemptsExceeded
        | StatusCode::Expired => Some((r.get_u32()?, r.get_u32()?, r.get_u32()?)),
        _ => None,
    };
    Ok(CheckReport { status, counters })
}
