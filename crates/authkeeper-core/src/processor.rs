//! Four-endpoint request dispatcher.
//!
//! The processor deserializes `(header, body)` pairs from a request frame,
//! dispatches into the password and policy stores, and serializes one reply
//! per request. It is the only component that composes the two stores: a
//! password rotation runs the policy check first, and a successful policy
//! update forwards its attempts/validity/history portions to the password
//! store.
//!
//! # Endpoints
//!
//! | Endpoint | Headers | Caller user |
//! |----------|---------|-------------|
//! | Check    | `CheckPassword`, `CheckPasswordState` | transport peer credentials |
//! | Set      | `SetPassword`, `SetPasswordRecovery`, `CheckPasswordReused` | transport peer credentials |
//! | Reset    | `ResetPassword` | request body |
//! | Policy   | `SetPasswordPolicy`, `DisablePasswordPolicy` | request body |
//!
//! # Error Model
//!
//! Malformed frames (truncated body, unknown header, header on the wrong
//! endpoint) are protocol errors: the caller closes the connection.
//! Operation failures are encoded as a status reply and keep the connection
//! open. Store persistence failures surface as
//! [`StatusCode::ServerError`].

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::password::{CheckReply, PasswordError, PasswordStore};
use crate::policy::{PolicyError, PolicyStore};
use crate::protocol::{Endpoint, PasswordKind, PolicyUpdate, RequestHeader, policy_flag};
use crate::record::{RecordError, RecordReader, RecordWriter};
use crate::status::StatusCode;
use crate::time::TimeSource;

/// Frame-level failures. Any of these closes the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame body could not be decoded.
    #[error("malformed request body: {0}")]
    Record(#[from] RecordError),

    /// The header code is not defined.
    #[error("unknown request header {0}")]
    UnknownHeader(i32),

    /// The header is defined but not legal on this endpoint.
    #[error("header {header:?} is not accepted on the {endpoint} endpoint")]
    HeaderNotAllowed {
        /// Decoded header.
        header: RequestHeader,
        /// Endpoint the request arrived on.
        endpoint: Endpoint,
    },
}

/// Payload trailing the status code in a reply.
enum ReplyPayload {
    /// Status only.
    None,
    /// Attempt counters (Check endpoint, credential verdicts).
    Counters {
        attempt: u32,
        max_attempt: u32,
        seconds_left: u32,
    },
    /// Reuse flag (`CheckPasswordReused` on success).
    Reused(bool),
}

/// Dispatcher over the two stores.
pub struct RequestProcessor {
    passwords: PasswordStore,
    policies: PolicyStore,
}

impl RequestProcessor {
    /// Creates a processor with both stores rooted at `data_dir`.
    pub fn new(data_dir: &Path, time: Arc<dyn TimeSource>) -> Self {
        Self {
            passwords: PasswordStore::new(data_dir, Arc::clone(&time)),
            policies: PolicyStore::new(data_dir, time),
        }
    }

    /// Processes every `(header, body)` pair in `payload`, returning one
    /// reply frame per request in order.
    ///
    /// `caller` is the transport-resolved peer user; `None` yields
    /// [`StatusCode::NoUser`] for Check/Set requests without touching the
    /// stores.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] on a malformed frame. Replies already
    /// produced for earlier pipelined requests are discarded with it; the
    /// transport closes the connection either way.
    pub fn process_frame(
        &mut self,
        endpoint: Endpoint,
        caller: Option<u32>,
        payload: &[u8],
    ) -> Result<Vec<Bytes>, ProtocolError> {
        let mut reader = RecordReader::new(payload);
        let mut replies = Vec::new();
        while !reader.is_empty() {
            replies.push(self.process_one(endpoint, caller, &mut reader)?);
        }
        Ok(replies)
    }

    fn process_one(
        &mut self,
        endpoint: Endpoint,
        caller: Option<u32>,
        reader: &mut RecordReader<'_>,
    ) -> Result<Bytes, ProtocolError> {
        let raw_header = reader.get_i32()?;
        let header =
            RequestHeader::try_from(raw_header).map_err(ProtocolError::UnknownHeader)?;

        match (endpoint, header) {
            (Endpoint::Check, RequestHeader::CheckPassword) => {
                let kind = reader.get_u32()?;
                let challenge = reader.get_str()?;
                Ok(self.check_password(caller, kind, &challenge))
            }
            (Endpoint::Check, RequestHeader::CheckPasswordState) => {
                let kind = reader.get_u32()?;
                Ok(self.check_password_state(caller, kind))
            }
            (Endpoint::Set, RequestHeader::SetPassword) => {
                let kind = reader.get_u32()?;
                let current = reader.get_str()?;
                let new = reader.get_str()?;
                Ok(self.set_password(caller, kind, &current, &new))
            }
            (Endpoint::Set, RequestHeader::SetPasswordRecovery) => {
                let current = reader.get_str()?;
                let new = reader.get_str()?;
                Ok(self.set_password_recovery(caller, &current, &new))
            }
            (Endpoint::Set, RequestHeader::CheckPasswordReused) => {
                let kind = reader.get_u32()?;
                let candidate = reader.get_str()?;
                Ok(self.check_password_reused(caller, kind, &candidate))
            }
            (Endpoint::Reset, RequestHeader::ResetPassword) => {
                let kind = reader.get_u32()?;
                let new = reader.get_str()?;
                let uid = reader.get_u32()?;
                Ok(self.reset_password(kind, &new, uid))
            }
            (Endpoint::Policy, RequestHeader::SetPasswordPolicy) => {
                let update = PolicyUpdate::decode(reader)?;
                Ok(self.set_policy(&update))
            }
            (Endpoint::Policy, RequestHeader::DisablePasswordPolicy) => {
                let uid = reader.get_u32()?;
                Ok(self.disable_policy(uid))
            }
            _ => Err(ProtocolError::HeaderNotAllowed { header, endpoint }),
        }
    }

    // ------------------------------------------------------------------
    // Check endpoint
    // ------------------------------------------------------------------

    fn check_password(&mut self, caller: Option<u32>, kind: u32, challenge: &str) -> Bytes {
        let Some(uid) = caller else {
            return encode_reply(StatusCode::NoUser, ReplyPayload::None);
        };
        let Ok(kind) = PasswordKind::try_from(kind) else {
            return encode_reply(StatusCode::InputParam, ReplyPayload::None);
        };
        match self.passwords.check(kind, challenge, uid) {
            Ok(reply) => encode_reply(reply.outcome.status(), counters(&reply)),
            Err(err) => password_failure(uid, "check", &err),
        }
    }

    fn check_password_state(&mut self, caller: Option<u32>, kind: u32) -> Bytes {
        let Some(uid) = caller else {
            return encode_reply(StatusCode::NoUser, ReplyPayload::None);
        };
        let Ok(kind) = PasswordKind::try_from(kind) else {
            return encode_reply(StatusCode::InputParam, ReplyPayload::None);
        };
        match self.passwords.status(kind, uid) {
            Ok(status) => encode_reply(
                StatusCode::Success,
                ReplyPayload::Counters {
                    attempt: status.attempt,
                    max_attempt: status.max_attempt,
                    seconds_left: status.seconds_left,
                },
            ),
            Err(err) => password_failure(uid, "state", &err),
        }
    }

    // ------------------------------------------------------------------
    // Set endpoint
    // ------------------------------------------------------------------

    fn set_password(&mut self, caller: Option<u32>, kind: u32, current: &str, new: &str) -> Bytes {
        let Some(uid) = caller else {
            return encode_reply(StatusCode::NoUser, ReplyPayload::None);
        };
        let Ok(kind) = PasswordKind::try_from(kind) else {
            return encode_reply(StatusCode::InputParam, ReplyPayload::None);
        };
        if let Err(err) = self.policies.check(kind, current, new, uid) {
            return policy_failure(uid, &err);
        }
        match self.passwords.set(kind, current, new, uid) {
            Ok(()) => encode_reply(StatusCode::Success, ReplyPayload::None),
            Err(err) => password_failure(uid, "set", &err),
        }
    }

    fn set_password_recovery(&mut self, caller: Option<u32>, current: &str, new: &str) -> Bytes {
        let Some(uid) = caller else {
            return encode_reply(StatusCode::NoUser, ReplyPayload::None);
        };
        // The new password becomes the Normal credential, so it is policed
        // as one.
        if let Err(err) = self.policies.check(PasswordKind::Normal, current, new, uid) {
            return policy_failure(uid, &err);
        }
        match self.passwords.set_recovery(current, new, uid) {
            Ok(()) => encode_reply(StatusCode::Success, ReplyPayload::None),
            Err(err) => password_failure(uid, "set_recovery", &err),
        }
    }

    fn check_password_reused(&mut self, caller: Option<u32>, kind: u32, candidate: &str) -> Bytes {
        let Some(uid) = caller else {
            return encode_reply(StatusCode::NoUser, ReplyPayload::None);
        };
        let Ok(kind) = PasswordKind::try_from(kind) else {
            return encode_reply(StatusCode::InputParam, ReplyPayload::None);
        };
        match self.passwords.is_reused(kind, candidate, uid) {
            Ok(reused) => encode_reply(StatusCode::Success, ReplyPayload::Reused(reused)),
            Err(err) => password_failure(uid, "reused", &err),
        }
    }

    // ------------------------------------------------------------------
    // Reset endpoint
    // ------------------------------------------------------------------

    fn reset_password(&mut self, kind: u32, new: &str, uid: u32) -> Bytes {
        let Ok(kind) = PasswordKind::try_from(kind) else {
            return encode_reply(StatusCode::InputParam, ReplyPayload::None);
        };
        match self.passwords.reset(kind, new, uid) {
            Ok(()) => encode_reply(StatusCode::Success, ReplyPayload::None),
            Err(err) => password_failure(uid, "reset", &err),
        }
    }

    // ------------------------------------------------------------------
    // Policy endpoint
    // ------------------------------------------------------------------

    fn set_policy(&mut self, update: &PolicyUpdate) -> Bytes {
        if let Err(err) = self.policies.set(update) {
            return policy_failure(update.uid, &err);
        }

        // Attempts, validity, and history live in the password file; apply
        // the supplied ones now that the policy update is persisted.
        let forwarded = [
            (policy_flag::MAX_ATTEMPTS, update.max_attempts),
            (policy_flag::VALID_PERIOD, update.valid_days),
            (policy_flag::HISTORY_SIZE, update.history_size),
        ];
        for (flag, value) in forwarded {
            if !update.has(flag) {
                continue;
            }
            let applied = match flag {
                policy_flag::MAX_ATTEMPTS => self.passwords.set_max_attempts(update.uid, value),
                policy_flag::VALID_PERIOD => self.passwords.set_validity(update.uid, value),
                _ => self.passwords.set_history(update.uid, value),
            };
            if let Err(err) = applied {
                return password_failure(update.uid, "policy side effect", &err);
            }
        }
        encode_reply(StatusCode::Success, ReplyPayload::None)
    }

    fn disable_policy(&mut self, uid: u32) -> Bytes {
        match self.policies.disable(uid) {
            Ok(()) => encode_reply(StatusCode::Success, ReplyPayload::None),
            Err(err) => policy_failure(uid, &err),
        }
    }
}

fn counters(reply: &CheckReply) -> ReplyPayload {
    ReplyPayload::Counters {
        attempt: reply.attempt,
        max_attempt: reply.max_attempt,
        seconds_left: reply.seconds_left,
    }
}

fn password_failure(uid: u32, operation: &str, err: &PasswordError) -> Bytes {
    if matches!(err, PasswordError::Storage(_)) {
        warn!(uid, operation, %err, "password store failure");
    }
    encode_reply(err.status(), ReplyPayload::None)
}

fn policy_failure(uid: u32, err: &PolicyError) -> Bytes {
    if matches!(err, PolicyError::Storage(_)) {
        warn!(uid, %err, "policy store failure");
    }
    encode_reply(err.status(), ReplyPayload::None)
}

fn encode_reply(status: StatusCode, payload: ReplyPayload) -> Bytes {
    let mut w = RecordWriter::with_capacity(16);
    w.put_i32(status.code());
    match payload {
        ReplyPayload::None => {}
        ReplyPayload::Counters {
            attempt,
            max_attempt,
            seconds_left,
        } => {
            w.put_u32(attempt);
            w.put_u32(max_attempt);
            w.put_u32(seconds_left);
        }
        ReplyPayload::Reused(reused) => w.put_u32(u32::from(reused)),
    }
    w.into_bytes()
}
