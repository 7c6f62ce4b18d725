//! Peer identity from `SO_PEERCRED`.
//!
//! The check and set endpoints act on the *connecting* user's state, so the
//! caller's UID is read from the kernel rather than from the request body.
//! A request body can lie; the socket credential cannot.

use std::io;

use tokio::net::UnixStream;

/// Credentials of the process on the other end of a Unix socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// User ID of the peer process.
    pub uid: u32,
    /// Group ID of the peer process.
    pub gid: u32,
    /// Process ID of the peer, when the platform reports one.
    pub pid: Option<i32>,
}

impl PeerCredentials {
    /// Reads the peer credentials of `stream`.
    ///
    /// # Errors
    ///
    /// Returns the underlying `getsockopt` error; callers treat a failure
    /// as "no resolvable user", not as a fatal condition.
    pub fn from_stream(stream: &UnixStream) -> io::Result<Self> {
        let cred = stream.peer_cred()?;
        Ok(Self {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream as StdUnixStream;

    #[tokio::test]
    async fn socketpair_reports_own_credentials() {
        use std::os::unix::fs::MetadataExt;

        let (left, _right) = StdUnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        let left = UnixStream::from_std(left).unwrap();

        let creds = PeerCredentials::from_stream(&left).unwrap();
        // Both ends of a pair belong to this process.
        let own_uid = std::fs::metadata("/proc/self")
            .expect("procfs available on test hosts")
            .uid();
        assert_eq!(creds.uid, own_uid);
    }
}
