//! Four-socket server over the request processor.
//!
//! One Unix listener per endpoint, all feeding the same synchronous
//! [`RequestProcessor`] behind a process-wide mutex. The mutex is the
//! concurrency model: requests across connections serialize, which is what
//! gives two pipelined requests on one user a consistent view of that
//! user's state.
//!
//! # Socket Permissions
//!
//! - `check.sock`, `set.sock`: mode 0666. Any local user may connect; the
//!   daemon acts on the *peer's* UID from `SO_PEERCRED`, so a caller can
//!   only ever touch their own state.
//! - `reset.sock`, `policy.sock`: mode 0600. The target user is taken from
//!   the request body, so connecting is restricted to the service account
//!   (administrative tooling runs as it).

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use authkeeper_core::{Endpoint, RequestProcessor, SystemTimeSource, TimeSource};

use crate::config::DaemonConfig;
use crate::credentials::PeerCredentials;
use crate::framing::FrameCodec;

/// The endpoints a server binds, in bind order.
const ENDPOINTS: [Endpoint; 4] = [
    Endpoint::Check,
    Endpoint::Set,
    Endpoint::Reset,
    Endpoint::Policy,
];

const fn endpoint_socket_mode(endpoint: Endpoint) -> u32 {
    match endpoint {
        // Peer-credential endpoints are open to all local users.
        Endpoint::Check | Endpoint::Set => 0o666,
        // Administrative endpoints are gated by the socket mode itself.
        Endpoint::Reset | Endpoint::Policy => 0o600,
    }
}

type SharedProcessor = Arc<Mutex<RequestProcessor>>;

/// Bound listeners plus the shared processor.
pub struct Server {
    listeners: Vec<(Endpoint, UnixListener)>,
    processor: SharedProcessor,
    max_frame_size: usize,
    runtime_dir: PathBuf,
}

impl Server {
    /// Binds all four endpoint sockets using the system clock.
    ///
    /// # Errors
    ///
    /// Fails if the runtime directory cannot be created or any socket
    /// cannot be bound.
    pub fn bind(config: &DaemonConfig) -> Result<Self> {
        Self::bind_with_time(config, Arc::new(SystemTimeSource::new()))
    }

    /// Binds all four endpoint sockets with an injected clock.
    ///
    /// # Errors
    ///
    /// Fails if the runtime directory cannot be created or any socket
    /// cannot be bound.
    pub fn bind_with_time(config: &DaemonConfig, time: Arc<dyn TimeSource>) -> Result<Self> {
        std::fs::create_dir_all(&config.runtime_dir).with_context(|| {
            format!(
                "failed to create runtime directory {}",
                config.runtime_dir.display()
            )
        })?;

        let processor = Arc::new(Mutex::new(RequestProcessor::new(&config.data_dir, time)));

        let mut listeners = Vec::with_capacity(ENDPOINTS.len());
        for endpoint in ENDPOINTS {
            let path = config.runtime_dir.join(endpoint.socket_name());
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
            }
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("failed to bind {}", path.display()))?;
            std::fs::set_permissions(
                &path,
                std::fs::Permissions::from_mode(endpoint_socket_mode(endpoint)),
            )
            .with_context(|| format!("failed to chmod {}", path.display()))?;
            info!(%endpoint, path = %path.display(), "listening");
            listeners.push((endpoint, listener));
        }

        Ok(Self {
            listeners,
            processor,
            max_frame_size: config.max_frame_size,
            runtime_dir: config.runtime_dir.clone(),
        })
    }

    /// Serves connections until `shutdown` observes a value change, then
    /// removes the socket files.
    ///
    /// # Errors
    ///
    /// Accept and per-connection errors are logged, not propagated; only
    /// task-join failures surface.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let Self {
            listeners,
            processor,
            max_frame_size,
            runtime_dir,
        } = self;

        let mut tasks = Vec::with_capacity(listeners.len());
        for (endpoint, listener) in listeners {
            let processor = Arc::clone(&processor);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(listen(
                endpoint,
                listener,
                processor,
                max_frame_size,
                shutdown,
            )));
        }
        for task in tasks {
            task.await.context("listener task panicked")?;
        }

        for endpoint in ENDPOINTS {
            let path = runtime_dir.join(endpoint.socket_name());
            if let Err(err) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), %err, "socket cleanup skipped");
            }
        }
        Ok(())
    }
}

async fn listen(
    endpoint: Endpoint,
    listener: UnixListener,
    processor: SharedProcessor,
    max_frame_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let processor = Arc::clone(&processor);
                    tokio::spawn(async move {
                        if let Err(err) =
                            handle_connection(endpoint, stream, processor, max_frame_size).await
                        {
                            debug!(%endpoint, "connection closed: {err:#}");
                        }
                    });
                }
                Err(err) => warn!(%endpoint, %err, "accept failed"),
            },
            _ = shutdown.changed() => {
                info!(%endpoint, "listener shutting down");
                return;
            }
        }
    }
}

/// Reads frames until the client hangs up or breaks the protocol.
///
/// Operation-level failures are replied as a status and the loop continues;
/// protocol errors propagate, dropping (closing) the connection.
async fn handle_connection(
    endpoint: Endpoint,
    stream: UnixStream,
    processor: SharedProcessor,
    max_frame_size: usize,
) -> Result<()> {
    // The peer UID is meaningful only on the credential-resolved endpoints.
    // Resolution failure is mapped to a per-request NoUser status rather
    // than a dropped connection.
    let caller = match endpoint {
        Endpoint::Check | Endpoint::Set => match PeerCredentials::from_stream(&stream) {
            Ok(creds) => Some(creds.uid),
            Err(err) => {
                warn!(%endpoint, %err, "peer credential resolution failed");
                None
            }
        },
        Endpoint::Reset | Endpoint::Policy => None,
    };

    let mut framed = Framed::new(stream, FrameCodec::with_max_size(max_frame_size));
    while let Some(frame) = framed.next().await {
        let frame = frame.context("frame decode failed")?;

        let replies = {
            let mut processor = processor
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            processor.process_frame(endpoint, caller, &frame)
        };

        match replies {
            Ok(replies) => {
                for reply in replies {
                    framed.send(reply).await.context("reply write failed")?;
                }
            }
            Err(err) => {
                warn!(%endpoint, %err, "protocol violation; closing connection");
                return Err(err.into());
            }
        }
    }
    debug!(%endpoint, "connection closed by peer");
    Ok(())
}
