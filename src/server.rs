//! # Control Server
//!
//! Serves the JSON-lines protocol of [`crate::protocol`] on a Unix socket.
//!
//! ```text
//!   accept ──► connection task ──► read line ──► dispatch ──► write line
//!      │              ▲                  └──────── loop until EOF ───────┘
//!      └─ MAX_CONNECTIONS
//! ```
//!
//! Every connection is served by its own task, so a request blocked on one
//! connection (a stop inside its grace period, a wait) never delays another
//! connection. Requests on a single connection are answered in order.
//!
//! ## Security
//!
//! - The socket is created with mode `0600`
//! - Concurrent connections are capped at [`MAX_CONNECTIONS`]
//! - Request lines longer than [`MAX_REQUEST_LINE_LEN`] close the connection
//! - An idle connection is closed after [`REQUEST_TIMEOUT`]

use crate::constants::{MAX_CONNECTIONS, MAX_REQUEST_LINE_LEN, REQUEST_TIMEOUT};
use crate::dispatcher::{Request, RequestDispatcher};
use crate::error::Result;
use crate::protocol::{ErrorCode, Response};
use std::future::Future;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Unix socket server in front of a [`RequestDispatcher`].
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    dispatcher: Arc<RequestDispatcher>,
}

impl ControlServer {
    /// Binds the socket, replacing a stale socket file.
    ///
    /// Anything else at `path` is left alone and fails the bind.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn bind(path: &Path, dispatcher: Arc<RequestDispatcher>) -> Result<Self> {
        match std::fs::symlink_metadata(path) {
            Ok(metadata) if metadata.file_type().is_socket() => {
                debug!(path = %path.display(), "removing stale socket");
                std::fs::remove_file(path)?;
            }
            Ok(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a socket", path.display()),
                )
                .into());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        info!(path = %path.display(), "control server listening");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            dispatcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until `shutdown` resolves, then removes the socket.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let connection_count = Arc::new(AtomicUsize::new(0));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("control server stopping");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let current = connection_count.load(Ordering::Relaxed);
                            if current >= MAX_CONNECTIONS {
                                warn!(max = MAX_CONNECTIONS, "connection rejected: limit reached");
                                continue;
                            }

                            let dispatcher = Arc::clone(&self.dispatcher);
                            let counter = Arc::clone(&connection_count);
                            counter.fetch_add(1, Ordering::Relaxed);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, dispatcher).await {
                                    debug!(error = %e, "control connection error");
                                }
                                counter.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove socket");
        }
        Ok(())
    }
}

/// Serves requests on one connection until EOF.
async fn handle_connection(stream: UnixStream, dispatcher: Arc<RequestDispatcher>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let limit = MAX_REQUEST_LINE_LEN as u64 + 1;
        let read_result =
            tokio::time::timeout(REQUEST_TIMEOUT, (&mut reader).take(limit).read_line(&mut line))
                .await;

        let (response, keep_open) = match read_result {
            // EOF - client disconnected
            Ok(Ok(0)) => return Ok(()),
            Ok(Ok(n)) if n > MAX_REQUEST_LINE_LEN => (
                Response::error(ErrorCode::InvalidRequest, "request too large"),
                false,
            ),
            Ok(Ok(_)) if line.trim().is_empty() => continue,
            Ok(Ok(_)) => match Request::from_json(&line) {
                Ok(request) => {
                    let action = request.action();
                    let response = Response::from_result(dispatcher.dispatch(request).await);
                    if let Some(code) = response.error_code() {
                        debug!(action, ?code, "request failed");
                    }
                    (response, true)
                }
                Err(e) => (
                    Response::error(ErrorCode::InvalidRequest, format!("JSON parse error: {e}")),
                    true,
                ),
            },
            Ok(Err(e)) => (
                Response::error(ErrorCode::InvalidRequest, format!("read error: {e}")),
                false,
            ),
            Err(_) => (
                Response::error(ErrorCode::Timeout, "request timed out"),
                false,
            ),
        };

        let response_line = response.to_json_line()?;
        writer.write_all(response_line.as_bytes()).await?;
        writer.flush().await?;

        if !keep_open {
            return Ok(());
        }
    }
}
