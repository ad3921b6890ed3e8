//! Unix socket front end for the dispatcher

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::watch;

use super::dispatcher::{handle_client, Dispatcher};
use super::ControlError;

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    /// Bind `path`, replacing a stale socket file. Must run inside a tokio runtime.
    pub fn bind(path: impl Into<PathBuf>, dispatcher: Dispatcher) -> Result<Self, ControlError> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&path)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tracing::info!(socket = %path.display(), "Control server listening");

        Ok(Self {
            listener,
            path,
            dispatcher: Arc::new(dispatcher),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send `true` to stop the accept loop
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Accept connections until shutdown or SIGINT/SIGTERM, then stop the session
    pub async fn run(mut self) -> Result<(), ControlError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let result = loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        tracing::info!("Shutdown requested");
                        break Ok(());
                    }
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down");
                    break Ok(());
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, shutting down");
                    break Ok(());
                }
                accept = self.listener.accept() => {
                    let (stream, _) = match accept {
                        Ok(connection) => connection,
                        Err(err) => break Err(ControlError::Io(err)),
                    };
                    let dispatcher = Arc::clone(&self.dispatcher);
                    tokio::spawn(async move {
                        if let Err(err) = handle_client(stream, &dispatcher).await {
                            tracing::warn!("Control connection error: {}", err);
                        }
                    });
                }
            }
        };

        self.dispatcher.shutdown().await;
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::debug!(socket = %self.path.display(), "Failed to remove socket: {}", err);
        }
        result
    }
}
