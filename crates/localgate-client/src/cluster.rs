//! Public facade for opening tunnels.

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::event::TunnelEvent;
use crate::local::LocalEndpoint;
use crate::session::TunnelSession;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Size of the event channel between the session task and the caller.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Entry point: owns a validated configuration and starts tunnel sessions.
pub struct TunnelCluster {
    config: TunnelConfig,
}

impl TunnelCluster {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Start the tunnel session.
    ///
    /// Fails fast only on synchronous configuration problems, most notably
    /// credential bytes that do not parse when a verified local TLS
    /// connection is required. Everything network-side is reported through
    /// the returned handle's event stream: `Open` once the broker accepts
    /// the control connection, `Request` per observed inbound request,
    /// `Error` if the broker refuses outright, and a final `Dead`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(self) -> Result<TunnelHandle, TunnelError> {
        let endpoint = LocalEndpoint::new(&self.config)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let session = TunnelSession::new(self.config, endpoint, event_tx, shutdown_rx);
        let task = tokio::spawn(session.run());

        Ok(TunnelHandle {
            events: event_rx,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to a running tunnel session.
///
/// Dropping the handle closes the session: the session task observes the
/// closed channels and winds down on its own.
pub struct TunnelHandle {
    events: mpsc::Receiver<TunnelEvent>,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    /// Next lifecycle event, or `None` once the session is over and the
    /// terminal event has been consumed.
    pub async fn next_event(&mut self) -> Option<TunnelEvent> {
        self.events.recv().await
    }

    /// Ask the session to shut down gracefully. The session ends the broker
    /// connection and emits a final `Dead`.
    pub async fn close(&self) {
        let _ = self.shutdown.send(()).await;
    }

    /// Wait for the session task to finish. Usually preceded by [`close`].
    ///
    /// [`close`]: Self::close
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}
