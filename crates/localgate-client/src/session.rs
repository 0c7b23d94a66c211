//! Tunnel session: the task that owns the broker connection.
//!
//! One session holds exactly one control connection and pairs it with a
//! sequence of local connections over its life. Pairings are strictly
//! sequential; a new local attempt only starts after the previous one fails.
//! Every way a session can end converges on a single exit that emits one
//! `Dead` event, so teardown can never run twice.

use crate::config::TunnelConfig;
use crate::error::{LocalError, TunnelError};
use crate::event::{sniff_request, TunnelEvent};
use crate::local::{LocalEndpoint, LocalStream};
use localgate_stream::{HostRewriteFilter, TimeoutSentinel};
use rand::Rng;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Fixed delay between local connect attempts after a transient failure.
const LOCAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Bounds for the randomized pairing lifetime. The spread keeps a fleet of
/// clients from reconnecting in lockstep and stays clear of the silent
/// ~90-second idle disconnect some local services apply.
const SESSION_LIFETIME_MIN: Duration = Duration::from_millis(30_000);
const SESSION_LIFETIME_MAX: Duration = Duration::from_millis(80_000);

/// Keep-alive probe timing on the control connection.
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Read buffer size for both pipe directions.
const READ_BUF: usize = 16 * 1024;

/// Lifecycle of the local side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairingState {
    Idle,
    Connecting,
    Paired,
    Retrying,
    Closed,
}

/// Why the session ended. Collapsed into one `Dead` event for the caller;
/// the distinction only reaches the logs.
#[derive(Debug)]
enum CloseReason {
    RemoteClosed,
    RemoteError(io::Error),
    LocalFatal(io::Error),
    SessionExpired,
    TimeoutSignal,
    UserClosed,
}

/// Outcome of one paired pipe.
enum PipeEnd {
    Close(CloseReason),
    RetryLocal,
}

pub(crate) struct TunnelSession {
    config: TunnelConfig,
    endpoint: LocalEndpoint,
    events: mpsc::Sender<TunnelEvent>,
    shutdown: mpsc::Receiver<()>,
    state: PairingState,
}

impl TunnelSession {
    pub(crate) fn new(
        config: TunnelConfig,
        endpoint: LocalEndpoint,
        events: mpsc::Sender<TunnelEvent>,
        shutdown: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            config,
            endpoint,
            events,
            shutdown,
            state: PairingState::Idle,
        }
    }

    pub(crate) async fn run(mut self) {
        let remote = match TcpStream::connect(self.config.remote_addr()).await {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                error!(addr = %self.config.remote_addr(), "broker refused the control connection");
                let _ = self
                    .events
                    .send(TunnelEvent::Error(TunnelError::RemoteRefused {
                        host: self.config.remote_host.clone(),
                        port: self.config.remote_port,
                    }))
                    .await;
                return;
            }
            Err(e) => {
                self.finish(CloseReason::RemoteError(e), None).await;
                return;
            }
        };

        if let Err(e) = enable_keepalive(&remote) {
            warn!("failed to enable TCP keep-alive on control connection: {}", e);
        }

        let remote_addr = match remote.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.finish(CloseReason::RemoteError(e), None).await;
                return;
            }
        };

        info!(%remote_addr, "tunnel control connection established");
        let _ = self.events.send(TunnelEvent::Open { remote_addr }).await;

        let (mut remote_rd, mut remote_wr) = remote.into_split();

        // At most one remote chunk read while a pairing is being negotiated;
        // everything else stays in the transport until the local side is up.
        let mut staged: Option<Vec<u8>> = None;

        let reason = self
            .drive(&mut remote_rd, &mut remote_wr, &mut staged)
            .await;
        self.finish(reason, Some(&mut remote_wr)).await;
    }

    /// Pairing loop: establish a local connection, pipe until it ends,
    /// repeat on transient local failure.
    async fn drive(
        &mut self,
        remote_rd: &mut OwnedReadHalf,
        remote_wr: &mut OwnedWriteHalf,
        staged: &mut Option<Vec<u8>>,
    ) -> CloseReason {
        loop {
            self.set_state(PairingState::Connecting);
            let local = match self.establish_local(remote_rd, staged).await {
                Ok(local) => local,
                Err(reason) => return reason,
            };

            self.set_state(PairingState::Paired);
            match self.pipe(local, remote_rd, remote_wr, staged).await {
                PipeEnd::Close(reason) => return reason,
                PipeEnd::RetryLocal => {
                    self.set_state(PairingState::Retrying);
                    if let Err(reason) = self.backoff(remote_rd, staged).await {
                        return reason;
                    }
                }
            }
        }
    }

    /// Connect to the local service, retrying transient failures for as long
    /// as the remote connection stays alive.
    async fn establish_local(
        &mut self,
        remote_rd: &mut OwnedReadHalf,
        staged: &mut Option<Vec<u8>>,
    ) -> Result<LocalStream, CloseReason> {
        loop {
            let attempt = tokio::select! {
                result = self.endpoint.connect() => result,
                _ = self.shutdown.recv() => return Err(CloseReason::UserClosed),
            };

            match attempt {
                Ok(local) => return Ok(local),
                Err(LocalError::Transient(e)) => {
                    info!(
                        addr = %self.config.local_addr(),
                        "local service unavailable ({}), retrying in {:?}",
                        e,
                        LOCAL_RETRY_DELAY
                    );
                    self.set_state(PairingState::Retrying);
                    self.backoff(remote_rd, staged).await?;
                    self.set_state(PairingState::Connecting);
                }
                Err(LocalError::Fatal(e)) => {
                    error!("local connection failed: {}", e);
                    return Err(CloseReason::LocalFatal(e));
                }
            }
        }
    }

    /// Wait out the retry delay while watching the remote side. A broker
    /// close here unwinds the retry loop; a data chunk is staged (one at
    /// most) for delivery once the pairing is up.
    async fn backoff(
        &mut self,
        remote_rd: &mut OwnedReadHalf,
        staged: &mut Option<Vec<u8>>,
    ) -> Result<(), CloseReason> {
        let delay = sleep(LOCAL_RETRY_DELAY);
        tokio::pin!(delay);
        let mut buf = vec![0u8; READ_BUF];

        loop {
            tokio::select! {
                _ = &mut delay => return Ok(()),
                _ = self.shutdown.recv() => return Err(CloseReason::UserClosed),
                read = remote_rd.read(&mut buf), if staged.is_none() => match read {
                    Ok(0) => return Err(CloseReason::RemoteClosed),
                    Ok(n) => {
                        self.observe_remote_chunk(&buf[..n]).await;
                        *staged = Some(buf[..n].to_vec());
                    }
                    Err(e) => return Err(CloseReason::RemoteError(e)),
                },
            }
        }
    }

    /// Full-duplex relay for one pairing.
    async fn pipe(
        &mut self,
        local: LocalStream,
        remote_rd: &mut OwnedReadHalf,
        remote_wr: &mut OwnedWriteHalf,
        staged: &mut Option<Vec<u8>>,
    ) -> PipeEnd {
        let (mut local_rd, mut local_wr) = tokio::io::split(local);
        let mut sentinel = TimeoutSentinel::new();
        let mut rewrite = self.config.host_override().map(HostRewriteFilter::new);

        if let Some(chunk) = staged.take() {
            if let Err(end) = write_local(&mut local_wr, &mut rewrite, &chunk).await {
                return end;
            }
        }

        // One-shot pairing lifetime; polled only when expiry is enabled. It
        // lives inside this pairing's scope, so ending the pipe (including
        // for a retry) disarms it.
        let lifetime = uniform(SESSION_LIFETIME_MIN, SESSION_LIFETIME_MAX);
        let expiry = sleep(lifetime);
        tokio::pin!(expiry);
        let expiry_enabled = self.config.session_expiry;
        if expiry_enabled {
            debug!(?lifetime, "pairing lifetime armed");
        }

        let mut rbuf = vec![0u8; READ_BUF];
        let mut lbuf = vec![0u8; READ_BUF];
        let mut local_eof = false;

        loop {
            tokio::select! {
                _ = &mut expiry, if expiry_enabled => {
                    info!(?lifetime, "pairing lifetime elapsed, retiring session");
                    return PipeEnd::Close(CloseReason::SessionExpired);
                }
                _ = self.shutdown.recv() => {
                    return PipeEnd::Close(CloseReason::UserClosed);
                }
                read = remote_rd.read(&mut rbuf) => match read {
                    Ok(0) => return PipeEnd::Close(CloseReason::RemoteClosed),
                    Ok(n) => {
                        self.observe_remote_chunk(&rbuf[..n]).await;
                        if let Err(end) = write_local(&mut local_wr, &mut rewrite, &rbuf[..n]).await {
                            return end;
                        }
                    }
                    Err(e) => return PipeEnd::Close(CloseReason::RemoteError(e)),
                },
                read = local_rd.read(&mut lbuf), if !local_eof => match read {
                    Ok(0) => {
                        // Clean local close is a completed exchange, not a
                        // failure. The pairing ends when the remote side does.
                        debug!("local service closed its side");
                        local_eof = true;
                    }
                    Ok(n) => {
                        let hit = sentinel.observe(&lbuf[..n]);
                        if let Err(e) = remote_wr.write_all(&lbuf[..n]).await {
                            return PipeEnd::Close(CloseReason::RemoteError(e));
                        }
                        if hit {
                            return PipeEnd::Close(CloseReason::TimeoutSignal);
                        }
                    }
                    Err(e) => match LocalError::classify(e) {
                        LocalError::Transient(e) => {
                            info!("local connection dropped ({}), reconnecting", e);
                            return PipeEnd::RetryLocal;
                        }
                        LocalError::Fatal(e) => {
                            error!("local connection failed: {}", e);
                            return PipeEnd::Close(CloseReason::LocalFatal(e));
                        }
                    },
                },
            }
        }
    }

    /// Best-effort request-line observation on an inbound chunk.
    async fn observe_remote_chunk(&self, chunk: &[u8]) {
        if let Some((method, path)) = sniff_request(chunk) {
            debug!(%method, %path, "inbound request");
            let _ = self
                .events
                .send(TunnelEvent::Request { method, path })
                .await;
        }
    }

    /// The single exit: log the cause, end the remote connection, emit the
    /// one `Dead` event.
    async fn finish(&mut self, reason: CloseReason, remote_wr: Option<&mut OwnedWriteHalf>) {
        self.set_state(PairingState::Closed);
        match &reason {
            CloseReason::RemoteClosed => info!("broker closed the tunnel"),
            CloseReason::RemoteError(e) => error!("tunnel connection error: {}", e),
            CloseReason::LocalFatal(e) => error!("retiring tunnel after local failure: {}", e),
            CloseReason::SessionExpired => info!("tunnel retired at end of pairing lifetime"),
            CloseReason::TimeoutSignal => info!("tunnel retired on embedded timeout response"),
            CloseReason::UserClosed => info!("tunnel closed by caller"),
        }

        if let Some(wr) = remote_wr {
            let _ = wr.shutdown().await;
        }

        let _ = self.events.send(TunnelEvent::Dead).await;
    }

    fn set_state(&mut self, next: PairingState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "pairing state");
            self.state = next;
        }
    }
}

/// Write one inbound chunk to the local service, routed through the Host
/// rewrite filter when one is configured.
async fn write_local<W>(
    local_wr: &mut W,
    rewrite: &mut Option<HostRewriteFilter>,
    chunk: &[u8],
) -> Result<(), PipeEnd>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let rewritten;
    let bytes: &[u8] = match rewrite {
        Some(filter) => {
            rewritten = filter.transform(chunk);
            &rewritten
        }
        None => chunk,
    };

    // The filter may be holding the chunk until the header block completes.
    if bytes.is_empty() {
        return Ok(());
    }

    match local_wr.write_all(bytes).await {
        Ok(()) => Ok(()),
        Err(e) => match LocalError::classify(e) {
            LocalError::Transient(e) => {
                info!("local write failed ({}), reconnecting", e);
                Err(PipeEnd::RetryLocal)
            }
            LocalError::Fatal(e) => {
                error!("local write failed: {}", e);
                Err(PipeEnd::Close(CloseReason::LocalFatal(e)))
            }
        },
    }
}

fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Draw a duration uniformly from `[low, high]`.
pub(crate) fn uniform(low: Duration, high: Duration) -> Duration {
    debug_assert!(low <= high);
    rand::thread_rng().gen_range(low..=high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_stays_in_bounds() {
        for _ in 0..1000 {
            let d = uniform(SESSION_LIFETIME_MIN, SESSION_LIFETIME_MAX);
            assert!(d >= SESSION_LIFETIME_MIN);
            assert!(d <= SESSION_LIFETIME_MAX);
        }
    }

    #[test]
    fn test_uniform_actually_varies() {
        let first = uniform(SESSION_LIFETIME_MIN, SESSION_LIFETIME_MAX);
        let varied = (0..100)
            .map(|_| uniform(SESSION_LIFETIME_MIN, SESSION_LIFETIME_MAX))
            .any(|d| d != first);
        assert!(varied);
    }

    #[test]
    fn test_uniform_degenerate_range() {
        let fixed = Duration::from_millis(500);
        assert_eq!(uniform(fixed, fixed), fixed);
    }
}
