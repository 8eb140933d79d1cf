//! Producer connections: accept loop, live-session set and per-connection
//! receive loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{DecodeError, SessionError};
use crate::pipeline::{Ingested, Pipeline};

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub opened_at: DateTime<Local>,
    events: Arc<AtomicU64>,
}

impl SessionInfo {
    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

/// The set of sessions currently receiving. Membership is tied to a
/// `SessionGuard`, so a session leaves the set on every exit path.
#[derive(Default)]
pub struct LiveSessions {
    sessions: DashMap<u64, SessionInfo>,
    next_id: AtomicU64,
}

impl LiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> SessionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let info = SessionInfo {
            id,
            peer,
            opened_at: Local::now(),
            events: Arc::new(AtomicU64::new(0)),
        };
        let events = info.events.clone();
        self.sessions.insert(id, info);
        SessionGuard {
            id,
            peer,
            events,
            live: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }
}

pub struct SessionGuard {
    id: u64,
    peer: SocketAddr,
    events: Arc<AtomicU64>,
    live: Arc<LiveSessions>,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    fn record_event(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes the session from the live set. Safe to call more than once.
    pub fn close(&self) {
        if self.live.sessions.remove(&self.id).is_some() {
            info!(
                session = self.id,
                peer = %self.peer,
                events = self.events(),
                active = self.live.len(),
                "session_closed"
            );
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct SessionManager {
    pipeline: Arc<Pipeline>,
    live: Arc<LiveSessions>,
    handshake_timeout: Duration,
}

impl SessionManager {
    pub fn new(pipeline: Arc<Pipeline>, live: Arc<LiveSessions>, handshake_timeout: Duration) -> Self {
        Self {
            pipeline,
            live,
            handshake_timeout,
        }
    }

    pub fn live(&self) -> &Arc<LiveSessions> {
        &self.live
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Accepts producers until shutdown, then waits for every session to end.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        while !*shutdown.borrow() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection_accepted");
                        let manager = self.clone();
                        let shutdown = shutdown.clone();
                        tasks.spawn(async move { manager.handle_connection(stream, peer, shutdown).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept_failed");
                        sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
                _ = shutdown.changed() => break,
            }
        }

        drop(listener);
        info!(active = self.live.len(), "ingestion_endpoint_closing");
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        info!("all_sessions_closed");
    }

    /// Runs one connection to completion. Errors end only this session.
    pub async fn handle_connection<S>(&self, stream: S, peer: SocketAddr, shutdown: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = self.run_session(stream, peer, shutdown).await {
            warn!(%peer, error = %e, "session_failed");
        }
    }

    async fn run_session<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<u64, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws = match timeout(self.handshake_timeout, accept_async(stream)).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(source)) => return Err(SessionError::Handshake { peer, source }),
            Err(_) => return Err(SessionError::HandshakeTimeout { peer }),
        };

        let session = self.live.register(peer);
        info!(session = session.id(), %peer, active = self.live.len(), "session_opened");
        let result = self.receive_loop(ws, &session, peer, &mut shutdown).await;
        session.close();
        result.map(|()| session.events())
    }

    async fn receive_loop<S>(
        &self,
        mut ws: WebSocketStream<S>,
        session: &SessionGuard,
        peer: SocketAddr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                close_socket(&mut ws, session).await;
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    close_socket(&mut ws, session).await;
                    return Ok(());
                }
                message = ws.next() => match message {
                    None => return Ok(()),
                    Some(Ok(Message::Text(text))) => {
                        let outcome = self.pipeline.ingest(&text).await;
                        self.settle(session, outcome);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let outcome = self.pipeline.ingest_bytes(&bytes).await;
                        self.settle(session, outcome);
                    }
                    // the peer's close frame is answered by the next poll
                    Some(Ok(Message::Close(_))) => {}
                    Some(Ok(_)) => {}
                    Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(()),
                    Some(Err(source)) => return Err(SessionError::Receive { peer, source }),
                },
            }
        }
    }

    fn settle(&self, session: &SessionGuard, outcome: Result<Ingested, DecodeError>) {
        match outcome {
            Ok(_) => session.record_event(),
            Err(e) => warn!(
                session = session.id(),
                reason = %e.reason,
                raw = %e.preview(),
                "decode_failed"
            ),
        }
    }
}

async fn close_socket<S>(ws: &mut WebSocketStream<S>, session: &SessionGuard)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = ws.close(None).await {
        debug!(session = session.id(), error = %e, "session_close_frame_failed");
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "session_task_panicked");
        }
    }
}
