/// WebSocket debug server
use crate::auth::{AuthContext, AuthManager};
use crate::config::{FeatureFlags, ServerConfig};
use crate::errors::{DaemonError, DaemonResult};
use crate::handlers::DebugHandlers;
use crate::metrics::{ServerMetrics, ServerStats};
use crate::protocol::{parse_request, ServerMessage};
use crate::session::SessionManager;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracelens_core::{
    BreakpointManager, FeedBus, FeedEvent, FeedMessage, PerformanceAnalyzer, TraceCollector,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Debug server: authenticates clients, serves requests, pushes the feed
pub struct DebugServer {
    config: ServerConfig,
    auth: Arc<AuthManager>,
    sessions: Arc<SessionManager>,
    metrics: Arc<ServerMetrics>,
    handlers: DebugHandlers,
    collector: Arc<TraceCollector>,
    breakpoints: Arc<BreakpointManager>,
    feed: FeedBus,
}

impl DebugServer {
    pub fn new(
        config: ServerConfig,
        features: FeatureFlags,
        collector: Arc<TraceCollector>,
        breakpoints: Arc<BreakpointManager>,
        analyzer: Arc<PerformanceAnalyzer>,
        feed: FeedBus,
    ) -> DaemonResult<Self> {
        let sessions = Arc::new(SessionManager::new(config.max_sessions));
        let metrics = Arc::new(ServerMetrics::new()?);
        let handlers = DebugHandlers::new(
            features,
            collector.clone(),
            breakpoints.clone(),
            analyzer,
            sessions.clone(),
            metrics.clone(),
        );

        Ok(DebugServer {
            auth: Arc::new(AuthManager::new(&config)),
            config,
            sessions,
            metrics,
            handlers,
            collector,
            breakpoints,
            feed,
        })
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> ServerStats {
        self.metrics.snapshot(self.sessions.count())
    }

    /// Bind the configured address. Port 0 picks an ephemeral port; read it
    /// back from the listener.
    pub async fn bind(&self) -> DaemonResult<TcpListener> {
        let listener =
            TcpListener::bind((self.config.bind_addr.as_str(), self.config.port)).await?;
        info!(
            "Debug server listening on {} (auth {})",
            listener.local_addr()?,
            if self.auth.is_enabled() { "required" } else { "optional" }
        );
        Ok(listener)
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let token = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer, token).await {
                                debug!("Connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
        info!("Debug server stopped");
    }

    // ========================================================================
    // CONNECTION
    // ========================================================================

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> DaemonResult<()> {
        let mut identity: Option<AuthContext> = None;
        let mut refused: Option<String> = None;
        let auth = self.auth.clone();
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match auth.authenticate_request(request) {
                Ok(context) => {
                    identity = Some(context);
                    Ok(response)
                }
                Err(e) => {
                    let mut refusal = ErrorResponse::new(Some(e.to_string()));
                    *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                    refused = Some(e.to_string());
                    Err(refusal)
                }
            }
        };

        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                if let Some(reason) = refused {
                    self.metrics.record_auth_failure();
                    warn!("Refused connection from {}: {}", peer, reason);
                    return Err(DaemonError::AuthenticationError(reason));
                }
                return Err(DaemonError::Connection(e.to_string()));
            }
        };
        let identity = identity.unwrap_or_else(AuthContext::anonymous);

        let (mut sink, mut incoming) = ws_stream.split();

        let session = match self.sessions.create(&identity) {
            Ok(session) => session,
            Err(e) => {
                warn!("Rejecting {}: {}", peer, e);
                send(&mut sink, &ServerMessage::error(None, &e)).await?;
                let _ = sink.send(WsMessage::Close(None)).await;
                return Err(e);
            }
        };
        self.metrics.record_connection();
        info!("Client {} connected as {} (session {})", peer, session.identity, session.id);

        // Subscribe before the welcome so nothing published afterwards is missed
        let mut feed = self.feed.subscribe();
        let result = self
            .run_session(session.id, &identity, &mut sink, &mut incoming, &mut feed, shutdown)
            .await;

        let cleared = self.breakpoints.clear_session_watches(session.id);
        self.sessions.remove(session.id);
        self.metrics.record_connection_closed();
        info!(
            "Client {} disconnected (session {}, {} watches cleared)",
            peer, session.id, cleared
        );
        result
    }

    async fn run_session(
        &self,
        session_id: Uuid,
        identity: &AuthContext,
        sink: &mut WsSink,
        incoming: &mut futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        feed: &mut tokio::sync::broadcast::Receiver<FeedMessage>,
        shutdown: CancellationToken,
    ) -> DaemonResult<()> {
        let welcome = ServerMessage::Welcome {
            session_id,
            identity: identity.identity.clone(),
            features: self.handlers.features(),
            server_version: crate::VERSION.to_string(),
        };
        send(sink, &welcome).await?;

        let period = Duration::from_secs(self.config.heartbeat_secs);
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }

                frame = incoming.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = self.dispatch(session_id, &text);
                        send(sink, &reply).await?;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        sink.send(WsMessage::Pong(data))
                            .await
                            .map_err(|e| DaemonError::Connection(e.to_string()))?;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error on session {}: {}", session_id, e);
                        break;
                    }
                },

                received = feed.recv() => match received {
                    Ok(message) => {
                        for outgoing in self.deliver(session_id, message) {
                            send(sink, &outgoing).await?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Session {} lagged by {} feed events", session_id, skipped);
                        if self.is_subscribed(session_id) {
                            send(sink, &ServerMessage::Lagged { skipped }).await?;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = heartbeat.tick() => {
                    send(sink, &ServerMessage::Ping { timestamp: chrono::Utc::now() }).await?;
                }
            }
        }
        Ok(())
    }

    /// Decode and answer one client frame
    pub fn dispatch(&self, session_id: Uuid, text: &str) -> ServerMessage {
        let (id, request) = parse_request(text);
        self.sessions.record_request(session_id);

        let result = request.and_then(|request| self.handlers.handle(session_id, request));
        self.metrics.record_request(result.is_err());

        match result {
            Ok(value) => ServerMessage::response(id, value),
            Err(e) => {
                debug!("Request from session {} failed: {}", session_id, e);
                ServerMessage::error(id, &e)
            }
        }
    }

    /// Messages a feed event produces for one session
    pub fn deliver(&self, session_id: Uuid, message: FeedMessage) -> Vec<ServerMessage> {
        let session = match self.sessions.get(session_id) {
            Some(session) if session.subscribed => session,
            _ => return Vec::new(),
        };
        if !session
            .filter
            .matches(&message.event, |trace_id| self.collector.trace_workflow(trace_id))
        {
            return Vec::new();
        }

        let watch_target = match &message.event {
            FeedEvent::StepSuspended { execution_id, .. }
                if self.handlers.features().enable_breakpoints =>
            {
                Some(*execution_id)
            }
            _ => None,
        };

        self.metrics.record_feed_event();
        let mut outgoing = vec![ServerMessage::Event(message)];

        if let Some(execution_id) = watch_target {
            if !self.breakpoints.list_watches(session_id).is_empty() {
                match self.breakpoints.evaluate_watches(session_id, execution_id) {
                    Ok(results) => outgoing.push(ServerMessage::WatchResults {
                        execution_id,
                        results,
                    }),
                    // Already resumed by someone else
                    Err(e) => debug!("Skipping watches for {}: {}", execution_id, e),
                }
            }
        }
        outgoing
    }

    fn is_subscribed(&self, session_id: Uuid) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.subscribed)
            .unwrap_or(false)
    }
}

async fn send(sink: &mut WsSink, message: &ServerMessage) -> DaemonResult<()> {
    let json = message.to_json()?;
    sink.send(WsMessage::Text(json))
        .await
        .map_err(|e| DaemonError::Connection(e.to_string()))
}
