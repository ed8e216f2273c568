//! WebSocket collaboration server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── compositions.<id> ── OrderDispatcher ── CompositionStore
//! Client B ──┘          │
//!                       ├── PresenceRegistry (who is live where)
//!                       │
//!            ┌──────────┴───────────┐
//!            ▼                      ▼
//!     shared channel         private queues
//!     (all subscribers)      (per user session)
//! ```
//!
//! Each connection is one session: it authenticates once, may subscribe to
//! composition channels, and sends orders. Mutations commit through the
//! dispatcher before anything is fanned out; rejections go back on the
//! sending connection only and never close it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use cocanvas_core::store::CompositionStore;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{parse_destination, BroadcastRouter};
use crate::dispatch::{IdentityResolver, OrderDispatcher, SessionIdentity};
use crate::error::{CollabError, CollabResult};
use crate::lifecycle::SubscriptionManager;
use crate::order::Order;
use crate::presence::PresenceRegistry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per composition
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_orders: u64,
    pub rejected_frames: u64,
}

/// Frames a client may send, discriminated by `frame`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Authenticate the session. Must come first.
    Connect { token: String },
    /// Join a composition channel, e.g. `compositions.<id>`.
    Subscribe { destination: String },
    /// Leave the currently joined composition channel.
    Unsubscribe {},
    /// Submit a mutation order for the addressed composition.
    Send {
        destination: String,
        order: serde_json::Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorFrame {
    error: &'static str,
    detail: String,
}

impl ErrorFrame {
    fn from(err: &CollabError) -> Self {
        let error = match err {
            CollabError::AccessDenied(_) => "accessDenied",
            CollabError::NotFound(_) => "notFound",
            CollabError::InvalidArgument(_) => "invalidArgument",
            CollabError::Delivery(_) => "deliveryFailure",
            CollabError::Store(_) => "storeFailure",
        };
        Self {
            error,
            detail: err.to_string(),
        }
    }
}

/// Shared handles cloned into each connection task.
#[derive(Clone)]
struct ConnectionCtx {
    dispatcher: Arc<OrderDispatcher>,
    lifecycle: Arc<SubscriptionManager>,
    router: Arc<BroadcastRouter>,
    resolver: Arc<dyn IdentityResolver>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The collaboration server.
///
/// Owns nothing ambient: store and identity resolver come in at
/// construction, everything else is built here and shared by handle.
pub struct CollabServer {
    config: ServerConfig,
    dispatcher: Arc<OrderDispatcher>,
    lifecycle: Arc<SubscriptionManager>,
    router: Arc<BroadcastRouter>,
    resolver: Arc<dyn IdentityResolver>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn CompositionStore>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        let router = Arc::new(BroadcastRouter::new(config.broadcast_capacity));
        let registry = Arc::new(PresenceRegistry::new());
        let lifecycle = Arc::new(SubscriptionManager::new(registry, router.clone()));
        let dispatcher = Arc::new(OrderDispatcher::new(store));
        Self {
            config,
            dispatcher,
            lifecycle,
            router,
            resolver,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn CompositionStore> {
        self.dispatcher.store()
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Delete a composition on behalf of its owner and tell every guest on
    /// their private channel. This is the only way a deletion enters the
    /// collaboration layer; clients cannot order one.
    pub async fn delete_composition(
        &self,
        composition_id: &str,
        author_email: Option<&str>,
    ) -> CollabResult<()> {
        let store = self.dispatcher.store();
        let Some(compo) = store.find_composition(composition_id).await? else {
            return Err(CollabError::NotFound(format!(
                "composition {composition_id} not found"
            )));
        };
        if !store.delete_composition(composition_id).await?.is_found() {
            return Err(CollabError::NotFound(format!(
                "composition {composition_id} not found"
            )));
        }
        self.router
            .announce_composition_deleted(&compo, author_email)
            .await;
        Ok(())
    }

    /// Start listening for WebSocket connections.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collaboration server listening on {}", self.config.bind_addr);

        let ctx = ConnectionCtx {
            dispatcher: self.dispatcher.clone(),
            lifecycle: self.lifecycle.clone(),
            router: self.router.clone(),
            resolver: self.resolver.clone(),
            stats: self.stats.clone(),
        };

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ConnectionCtx,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let session_id = Uuid::new_v4().to_string();
    log::info!("session {session_id} established from {addr}");

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Connection state
    let mut identity: Option<SessionIdentity> = None;
    let mut private_rx: Option<mpsc::UnboundedReceiver<Arc<String>>> = None;
    // Frames from all of this session's shared channels, merged by one
    // forwarder task per subscription.
    let (merged_tx, mut merged_rx) = mpsc::unbounded_channel::<Arc<String>>();
    let mut forwarders: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

    // Outbound send failures break out of the loop rather than return, so
    // the cleanup below runs on every exit path. A session whose write
    // side died must still leave the presence registry and announce its
    // departure.
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("undecodable frame from session {session_id}: {e}");
                                ctx.stats.write().await.rejected_frames += 1;
                                let err = CollabError::InvalidArgument(e.to_string());
                                if send_error(&mut ws_sender, &err).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };
                        match frame {
                            ClientFrame::Connect { token } => {
                                if identity.is_some() {
                                    let err = CollabError::InvalidArgument(
                                        "session is already authenticated".into(),
                                    );
                                    if send_error(&mut ws_sender, &err).await.is_err() {
                                        break;
                                    }
                                    continue;
                                }
                                match ctx.resolver.resolve(&token) {
                                    Some(resolved) => {
                                        private_rx = Some(
                                            ctx.router
                                                .register_session(&resolved.user_id, &session_id)
                                                .await,
                                        );
                                        log::info!(
                                            "session {session_id} authenticated as {}",
                                            resolved.email
                                        );
                                        identity = Some(resolved);
                                        let ack = serde_json::json!({
                                            "event": "connected",
                                            "sessionId": session_id,
                                        });
                                        if ws_sender
                                            .send(Message::text(ack.to_string()))
                                            .await
                                            .is_err()
                                        {
                                            break;
                                        }
                                    }
                                    None => {
                                        ctx.stats.write().await.rejected_frames += 1;
                                        let err = CollabError::AccessDenied(
                                            "unresolvable credential".into(),
                                        );
                                        if send_error(&mut ws_sender, &err).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            ClientFrame::Subscribe { destination } => {
                                let Some(who) = identity.as_ref() else {
                                    let err =
                                        CollabError::AccessDenied("subscribe before connect".into());
                                    if send_error(&mut ws_sender, &err).await.is_err() {
                                        break;
                                    }
                                    continue;
                                };
                                let Some(composition_id) = parse_destination(&destination) else {
                                    ctx.stats.write().await.rejected_frames += 1;
                                    let err = CollabError::InvalidArgument(format!(
                                        "malformed destination {destination:?}"
                                    ));
                                    if send_error(&mut ws_sender, &err).await.is_err() {
                                        break;
                                    }
                                    continue;
                                };
                                // Attach the channel first so the session
                                // sees its own member-joined notice.
                                let rx = ctx.router.subscribe_topic(composition_id).await;
                                if let Some(old) = forwarders
                                    .insert(destination.clone(), spawn_forwarder(rx, merged_tx.clone()))
                                {
                                    old.abort();
                                }
                                if let Err(e) = ctx
                                    .lifecycle
                                    .on_subscribe(who, &session_id, &destination)
                                    .await
                                {
                                    if send_error(&mut ws_sender, &e).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            ClientFrame::Unsubscribe {} => {
                                let Some(who) = identity.as_ref() else {
                                    let err = CollabError::AccessDenied(
                                        "unsubscribe before connect".into(),
                                    );
                                    if send_error(&mut ws_sender, &err).await.is_err() {
                                        break;
                                    }
                                    continue;
                                };
                                match ctx.lifecycle.on_unsubscribe(who, &session_id).await {
                                    Some(departure) => {
                                        if let Some(handle) = forwarders.remove(&departure.topic) {
                                            handle.abort();
                                            let _ = handle.await;
                                        }
                                        if let Some(cid) = parse_destination(&departure.topic) {
                                            ctx.router.drop_topic_if_idle(cid).await;
                                        }
                                    }
                                    None => {
                                        log::debug!(
                                            "session {session_id} unsubscribed without subscription"
                                        );
                                    }
                                }
                            }
                            ClientFrame::Send { destination, order } => {
                                let outcome = handle_send(
                                    &ctx,
                                    identity.as_ref(),
                                    &destination,
                                    order,
                                )
                                .await;
                                match outcome {
                                    Ok(()) => {
                                        ctx.stats.write().await.total_orders += 1;
                                    }
                                    Err(e) => {
                                        ctx.stats.write().await.rejected_frames += 1;
                                        if send_error(&mut ws_sender, &e).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("session {session_id} closed from {addr}");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::error!("websocket error on session {session_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Private queue, live after authentication.
            frame = async {
                match private_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match frame {
                    Some(raw) => {
                        if ws_sender.send(Message::text(raw.as_str())).await.is_err() {
                            log::debug!("write side of session {session_id} is gone");
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Shared channels, merged across subscriptions.
            frame = merged_rx.recv() => {
                // merged_tx is held here, so recv cannot yield None.
                if let Some(raw) = frame {
                    if ws_sender.send(Message::text(raw.as_str())).await.is_err() {
                        log::debug!("write side of session {session_id} is gone");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: the disconnected session leaves everywhere at once.
    for (_, handle) in forwarders.drain() {
        handle.abort();
        let _ = handle.await;
    }
    if let Some(who) = identity.as_ref() {
        let departures = ctx.lifecycle.on_disconnect(who, &session_id).await;
        ctx.router.unregister_session(&who.user_id, &session_id).await;
        for departure in departures {
            if let Some(cid) = parse_destination(&departure.topic) {
                ctx.router.drop_topic_if_idle(cid).await;
            }
        }
    }
    ctx.stats.write().await.active_connections -= 1;

    Ok(())
}

/// Decode, dispatch and route one mutation order.
async fn handle_send(
    ctx: &ConnectionCtx,
    identity: Option<&SessionIdentity>,
    destination: &str,
    raw_order: serde_json::Value,
) -> CollabResult<()> {
    let composition_id = parse_destination(destination).ok_or_else(|| {
        CollabError::InvalidArgument(format!("malformed destination {destination:?}"))
    })?;
    let order: Order = serde_json::from_value(raw_order)
        .map_err(|e| CollabError::InvalidArgument(e.to_string()))?;

    let applied = ctx.dispatcher.dispatch(identity, composition_id, order).await?;

    match &applied {
        Order::CollaborativeChanged { collaborative, .. } => {
            // Audience depends on the new value; guests come from the store.
            let guest_ids = ctx
                .dispatcher
                .store()
                .find_composition(composition_id)
                .await?
                .map(|c| c.guest_ids)
                .unwrap_or_default();
            ctx.router
                .announce_collaborative_changed(
                    composition_id,
                    *collaborative,
                    &guest_ids,
                    applied.author_email(),
                )
                .await;
        }
        _ => {
            ctx.router.broadcast_for_collaboration(&applied).await;
        }
    }
    Ok(())
}

fn spawn_forwarder(
    mut rx: broadcast::Receiver<Arc<String>>,
    tx: mpsc::UnboundedSender<Arc<String>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("subscriber lagged by {n} frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn send_error<S>(ws_sender: &mut S, err: &CollabError) -> Result<(), S::Error>
where
    S: SinkExt<Message> + Unpin,
{
    let frame = ErrorFrame::from(err);
    let raw = serde_json::to_string(&frame).unwrap_or_else(|_| {
        r#"{"error":"storeFailure","detail":"unserializable error"}"#.to_string()
    });
    ws_sender.send(Message::text(raw)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::StaticIdentityResolver;
    use cocanvas_core::store::MemoryCompositionStore;

    fn test_server() -> CollabServer {
        let store = Arc::new(MemoryCompositionStore::new());
        let resolver = Arc::new(StaticIdentityResolver::new().with_user(
            "tok-1",
            "u1",
            "owner@example.org",
        ));
        CollabServer::new(ServerConfig::default(), store, resolver)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_client_frame_grammar() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"frame":"connect","token":"tok-1"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Connect { token } if token == "tok-1"));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"frame":"subscribe","destination":"compositions.c1"}"#)
                .unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { .. }));

        let frame: ClientFrame = serde_json::from_str(
            r#"{"frame":"send","destination":"compositions.c1","order":{"orderType":"elementDeleted","elementId":"e1"}}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::Send { .. }));

        assert!(serde_json::from_str::<ClientFrame>(r#"{"frame":"shout"}"#).is_err());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = test_server();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_orders, 0);
        assert_eq!(stats.rejected_frames, 0);
    }

    #[tokio::test]
    async fn test_delete_composition_notifies_guests() {
        let server = test_server();
        let compo = server
            .store()
            .create_composition("Doomed composition", true, "u1")
            .await
            .unwrap();
        server.store().add_guest(&compo.id, "u2").await.unwrap();

        let mut guest_rx = server.router().register_session("u2", "s2").await;
        server
            .delete_composition(&compo.id, Some("owner@example.org"))
            .await
            .unwrap();

        assert!(!server.store().exists(&compo.id).await.unwrap());
        let raw = guest_rx.recv().await.unwrap();
        match crate::order::ServerFrame::decode(&raw).unwrap() {
            crate::order::ServerFrame::Order(Order::CompositionDeleted { meta }) => {
                assert_eq!(meta.composition_id, compo.id);
                assert_eq!(meta.author_email.as_deref(), Some("owner@example.org"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_missing_composition() {
        let server = test_server();
        match server.delete_composition("nope", None).await {
            Err(CollabError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }
}
