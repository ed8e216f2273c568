//! Broadcast router: fan-out of orders and presence notices.
//!
//! Two addressing namespaces:
//!
//! - a shared channel per composition, `compositions.<compositionId>`,
//!   reaching every currently-joined subscriber (tokio broadcast channel,
//!   one receiver per subscribed session);
//! - a private per-user channel, reaching each of a user's connected
//!   sessions individually (one mpsc queue per session).
//!
//! Delivery is best-effort and asynchronous relative to the mutation that
//! triggered it: a failed send to one recipient is logged and skipped,
//! never retried, and never affects other recipients or the mutation.
//! Frames are encoded once and fanned out as shared bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cocanvas_core::model::Composition;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::order::{Order, OrderMeta, ServerFrame};

/// Fixed prefix of every shared composition channel.
pub const TOPIC_PREFIX: &str = "compositions";

/// Build the shared-channel key for a composition.
pub fn topic_key(composition_id: &str) -> String {
    format!("{TOPIC_PREFIX}.{composition_id}")
}

/// Parse a destination of the form `compositions.<compositionId>`.
///
/// Rejects anything that does not split into exactly two such segments.
pub fn parse_destination(destination: &str) -> Option<&str> {
    let mut parts = destination.splitn(3, '.');
    let prefix = parts.next()?;
    let compo_id = parts.next()?;
    if prefix != TOPIC_PREFIX || compo_id.is_empty() || parts.next().is_some() {
        return None;
    }
    Some(compo_id)
}

/// Delivery counters, tracked with atomics off the hot path's locks.
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    pub frames_sent: u64,
    pub deliveries_failed: u64,
}

/// Routes outbound frames to shared and private channels.
///
/// Constructed once at server start; handed by `Arc` to the dispatcher
/// shell and the subscription lifecycle manager.
pub struct BroadcastRouter {
    topics: RwLock<HashMap<String, broadcast::Sender<Arc<String>>>>,
    sessions: RwLock<HashMap<String, HashMap<String, mpsc::UnboundedSender<Arc<String>>>>>,
    capacity: usize,
    frames_sent: AtomicU64,
    deliveries_failed: AtomicU64,
}

impl BroadcastRouter {
    /// `capacity` is the per-receiver buffer of each shared channel; lagging
    /// subscribers start dropping frames past it.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
        }
    }

    /// Subscribe a session to a composition's shared channel.
    pub async fn subscribe_topic(&self, composition_id: &str) -> broadcast::Receiver<Arc<String>> {
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(composition_id) {
                return sender.subscribe();
            }
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(composition_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop a shared channel once nothing subscribes to it anymore.
    pub async fn drop_topic_if_idle(&self, composition_id: &str) -> bool {
        let mut topics = self.topics.write().await;
        if let Some(sender) = topics.get(composition_id) {
            if sender.receiver_count() == 0 {
                topics.remove(composition_id);
                return true;
            }
        }
        false
    }

    /// Register a connected session's private queue.
    pub async fn register_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> mpsc::UnboundedReceiver<Arc<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.to_string(), tx);
        rx
    }

    pub async fn unregister_session(&self, user_id: &str, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(queues) = sessions.get_mut(user_id) {
            queues.remove(session_id);
            if queues.is_empty() {
                sessions.remove(user_id);
            }
        }
    }

    /// Send a frame on a composition's shared channel. Returns the number
    /// of receivers it reached.
    pub async fn send_to_topic(&self, composition_id: &str, frame: &ServerFrame) -> usize {
        let encoded = match frame.encode() {
            Ok(raw) => Arc::new(raw),
            Err(e) => {
                log::warn!("dropping undeliverable frame for topic {composition_id}: {e}");
                self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        };
        let sender = {
            let topics = self.topics.read().await;
            topics.get(composition_id).cloned()
        };
        match sender {
            Some(sender) => {
                let reached = sender.send(encoded).unwrap_or(0);
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                reached
            }
            None => {
                log::debug!("no shared channel for composition {composition_id}, frame dropped");
                0
            }
        }
    }

    /// Send a frame to every connected session of one user. Returns the
    /// number of sessions reached; an unknown recipient is dropped and
    /// logged, never an error.
    pub async fn send_to_user(&self, user_id: &str, frame: &ServerFrame) -> usize {
        let encoded = match frame.encode() {
            Ok(raw) => Arc::new(raw),
            Err(e) => {
                log::warn!("dropping undeliverable frame for user {user_id}: {e}");
                self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        };
        let queues: Vec<(String, mpsc::UnboundedSender<Arc<String>>)> = {
            let sessions = self.sessions.read().await;
            match sessions.get(user_id) {
                Some(queues) => queues
                    .iter()
                    .map(|(sid, tx)| (sid.clone(), tx.clone()))
                    .collect(),
                None => {
                    log::debug!("no connected session for user {user_id}, frame dropped");
                    return 0;
                }
            }
        };
        let mut reached = 0;
        for (session_id, tx) in queues {
            match tx.send(encoded.clone()) {
                Ok(()) => reached += 1,
                Err(_) => {
                    // Closed queue: the session is going away.
                    log::warn!("unable to send frame to user {user_id} session {session_id}");
                    self.deliveries_failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if reached > 0 {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
        reached
    }

    /// Fan a composition-scoped mutation order out on the shared channel —
    /// and only there, so currently-joined users never also receive it
    /// privately.
    pub async fn broadcast_for_collaboration(&self, order: &Order) -> usize {
        self.send_to_topic(order.composition_id(), &ServerFrame::Order(order.clone()))
            .await
    }

    /// Deliver an order to each guest's private channel, one message per
    /// guest, regardless of whether they are joined to the shared channel.
    /// A failure for one guest never aborts delivery to the others.
    pub async fn notify_guests(&self, guest_ids: &[String], order: &Order) {
        let frame = ServerFrame::Order(order.clone());
        for guest in guest_ids {
            self.send_to_user(guest, &frame).await;
        }
    }

    /// Audience policy for a collaborative-flag change.
    ///
    /// Turned on: the passive guests are the ones who need to hear it (they
    /// may now join the live channel), so each gets a private notice and
    /// nothing goes to the shared channel. Turned off: only the currently
    /// live users still matter, so exactly one shared broadcast and no
    /// private notices.
    pub async fn announce_collaborative_changed(
        &self,
        composition_id: &str,
        collaborative: bool,
        guest_ids: &[String],
        author_email: Option<&str>,
    ) {
        let mut order = Order::CollaborativeChanged {
            meta: OrderMeta::default(),
            collaborative,
        };
        order.stamp(composition_id, author_email);
        if collaborative {
            self.notify_guests(guest_ids, &order).await;
        } else {
            self.send_to_topic(composition_id, &ServerFrame::Order(order))
                .await;
        }
    }

    /// Tell every guest, on their private channel, that the composition is
    /// going away. Guests must hear this even when not currently joined.
    pub async fn announce_composition_deleted(
        &self,
        composition: &Composition,
        author_email: Option<&str>,
    ) {
        let mut order = Order::CompositionDeleted {
            meta: OrderMeta::default(),
        };
        order.stamp(&composition.id, author_email);
        self.notify_guests(&composition.guest_ids, &order).await;
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
        }
    }
}
