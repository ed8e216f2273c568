//! Subscription lifecycle: subscribe, unsubscribe, disconnect.
//!
//! Translates transport-level events into presence mutations and the
//! notices that go with them. The rules are asymmetric on purpose: a user
//! joins per subscription, but "left" is only announced when the user's
//! last session departs a composition, so a user working in two tabs never
//! flickers out of the member list when one tab closes.

use std::sync::Arc;

use crate::broadcast::{parse_destination, BroadcastRouter};
use crate::dispatch::SessionIdentity;
use crate::error::{CollabError, CollabResult};
use crate::order::{ConnectedMembersNotice, ConnectedUser, PresenceNotice, ServerFrame};
use crate::presence::{Departure, PresenceEntry, PresenceRegistry};

/// Handles join/leave bookkeeping and the resulting notices.
pub struct SubscriptionManager {
    registry: Arc<PresenceRegistry>,
    router: Arc<BroadcastRouter>,
}

impl SubscriptionManager {
    pub fn new(registry: Arc<PresenceRegistry>, router: Arc<BroadcastRouter>) -> Self {
        Self { registry, router }
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    /// Register a session on a composition's shared channel.
    ///
    /// Everyone already joined (the joiner included) gets a member-joined
    /// notice on the shared channel; the joiner additionally receives a
    /// private snapshot of everyone connected, so no second round trip is
    /// needed to render the member list.
    pub async fn on_subscribe(
        &self,
        identity: &SessionIdentity,
        session_id: &str,
        destination: &str,
    ) -> CollabResult<String> {
        let composition_id = parse_destination(destination).ok_or_else(|| {
            CollabError::InvalidArgument(format!("malformed destination {destination:?}"))
        })?;

        let entry = PresenceEntry::new(session_id, &identity.user_id, &identity.email);
        let snapshot = self.registry.join(destination, entry).await;

        let joined = PresenceNotice::joined(&identity.email, &identity.user_id);
        self.router
            .send_to_topic(composition_id, &ServerFrame::Presence(joined))
            .await;

        let users = snapshot
            .into_iter()
            .map(|e| ConnectedUser {
                email: e.email,
                id: e.user_id,
            })
            .collect();
        let members = ConnectedMembersNotice::new(composition_id, users);
        self.router
            .send_to_user(&identity.user_id, &ServerFrame::Members(members))
            .await;

        log::debug!(
            "session {session_id} of {} subscribed to {destination}",
            identity.email
        );
        Ok(composition_id.to_string())
    }

    /// Deregister one subscription of one session.
    pub async fn on_unsubscribe(
        &self,
        identity: &SessionIdentity,
        session_id: &str,
    ) -> Option<Departure> {
        let departure = self
            .registry
            .leave_by_session(&identity.user_id, session_id)
            .await?;
        self.announce_departure(identity, &departure).await;
        Some(departure)
    }

    /// Remove a disconnected session from every composition it was joined
    /// to. Other live sessions of the same user are untouched.
    pub async fn on_disconnect(
        &self,
        identity: &SessionIdentity,
        session_id: &str,
    ) -> Vec<Departure> {
        let departures = self
            .registry
            .leave_session_everywhere(&identity.user_id, session_id)
            .await;
        for departure in &departures {
            self.announce_departure(identity, departure).await;
        }
        if !departures.is_empty() {
            log::debug!(
                "session {session_id} of {} left {} composition(s) on disconnect",
                identity.email,
                departures.len()
            );
        }
        departures
    }

    /// Member-left is announced only when the user's last session on that
    /// composition is gone.
    async fn announce_departure(&self, identity: &SessionIdentity, departure: &Departure) {
        if !departure.last_of_user {
            return;
        }
        let Some(composition_id) = parse_destination(&departure.topic) else {
            return;
        };
        let left = PresenceNotice::left(&identity.email, &identity.user_id);
        self.router
            .send_to_topic(composition_id, &ServerFrame::Presence(left))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::PresenceNoticeKind;
    use tokio::sync::broadcast;

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new(
            Arc::new(PresenceRegistry::new()),
            Arc::new(BroadcastRouter::new(16)),
        )
    }

    fn alice() -> SessionIdentity {
        SessionIdentity::new("u1", "alice@example.org")
    }

    fn bob() -> SessionIdentity {
        SessionIdentity::new("u2", "bob@example.org")
    }

    fn router(manager: &SubscriptionManager) -> Arc<BroadcastRouter> {
        // Reconstructing the Arc keeps the tests honest about shared state.
        manager.router.clone()
    }

    async fn next_presence(rx: &mut broadcast::Receiver<Arc<String>>) -> PresenceNotice {
        let raw = rx.recv().await.unwrap();
        match ServerFrame::decode(&raw).unwrap() {
            ServerFrame::Presence(notice) => notice,
            other => panic!("expected presence notice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_rejects_malformed_destination() {
        let manager = manager();
        for destination in ["compositions", "queue.c1", "compositions.c1.x", ""] {
            match manager.on_subscribe(&alice(), "s1", destination).await {
                Err(CollabError::InvalidArgument(_)) => {}
                other => panic!("expected InvalidArgument for {destination:?}, got {other:?}"),
            }
        }
        assert!(manager.registry().topics().await.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_announces_and_snapshots() {
        let manager = manager();
        let router = router(&manager);
        let mut topic_rx = router.subscribe_topic("c1").await;
        let mut bob_rx = router.register_session("u2", "s2").await;

        manager
            .on_subscribe(&alice(), "s1", "compositions.c1")
            .await
            .unwrap();
        let notice = next_presence(&mut topic_rx).await;
        assert_eq!(notice.order_type, PresenceNoticeKind::MemberJoined);
        assert_eq!(notice.id, "u1");

        manager
            .on_subscribe(&bob(), "s2", "compositions.c1")
            .await
            .unwrap();
        let notice = next_presence(&mut topic_rx).await;
        assert_eq!(notice.order_type, PresenceNoticeKind::MemberJoined);
        assert_eq!(notice.id, "u2");

        // Bob's private snapshot lists both connected users.
        let raw = bob_rx.recv().await.unwrap();
        match ServerFrame::decode(&raw).unwrap() {
            ServerFrame::Members(members) => {
                assert_eq!(members.composition_id, "c1");
                assert_eq!(members.order_type, PresenceNoticeKind::ConnectedMembers);
                let ids: Vec<&str> = members.users.iter().map(|u| u.id.as_str()).collect();
                assert_eq!(ids, vec!["u1", "u2"]);
            }
            other => panic!("expected members snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_announces_member_left() {
        let manager = manager();
        let router = router(&manager);
        let mut topic_rx = router.subscribe_topic("c1").await;

        manager
            .on_subscribe(&alice(), "s1", "compositions.c1")
            .await
            .unwrap();
        next_presence(&mut topic_rx).await;

        let departure = manager.on_unsubscribe(&alice(), "s1").await.unwrap();
        assert_eq!(departure.topic, "compositions.c1");
        assert!(departure.last_of_user);
        let notice = next_presence(&mut topic_rx).await;
        assert_eq!(notice.order_type, PresenceNoticeKind::MemberLeft);
        assert_eq!(notice.id, "u1");

        assert!(manager.on_unsubscribe(&alice(), "s1").await.is_none());
    }

    #[tokio::test]
    async fn test_two_tab_disconnect_keeps_user_present() {
        let manager = manager();
        let router = router(&manager);
        let mut topic_rx = router.subscribe_topic("c1").await;

        // Same user in two tabs.
        manager
            .on_subscribe(&alice(), "s1", "compositions.c1")
            .await
            .unwrap();
        manager
            .on_subscribe(&alice(), "s2", "compositions.c1")
            .await
            .unwrap();
        next_presence(&mut topic_rx).await;
        next_presence(&mut topic_rx).await;

        // First tab closes: no member-left, user still present.
        let departures = manager.on_disconnect(&alice(), "s1").await;
        assert_eq!(departures.len(), 1);
        assert!(!departures[0].last_of_user);
        assert!(topic_rx.try_recv().is_err());
        assert_eq!(
            manager.registry().snapshot("compositions.c1").await.len(),
            1
        );

        // Second tab closes: now the user is gone and announced as such.
        let departures = manager.on_disconnect(&alice(), "s2").await;
        assert!(departures[0].last_of_user);
        let notice = next_presence(&mut topic_rx).await;
        assert_eq!(notice.order_type, PresenceNoticeKind::MemberLeft);
        assert_eq!(manager.registry().topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_spans_all_topics() {
        let manager = manager();
        let router = router(&manager);
        let mut rx1 = router.subscribe_topic("c1").await;
        let mut rx2 = router.subscribe_topic("c2").await;

        manager
            .on_subscribe(&alice(), "s1", "compositions.c1")
            .await
            .unwrap();
        manager
            .on_subscribe(&alice(), "s1", "compositions.c2")
            .await
            .unwrap();
        next_presence(&mut rx1).await;
        next_presence(&mut rx2).await;

        let departures = manager.on_disconnect(&alice(), "s1").await;
        assert_eq!(departures.len(), 2);
        assert_eq!(next_presence(&mut rx1).await.order_type, PresenceNoticeKind::MemberLeft);
        assert_eq!(next_presence(&mut rx2).await.order_type, PresenceNoticeKind::MemberLeft);
    }
}
