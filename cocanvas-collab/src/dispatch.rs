//! Order dispatcher: inbound intents become store mutations.
//!
//! One entry point, [`OrderDispatcher::dispatch`]. The caller's identity is
//! resolved at connect time and required here; the order's own identity
//! fields are never trusted and get overwritten before anything else looks
//! at them. A dispatched order that comes back `Ok` is the exact value to
//! fan out: last write wins, so even a no-effect mutation is echoed to keep
//! every replica converging on the same final state.

use std::collections::HashMap;
use std::sync::Arc;

use cocanvas_core::store::{CompositionStore, MutationOutcome};

use crate::error::{CollabError, CollabResult};
use crate::order::Order;

/// Who a connected session is acting as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: String,
    pub email: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
        }
    }
}

/// Maps a connect-time credential to an identity.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<SessionIdentity>;
}

/// Fixed token table. Used by the demos and the integration tests; a real
/// deployment plugs its own resolver in at server construction.
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    identities: HashMap<String, SessionIdentity>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        self.identities
            .insert(token.into(), SessionIdentity::new(user_id, email));
        self
    }
}

impl IdentityResolver for StaticIdentityResolver {
    fn resolve(&self, token: &str) -> Option<SessionIdentity> {
        self.identities.get(token).cloned()
    }
}

/// Applies orders to the store and hands back the stamped order to route.
pub struct OrderDispatcher {
    store: Arc<dyn CompositionStore>,
}

impl OrderDispatcher {
    pub fn new(store: Arc<dyn CompositionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CompositionStore> {
        &self.store
    }

    /// Validate, stamp and apply one inbound order.
    ///
    /// Returns the order as it must be fanned out, with server-stamped
    /// identity fields and, for an added element, the id as stored.
    /// `NotFound` and `InvalidArgument` go back to the author only; the
    /// caller must not broadcast on error.
    pub async fn dispatch(
        &self,
        identity: Option<&SessionIdentity>,
        composition_id: &str,
        mut order: Order,
    ) -> CollabResult<Order> {
        let identity = identity.ok_or_else(|| {
            CollabError::AccessDenied(format!(
                "anonymous session may not send {}",
                order.order_type()
            ))
        })?;
        order.stamp(composition_id, Some(&identity.email));

        match &mut order {
            Order::TitleChanged { title, .. } => {
                let outcome = self.store.set_title(composition_id, title).await?;
                found(outcome, composition_id)?;
            }
            Order::CollaborativeChanged { collaborative, .. } => {
                let outcome = self
                    .store
                    .set_collaborative(composition_id, *collaborative)
                    .await?;
                found(outcome, composition_id)?;
            }
            Order::CompositionDeleted { .. } => {
                // Server-originated only; deletion arrives through the
                // composition API, never as a client order.
                return Err(CollabError::InvalidArgument(
                    "compositionDeleted cannot be sent by a client".into(),
                ));
            }
            Order::ElementAdded { element, .. } => {
                match self.store.add_element(composition_id, element.clone()).await? {
                    Some(stored) => *element = stored,
                    None => {
                        return Err(CollabError::NotFound(format!(
                            "composition {composition_id} not found"
                        )))
                    }
                }
            }
            Order::ElementChanged { element, .. } => {
                let outcome = self
                    .store
                    .update_element(composition_id, element.clone())
                    .await?;
                found(outcome, composition_id)?;
            }
            Order::ElementPositionChanged { element_id, x, y, .. } => {
                let outcome = self
                    .store
                    .update_element_position(composition_id, element_id, *x, *y)
                    .await?;
                found(outcome, composition_id)?;
            }
            Order::ElementDeleted { element_id, .. } => {
                let outcome = self.store.delete_element(composition_id, element_id).await?;
                found(outcome, composition_id)?;
            }
        }

        log::debug!(
            "applied {} on composition {composition_id} for {}",
            order.order_type(),
            identity.email
        );
        Ok(order)
    }
}

fn found(outcome: MutationOutcome, composition_id: &str) -> CollabResult<()> {
    if outcome.is_found() {
        Ok(())
    } else {
        Err(CollabError::NotFound(format!(
            "target absent in composition {composition_id}"
        )))
    }
}
