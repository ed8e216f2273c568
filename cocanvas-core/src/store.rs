//! Composition store: atomic, conditional, field-granular mutations.
//!
//! The backing store is an external collaborator reached through
//! [`CompositionStore`]. Every mutation is individually atomic (a single
//! conditional update); multiple calls are never wrapped in a larger
//! transaction. A naive "rows modified" counter cannot tell a missing
//! target from an unchanged value, so implementations follow the
//! exists-then-update pattern: on zero effect, a secondary existence check
//! decides between [`MutationOutcome::NoOp`] and [`MutationOutcome::NotFound`].
//! Existence can change between the update and the check; the worst outcome
//! of that race is a misclassified error kind, never data corruption. This
//! is an accepted relaxation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{validate_title, Composition, CompositionElement, ValidationError};

/// Three-valued result of a conditional mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Target existed and at least one field changed.
    Applied,
    /// Target existed, values were already equal. Not an error.
    NoOp,
    /// Composition (or nested element) absent.
    NotFound,
}

impl MutationOutcome {
    pub fn is_applied(self) -> bool {
        self == MutationOutcome::Applied
    }

    pub fn is_found(self) -> bool {
        self != MutationOutcome::NotFound
    }
}

/// Store-level failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Atomic conditional-update operations over the composition collection.
///
/// Mutations are never partially applied: each call either fully applies
/// the described change or leaves the document unchanged.
#[async_trait]
pub trait CompositionStore: Send + Sync {
    /// Create a composition with a generated id. Title is validated.
    async fn create_composition(
        &self,
        title: &str,
        collaborative: bool,
        owner_id: &str,
    ) -> Result<Composition, StoreError>;

    /// Plain read, no side effect.
    async fn find_composition(&self, compo_id: &str) -> Result<Option<Composition>, StoreError>;

    /// Read for a given user, enrolling the user as a guest first when they
    /// are neither owner nor guest yet.
    async fn get_composition(
        &self,
        compo_id: &str,
        user_id: &str,
    ) -> Result<Option<Composition>, StoreError>;

    async fn exists(&self, compo_id: &str) -> Result<bool, StoreError>;

    async fn exists_element(
        &self,
        compo_id: &str,
        element_id: &str,
    ) -> Result<bool, StoreError>;

    /// Insert an element, allocating an id (retry-until-unique) when the
    /// caller did not supply one. Duplicate caller-supplied ids are accepted
    /// permissively; callers needing strict uniqueness must pre-check with
    /// [`CompositionStore::exists_element`]. Returns `None` when the
    /// composition is absent, otherwise the element as stored.
    async fn add_element(
        &self,
        compo_id: &str,
        element: CompositionElement,
    ) -> Result<Option<CompositionElement>, StoreError>;

    /// Replace all fields of the element matching `element.id`. Replacing
    /// with identical values still reports `Applied`: a full replacement is
    /// assumed to always be a logical change request.
    async fn update_element(
        &self,
        compo_id: &str,
        element: CompositionElement,
    ) -> Result<MutationOutcome, StoreError>;

    /// Update only the coordinates of one element. Highest-frequency
    /// mutation (drags); touches nothing but the two coordinate fields.
    async fn update_element_position(
        &self,
        compo_id: &str,
        element_id: &str,
        x: f64,
        y: f64,
    ) -> Result<MutationOutcome, StoreError>;

    async fn delete_element(
        &self,
        compo_id: &str,
        element_id: &str,
    ) -> Result<MutationOutcome, StoreError>;

    async fn set_title(&self, compo_id: &str, title: &str) -> Result<MutationOutcome, StoreError>;

    async fn set_collaborative(
        &self,
        compo_id: &str,
        collaborative: bool,
    ) -> Result<MutationOutcome, StoreError>;

    /// Idempotent set-add; adding an existing guest (or the owner) is a NoOp.
    async fn add_guest(&self, compo_id: &str, user_id: &str)
        -> Result<MutationOutcome, StoreError>;

    async fn delete_composition(&self, compo_id: &str) -> Result<MutationOutcome, StoreError>;

    /// Bulk delete of every composition owned by the user. Returns the count.
    async fn delete_all_owned_by(&self, user_id: &str) -> Result<u64, StoreError>;
}

/// In-memory reference store.
///
/// Outer map locates compositions; each composition sits behind its own
/// lock so concurrent mutations of unrelated compositions never serialize.
/// The conditional-update helpers mirror the modified-count feedback of a
/// document database, and the trait methods layer the secondary existence
/// check on top.
#[derive(Default)]
pub struct MemoryCompositionStore {
    compositions: RwLock<HashMap<String, Arc<RwLock<Composition>>>>,
}

impl MemoryCompositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, compo_id: &str) -> Option<Arc<RwLock<Composition>>> {
        self.compositions.read().await.get(compo_id).cloned()
    }

    /// `$set {title}` — modified count.
    async fn find_and_set_title_by_id(&self, compo_id: &str, title: &str) -> u64 {
        let Some(entry) = self.entry(compo_id).await else {
            return 0;
        };
        let mut compo = entry.write().await;
        if compo.title == title {
            return 0;
        }
        compo.title = title.to_string();
        compo.touch();
        1
    }

    /// `$set {collaborative}` — modified count.
    async fn find_and_set_collaborative_by_id(&self, compo_id: &str, collaborative: bool) -> u64 {
        let Some(entry) = self.entry(compo_id).await else {
            return 0;
        };
        let mut compo = entry.write().await;
        if compo.collaborative == collaborative {
            return 0;
        }
        compo.collaborative = collaborative;
        compo.touch();
        1
    }

    /// `$addToSet {guests}` — modified count.
    async fn find_and_push_guest_by_id(&self, compo_id: &str, user_id: &str) -> u64 {
        let Some(entry) = self.entry(compo_id).await else {
            return 0;
        };
        let mut compo = entry.write().await;
        if compo.add_guest(user_id) {
            compo.touch();
            1
        } else {
            0
        }
    }

    /// `$push {elements}` — modified count. Does not assert id uniqueness.
    async fn find_and_push_element_by_id(
        &self,
        compo_id: &str,
        element: CompositionElement,
    ) -> u64 {
        let Some(entry) = self.entry(compo_id).await else {
            return 0;
        };
        let mut compo = entry.write().await;
        compo.elements.push(element);
        compo.touch();
        1
    }

    /// Positional `$set {elements.$}` — modified count.
    async fn find_and_set_element_by_id(&self, compo_id: &str, element: &CompositionElement) -> u64 {
        let Some(entry) = self.entry(compo_id).await else {
            return 0;
        };
        let mut compo = entry.write().await;
        let Some(existing) = compo.element_mut(&element.id) else {
            return 0;
        };
        if existing == element {
            return 0;
        }
        *existing = element.clone();
        compo.touch();
        1
    }

    /// Positional `$set {elements.$.x, elements.$.y}` — modified count.
    async fn find_and_set_element_position_by_id(
        &self,
        compo_id: &str,
        element_id: &str,
        x: f64,
        y: f64,
    ) -> u64 {
        let Some(entry) = self.entry(compo_id).await else {
            return 0;
        };
        let mut compo = entry.write().await;
        let Some(element) = compo.element_mut(element_id) else {
            return 0;
        };
        if element.x == x && element.y == y {
            return 0;
        }
        element.x = x;
        element.y = y;
        compo.touch();
        1
    }

    /// `$pull {elements: {id}}` — modified count.
    async fn find_and_pull_element_by_id(&self, compo_id: &str, element_id: &str) -> u64 {
        let Some(entry) = self.entry(compo_id).await else {
            return 0;
        };
        let mut compo = entry.write().await;
        let before = compo.elements.len();
        compo.elements.retain(|e| e.id != element_id);
        if compo.elements.len() < before {
            compo.touch();
            1
        } else {
            0
        }
    }
}

#[async_trait]
impl CompositionStore for MemoryCompositionStore {
    async fn create_composition(
        &self,
        title: &str,
        collaborative: bool,
        owner_id: &str,
    ) -> Result<Composition, StoreError> {
        validate_title(title)?;
        let compo = Composition::new(title, collaborative, owner_id);
        self.compositions
            .write()
            .await
            .insert(compo.id.clone(), Arc::new(RwLock::new(compo.clone())));
        Ok(compo)
    }

    async fn find_composition(&self, compo_id: &str) -> Result<Option<Composition>, StoreError> {
        match self.entry(compo_id).await {
            Some(entry) => Ok(Some(entry.read().await.clone())),
            None => Ok(None),
        }
    }

    async fn get_composition(
        &self,
        compo_id: &str,
        user_id: &str,
    ) -> Result<Option<Composition>, StoreError> {
        let Some(entry) = self.entry(compo_id).await else {
            return Ok(None);
        };
        let mut compo = entry.write().await;
        if !compo.is_owner_or_guest(user_id) && compo.add_guest(user_id) {
            compo.touch();
            log::debug!("user {user_id} enrolled as guest of composition {compo_id}");
        }
        Ok(Some(compo.clone()))
    }

    async fn exists(&self, compo_id: &str) -> Result<bool, StoreError> {
        Ok(self.compositions.read().await.contains_key(compo_id))
    }

    async fn exists_element(
        &self,
        compo_id: &str,
        element_id: &str,
    ) -> Result<bool, StoreError> {
        match self.entry(compo_id).await {
            Some(entry) => Ok(entry.read().await.has_element(element_id)),
            None => Ok(false),
        }
    }

    async fn add_element(
        &self,
        compo_id: &str,
        mut element: CompositionElement,
    ) -> Result<Option<CompositionElement>, StoreError> {
        element.validate(true)?;
        element.coerce_extra();
        if element.id.is_empty() {
            loop {
                let candidate = Uuid::new_v4().to_string();
                if !self.exists_element(compo_id, &candidate).await? {
                    element.id = candidate;
                    break;
                }
            }
        }
        let res = self
            .find_and_push_element_by_id(compo_id, element.clone())
            .await;
        if res < 1 {
            return Ok(None);
        }
        Ok(Some(element))
    }

    async fn update_element(
        &self,
        compo_id: &str,
        mut element: CompositionElement,
    ) -> Result<MutationOutcome, StoreError> {
        element.validate(false)?;
        element.coerce_extra();
        let res = self.find_and_set_element_by_id(compo_id, &element).await;
        if res < 1 {
            // Distinguish missing target from an identical replacement.
            if self.exists_element(compo_id, &element.id).await? {
                return Ok(MutationOutcome::Applied);
            }
            return Ok(MutationOutcome::NotFound);
        }
        Ok(MutationOutcome::Applied)
    }

    async fn update_element_position(
        &self,
        compo_id: &str,
        element_id: &str,
        x: f64,
        y: f64,
    ) -> Result<MutationOutcome, StoreError> {
        let res = self
            .find_and_set_element_position_by_id(compo_id, element_id, x, y)
            .await;
        if res < 1 {
            if self.exists_element(compo_id, element_id).await? {
                return Ok(MutationOutcome::NoOp);
            }
            return Ok(MutationOutcome::NotFound);
        }
        Ok(MutationOutcome::Applied)
    }

    async fn delete_element(
        &self,
        compo_id: &str,
        element_id: &str,
    ) -> Result<MutationOutcome, StoreError> {
        let res = self.find_and_pull_element_by_id(compo_id, element_id).await;
        if res < 1 {
            return Ok(MutationOutcome::NotFound);
        }
        Ok(MutationOutcome::Applied)
    }

    async fn set_title(&self, compo_id: &str, title: &str) -> Result<MutationOutcome, StoreError> {
        validate_title(title)?;
        let res = self.find_and_set_title_by_id(compo_id, title).await;
        if res < 1 {
            if self.exists(compo_id).await? {
                return Ok(MutationOutcome::NoOp);
            }
            return Ok(MutationOutcome::NotFound);
        }
        Ok(MutationOutcome::Applied)
    }

    async fn set_collaborative(
        &self,
        compo_id: &str,
        collaborative: bool,
    ) -> Result<MutationOutcome, StoreError> {
        let res = self
            .find_and_set_collaborative_by_id(compo_id, collaborative)
            .await;
        if res < 1 {
            if self.exists(compo_id).await? {
                return Ok(MutationOutcome::NoOp);
            }
            return Ok(MutationOutcome::NotFound);
        }
        Ok(MutationOutcome::Applied)
    }

    async fn add_guest(
        &self,
        compo_id: &str,
        user_id: &str,
    ) -> Result<MutationOutcome, StoreError> {
        let res = self.find_and_push_guest_by_id(compo_id, user_id).await;
        if res < 1 {
            if self.exists(compo_id).await? {
                return Ok(MutationOutcome::NoOp);
            }
            return Ok(MutationOutcome::NotFound);
        }
        Ok(MutationOutcome::Applied)
    }

    async fn delete_composition(&self, compo_id: &str) -> Result<MutationOutcome, StoreError> {
        let removed = self.compositions.write().await.remove(compo_id);
        match removed {
            Some(_) => Ok(MutationOutcome::Applied),
            None => Ok(MutationOutcome::NotFound),
        }
    }

    async fn delete_all_owned_by(&self, user_id: &str) -> Result<u64, StoreError> {
        let mut compositions = self.compositions.write().await;
        let owned: Vec<String> = {
            let mut ids = Vec::new();
            for (id, entry) in compositions.iter() {
                if entry.read().await.owner_id == user_id {
                    ids.push(id.clone());
                }
            }
            ids
        };
        for id in &owned {
            compositions.remove(id);
        }
        Ok(owned.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_store() -> (MemoryCompositionStore, String) {
        let store = MemoryCompositionStore::new();
        let compo = store
            .create_composition("Test composition", false, "u1")
            .await
            .unwrap();
        let el = CompositionElement::new("e1", "rect", 10.0, 10.0);
        store.add_element(&compo.id, el).await.unwrap().unwrap();
        (store, compo.id)
    }

    #[tokio::test]
    async fn test_create_rejects_bad_title() {
        let store = MemoryCompositionStore::new();
        assert!(store.create_composition("ab", false, "u1").await.is_err());
        assert!(store.create_composition("    ", false, "u1").await.is_err());
    }

    #[tokio::test]
    async fn test_position_applied_then_noop() {
        let (store, compo_id) = seeded_store().await;

        let first = store
            .update_element_position(&compo_id, "e1", 50.0, 60.0)
            .await
            .unwrap();
        assert_eq!(first, MutationOutcome::Applied);
        let compo = store.find_composition(&compo_id).await.unwrap().unwrap();
        let el = compo.element("e1").unwrap();
        assert_eq!((el.x, el.y), (50.0, 60.0));

        let second = store
            .update_element_position(&compo_id, "e1", 50.0, 60.0)
            .await
            .unwrap();
        assert_eq!(second, MutationOutcome::NoOp);
        let compo = store.find_composition(&compo_id).await.unwrap().unwrap();
        assert_eq!(compo.element("e1").unwrap().x, 50.0);
    }

    #[tokio::test]
    async fn test_position_not_found() {
        let (store, compo_id) = seeded_store().await;
        let missing_el = store
            .update_element_position(&compo_id, "missing", 1.0, 2.0)
            .await
            .unwrap();
        assert_eq!(missing_el, MutationOutcome::NotFound);
        let missing_compo = store
            .update_element_position("nope", "e1", 1.0, 2.0)
            .await
            .unwrap();
        assert_eq!(missing_compo, MutationOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_delete_element_missing_is_not_found() {
        let (store, compo_id) = seeded_store().await;
        let outcome = store.delete_element(&compo_id, "missing").await.unwrap();
        assert_eq!(outcome, MutationOutcome::NotFound);
        let outcome = store.delete_element(&compo_id, "e1").await.unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        assert!(!store.exists_element(&compo_id, "e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_element_allocates_unique_id() {
        let (store, compo_id) = seeded_store().await;
        let el = CompositionElement::new("", "text", 0.0, 0.0);
        let stored = store.add_element(&compo_id, el).await.unwrap().unwrap();
        assert!(!stored.id.is_empty());
        assert!(store.exists_element(&compo_id, &stored.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_element_missing_composition() {
        let store = MemoryCompositionStore::new();
        let el = CompositionElement::new("e-99", "rect", 0.0, 0.0);
        assert!(store.add_element("nope", el).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_element_permissive_duplicate_id() {
        let (store, compo_id) = seeded_store().await;
        let dup = CompositionElement::new("e1", "rect", 5.0, 5.0);
        // Accepted; strict callers must pre-check with exists_element.
        assert!(store.add_element(&compo_id, dup).await.unwrap().is_some());
        let compo = store.find_composition(&compo_id).await.unwrap().unwrap();
        assert_eq!(compo.elements.iter().filter(|e| e.id == "e1").count(), 2);
    }

    #[tokio::test]
    async fn test_update_element_full_replace() {
        let (store, compo_id) = seeded_store().await;
        let mut el = CompositionElement::new("e1", "text", 99.0, 98.0);
        el.style = Some("bold".into());
        let outcome = store.update_element(&compo_id, el.clone()).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Applied);
        let compo = store.find_composition(&compo_id).await.unwrap().unwrap();
        assert_eq!(compo.element("e1").unwrap(), &el);
        let stamped_at = compo.updated_at;

        // Identical replacement still reports Applied (full-replace echo)
        // but leaves the document, including its last-write marker, alone.
        let again = store.update_element(&compo_id, el).await.unwrap();
        assert_eq!(again, MutationOutcome::Applied);
        let compo = store.find_composition(&compo_id).await.unwrap().unwrap();
        assert_eq!(compo.updated_at, stamped_at);

        let missing = CompositionElement::new("gone", "rect", 0.0, 0.0);
        let outcome = store.update_element(&compo_id, missing).await.unwrap();
        assert_eq!(outcome, MutationOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_set_title_noop_vs_not_found() {
        let (store, compo_id) = seeded_store().await;
        assert_eq!(
            store.set_title(&compo_id, "Renamed composition").await.unwrap(),
            MutationOutcome::Applied
        );
        assert_eq!(
            store.set_title(&compo_id, "Renamed composition").await.unwrap(),
            MutationOutcome::NoOp
        );
        assert_eq!(
            store.set_title("nope", "Renamed composition").await.unwrap(),
            MutationOutcome::NotFound
        );
        assert!(store.set_title(&compo_id, "ab").await.is_err());
    }

    #[tokio::test]
    async fn test_set_collaborative_transitions() {
        let (store, compo_id) = seeded_store().await;
        assert_eq!(
            store.set_collaborative(&compo_id, true).await.unwrap(),
            MutationOutcome::Applied
        );
        assert_eq!(
            store.set_collaborative(&compo_id, true).await.unwrap(),
            MutationOutcome::NoOp
        );
        assert_eq!(
            store.set_collaborative("nope", true).await.unwrap(),
            MutationOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_add_guest_idempotent() {
        let (store, compo_id) = seeded_store().await;
        assert_eq!(
            store.add_guest(&compo_id, "u2").await.unwrap(),
            MutationOutcome::Applied
        );
        assert_eq!(
            store.add_guest(&compo_id, "u2").await.unwrap(),
            MutationOutcome::NoOp
        );
        // Owner is never enrolled as guest.
        assert_eq!(
            store.add_guest(&compo_id, "u1").await.unwrap(),
            MutationOutcome::NoOp
        );
        assert_eq!(
            store.add_guest("nope", "u2").await.unwrap(),
            MutationOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_get_composition_enrolls_reader() {
        let (store, compo_id) = seeded_store().await;
        let compo = store.get_composition(&compo_id, "u3").await.unwrap().unwrap();
        assert!(compo.guest_ids.contains(&"u3".to_string()));
        // Owner read does not enroll.
        let compo = store.get_composition(&compo_id, "u1").await.unwrap().unwrap();
        assert!(!compo.guest_ids.contains(&"u1".to_string()));
    }

    #[tokio::test]
    async fn test_delete_composition_and_bulk() {
        let store = MemoryCompositionStore::new();
        let a = store
            .create_composition("Composition A", false, "u1")
            .await
            .unwrap();
        let _b = store
            .create_composition("Composition B", false, "u1")
            .await
            .unwrap();
        let c = store
            .create_composition("Composition C", false, "u2")
            .await
            .unwrap();

        assert_eq!(
            store.delete_composition(&a.id).await.unwrap(),
            MutationOutcome::Applied
        );
        assert_eq!(
            store.delete_composition(&a.id).await.unwrap(),
            MutationOutcome::NotFound
        );

        assert_eq!(store.delete_all_owned_by("u1").await.unwrap(), 1);
        assert_eq!(store.delete_all_owned_by("u1").await.unwrap(), 0);
        assert!(store.exists(&c.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_position_updates_never_interleave() {
        let (store, compo_id) = seeded_store().await;
        let store = Arc::new(store);

        // Each writer submits a coherent (x, y) pair where y == 2x.
        let mut handles = Vec::new();
        for i in 0..64i64 {
            let store = store.clone();
            let compo_id = compo_id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_element_position(&compo_id, "e1", i as f64, (i * 2) as f64)
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let compo = store.find_composition(&compo_id).await.unwrap().unwrap();
        let el = compo.element("e1").unwrap();
        assert_eq!(el.y, el.x * 2.0, "coordinates from different writers interleaved");
    }
}
