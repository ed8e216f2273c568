//! Composition aggregate model.
//!
//! A composition is a titled document owned by exactly one user, holding an
//! unordered set of positioned elements (unique by element id) and a set of
//! guest users. Guests may grow over time and never implicitly shrink;
//! the owner is never a member of the guest set.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Title length bounds, inclusive.
pub const TITLE_MIN_LEN: usize = 5;
pub const TITLE_MAX_LEN: usize = 150;

/// Longest accepted element id.
pub const ELEMENT_ID_MAX_LEN: usize = 50;

/// A field-level validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Validate a composition title: non-blank, 5–150 chars.
pub fn validate_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::new("title", "must not be blank"));
    }
    let len = title.chars().count();
    if !(TITLE_MIN_LEN..=TITLE_MAX_LEN).contains(&len) {
        return Err(ValidationError::new(
            "title",
            format!("length {len} outside {TITLE_MIN_LEN}..={TITLE_MAX_LEN}"),
        ));
    }
    Ok(())
}

/// Validate an element id: non-empty, at most 50 chars, drawn from
/// word/dash/hash characters.
pub fn validate_element_id(id: &str) -> Result<(), ValidationError> {
    let len = id.chars().count();
    if len == 0 || len > ELEMENT_ID_MAX_LEN {
        return Err(ValidationError::new(
            "element.id",
            format!("length {len} outside 1..={ELEMENT_ID_MAX_LEN}"),
        ));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_alphanumeric() || *c == '_' || *c == '-' || *c == '#'))
    {
        return Err(ValidationError::new(
            "element.id",
            format!("character {c:?} not in [-\\w#]"),
        ));
    }
    Ok(())
}

/// A typed, positioned element inside a composition.
///
/// `extra` captures any additional string-keyed wire fields. Only scalar
/// values (string / number / boolean / null) are stored as-is; nested
/// values are coerced to their string representation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompositionElement {
    /// Stable identifier, unique within the parent composition.
    /// Client- or server-generated.
    pub id: String,
    /// Non-blank type tag, e.g. "rect" or "text".
    pub element_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    pub x: f64,
    pub y: f64,
    /// Open bag of extra scalar properties.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CompositionElement {
    pub fn new(id: impl Into<String>, element_type: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            id: id.into(),
            element_type: element_type.into(),
            style: None,
            x,
            y,
            extra: BTreeMap::new(),
        }
    }

    /// Coerce non-scalar extra values to their string representation.
    pub fn coerce_extra(&mut self) {
        for value in self.extra.values_mut() {
            if !matches!(
                value,
                Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
            ) {
                *value = Value::String(value.to_string());
            }
        }
    }

    /// Validate id and type tag. The id may be empty when the caller expects
    /// the store to allocate one; use `allow_missing_id` for that path.
    pub fn validate(&self, allow_missing_id: bool) -> Result<(), ValidationError> {
        if !(allow_missing_id && self.id.is_empty()) {
            validate_element_id(&self.id)?;
        }
        if self.element_type.trim().is_empty() {
            return Err(ValidationError::new("element.elementType", "must not be blank"));
        }
        Ok(())
    }
}

/// Aggregate root for a shared composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    pub id: String,
    pub title: String,
    pub collaborative: bool,
    #[serde(default)]
    pub elements: Vec<CompositionElement>,
    pub owner_id: String,
    #[serde(default)]
    pub guest_ids: Vec<String>,
    /// Advisory last-write marker, refreshed whenever a mutation changes
    /// the document. A zero-effect update leaves it untouched.
    pub updated_at: DateTime<Utc>,
}

impl Composition {
    /// Create a fresh composition with a generated id.
    pub fn new(title: impl Into<String>, collaborative: bool, owner_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            collaborative,
            elements: Vec::new(),
            owner_id: owner_id.into(),
            guest_ids: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn element(&self, element_id: &str) -> Option<&CompositionElement> {
        self.elements.iter().find(|e| e.id == element_id)
    }

    pub fn element_mut(&mut self, element_id: &str) -> Option<&mut CompositionElement> {
        self.elements.iter_mut().find(|e| e.id == element_id)
    }

    pub fn has_element(&self, element_id: &str) -> bool {
        self.element(element_id).is_some()
    }

    /// Set-add a guest. Returns true if the set changed. The owner is never
    /// added to the guest set.
    pub fn add_guest(&mut self, user_id: &str) -> bool {
        if user_id == self.owner_id || self.guest_ids.iter().any(|g| g == user_id) {
            return false;
        }
        self.guest_ids.push(user_id.to_string());
        true
    }

    /// Whether the user can read the composition without being enrolled.
    pub fn is_owner_or_guest(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.guest_ids.iter().any(|g| g == user_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_title_validation_bounds() {
        assert!(validate_title("Hello").is_ok());
        assert!(validate_title(&"x".repeat(150)).is_ok());
        assert!(validate_title("Hi").is_err());
        assert!(validate_title(&"x".repeat(151)).is_err());
        assert!(validate_title("     ").is_err());
    }

    #[test]
    fn test_element_id_validation() {
        assert!(validate_element_id("e1").is_ok());
        assert!(validate_element_id("node_42#a").is_ok());
        assert!(validate_element_id("").is_err());
        assert!(validate_element_id(&"a".repeat(51)).is_err());
        assert!(validate_element_id("bad id").is_err()); // space
        assert!(validate_element_id("bad.id").is_err()); // dot
    }

    #[test]
    fn test_element_validate_missing_id() {
        let mut el = CompositionElement::new("", "rect", 0.0, 0.0);
        assert!(el.validate(true).is_ok());
        assert!(el.validate(false).is_err());
        el.element_type = "  ".into();
        assert!(el.validate(true).is_err());
    }

    #[test]
    fn test_extra_coercion_keeps_scalars() {
        let mut el = CompositionElement::new("e-01", "rect", 1.0, 2.0);
        el.extra.insert("label".into(), json!("hello"));
        el.extra.insert("weight".into(), json!(3.5));
        el.extra.insert("visible".into(), json!(true));
        el.extra.insert("note".into(), json!(null));
        el.extra.insert("nested".into(), json!({"a": 1}));
        el.extra.insert("list".into(), json!([1, 2]));
        el.coerce_extra();

        assert_eq!(el.extra["label"], json!("hello"));
        assert_eq!(el.extra["weight"], json!(3.5));
        assert_eq!(el.extra["visible"], json!(true));
        assert_eq!(el.extra["note"], json!(null));
        assert_eq!(el.extra["nested"], json!("{\"a\":1}"));
        assert_eq!(el.extra["list"], json!("[1,2]"));
    }

    #[test]
    fn test_element_wire_shape() {
        let mut el = CompositionElement::new("e-01", "rect", 10.0, 20.0);
        el.extra.insert("fill".into(), json!("#ff0000"));
        let wire = serde_json::to_value(&el).unwrap();

        // style is None — omitted from the wire, extra fields are inlined.
        assert_eq!(
            wire,
            json!({"id": "e-01", "elementType": "rect", "x": 10.0, "y": 20.0, "fill": "#ff0000"})
        );

        let back: CompositionElement = serde_json::from_value(wire).unwrap();
        assert_eq!(back, el);
    }

    #[test]
    fn test_guest_set_semantics() {
        let mut compo = Composition::new("My composition", false, "u1");
        assert!(compo.add_guest("u2"));
        assert!(!compo.add_guest("u2")); // idempotent
        assert!(!compo.add_guest("u1")); // owner never a guest
        assert_eq!(compo.guest_ids, vec!["u2".to_string()]);
        assert!(compo.is_owner_or_guest("u1"));
        assert!(compo.is_owner_or_guest("u2"));
        assert!(!compo.is_owner_or_guest("u3"));
    }

    #[test]
    fn test_new_composition_has_unique_id() {
        let a = Composition::new("Composition A", false, "u1");
        let b = Composition::new("Composition B", false, "u1");
        assert_ne!(a.id, b.id);
        assert!(a.elements.is_empty());
        assert!(a.guest_ids.is_empty());
    }
}
