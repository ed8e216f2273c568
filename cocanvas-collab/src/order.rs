//! Collaboration order wire protocol (JSON).
//!
//! An order is a mutation intent scoped to one composition. The wire form
//! is a JSON object discriminated by `orderType`; empty or unknown fields
//! are omitted rather than sent as null. `compositionId`, `authorEmail`
//! and `orderDatetime` are server-stamped: whatever a client supplies for
//! them is overwritten before dispatch.

use chrono::{DateTime, Utc};
use cocanvas_core::model::CompositionElement;
use serde::{Deserialize, Serialize};

use crate::error::{CollabError, CollabResult};

/// Server-stamped fields common to every order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub composition_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_datetime: Option<DateTime<Utc>>,
}

/// Closed union of mutation intents, discriminated by `orderType`.
///
/// An unhandled variant is a compile error at every match site; an unknown
/// tag on the wire is rejected at decode time as an invalid argument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "orderType")]
pub enum Order {
    #[serde(rename = "compositiontitleChanged")]
    TitleChanged {
        #[serde(flatten)]
        meta: OrderMeta,
        title: String,
    },
    #[serde(rename = "compositionCollaborativeChanged")]
    CollaborativeChanged {
        #[serde(flatten)]
        meta: OrderMeta,
        collaborative: bool,
    },
    #[serde(rename = "compositionDeleted")]
    CompositionDeleted {
        #[serde(flatten)]
        meta: OrderMeta,
    },
    #[serde(rename = "elementAdded")]
    ElementAdded {
        #[serde(flatten)]
        meta: OrderMeta,
        element: CompositionElement,
    },
    #[serde(rename = "elementChanged")]
    ElementChanged {
        #[serde(flatten)]
        meta: OrderMeta,
        element: CompositionElement,
    },
    #[serde(rename = "elementPositionChanged")]
    #[serde(rename_all = "camelCase")]
    ElementPositionChanged {
        #[serde(flatten)]
        meta: OrderMeta,
        element_id: String,
        x: f64,
        y: f64,
    },
    #[serde(rename = "elementDeleted")]
    #[serde(rename_all = "camelCase")]
    ElementDeleted {
        #[serde(flatten)]
        meta: OrderMeta,
        element_id: String,
    },
}

impl Order {
    /// The wire discriminator for this order.
    pub fn order_type(&self) -> &'static str {
        match self {
            Order::TitleChanged { .. } => "compositiontitleChanged",
            Order::CollaborativeChanged { .. } => "compositionCollaborativeChanged",
            Order::CompositionDeleted { .. } => "compositionDeleted",
            Order::ElementAdded { .. } => "elementAdded",
            Order::ElementChanged { .. } => "elementChanged",
            Order::ElementPositionChanged { .. } => "elementPositionChanged",
            Order::ElementDeleted { .. } => "elementDeleted",
        }
    }

    pub fn meta(&self) -> &OrderMeta {
        match self {
            Order::TitleChanged { meta, .. }
            | Order::CollaborativeChanged { meta, .. }
            | Order::CompositionDeleted { meta }
            | Order::ElementAdded { meta, .. }
            | Order::ElementChanged { meta, .. }
            | Order::ElementPositionChanged { meta, .. }
            | Order::ElementDeleted { meta, .. } => meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut OrderMeta {
        match self {
            Order::TitleChanged { meta, .. }
            | Order::CollaborativeChanged { meta, .. }
            | Order::CompositionDeleted { meta }
            | Order::ElementAdded { meta, .. }
            | Order::ElementChanged { meta, .. }
            | Order::ElementPositionChanged { meta, .. }
            | Order::ElementDeleted { meta, .. } => meta,
        }
    }

    pub fn composition_id(&self) -> &str {
        &self.meta().composition_id
    }

    pub fn author_email(&self) -> Option<&str> {
        self.meta().author_email.as_deref()
    }

    /// Overwrite the server-trusted fields, ignoring client-supplied values.
    pub fn stamp(&mut self, composition_id: &str, author_email: Option<&str>) {
        let meta = self.meta_mut();
        meta.composition_id = composition_id.to_string();
        meta.author_email = author_email.map(str::to_string);
        meta.order_datetime = Some(Utc::now());
    }

    pub fn encode(&self) -> CollabResult<String> {
        serde_json::to_string(self).map_err(|e| CollabError::Delivery(e.to_string()))
    }

    pub fn decode(raw: &str) -> CollabResult<Order> {
        serde_json::from_str(raw).map_err(|e| CollabError::InvalidArgument(e.to_string()))
    }
}

/// Presence notice kinds, serialized with the original wire casing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceNoticeKind {
    MemberJoined,
    MemberLeft,
    ConnectedMembers,
}

/// Join/leave notice broadcast on a composition's shared channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub email: String,
    pub id: String,
    pub order_type: PresenceNoticeKind,
}

impl PresenceNotice {
    pub fn joined(email: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            id: user_id.into(),
            order_type: PresenceNoticeKind::MemberJoined,
        }
    }

    pub fn left(email: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            id: user_id.into(),
            order_type: PresenceNoticeKind::MemberLeft,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedUser {
    pub email: String,
    pub id: String,
}

/// Point-to-point snapshot of who is connected, sent to a joining client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedMembersNotice {
    pub composition_id: String,
    pub users: Vec<ConnectedUser>,
    pub order_type: PresenceNoticeKind,
}

impl ConnectedMembersNotice {
    pub fn new(composition_id: impl Into<String>, users: Vec<ConnectedUser>) -> Self {
        Self {
            composition_id: composition_id.into(),
            users,
            order_type: PresenceNoticeKind::ConnectedMembers,
        }
    }
}

/// Anything the server pushes over a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerFrame {
    Order(Order),
    Members(ConnectedMembersNotice),
    Presence(PresenceNotice),
}

impl ServerFrame {
    pub fn encode(&self) -> CollabResult<String> {
        serde_json::to_string(self).map_err(|e| CollabError::Delivery(e.to_string()))
    }

    pub fn decode(raw: &str) -> CollabResult<ServerFrame> {
        serde_json::from_str(raw).map_err(|e| CollabError::InvalidArgument(e.to_string()))
    }
}
