//! Identity types for tether entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Opaque remote identifier, stable for the lifetime of the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Entity kind discriminator. Part of every cache key and event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Action,
    Attachment,
    Board,
    BoardMembership,
    Card,
    CheckItem,
    CheckList,
    CustomField,
    CustomFieldDefinition,
    DropDownOption,
    Label,
    List,
    Member,
    Notification,
    Organization,
    OrganizationMembership,
    Sticker,
    Token,
    Webhook,
}

impl EntityKind {
    pub const ALL: &'static [EntityKind] = &[
        EntityKind::Action,
        EntityKind::Attachment,
        EntityKind::Board,
        EntityKind::BoardMembership,
        EntityKind::Card,
        EntityKind::CheckItem,
        EntityKind::CheckList,
        EntityKind::CustomField,
        EntityKind::CustomFieldDefinition,
        EntityKind::DropDownOption,
        EntityKind::Label,
        EntityKind::List,
        EntityKind::Member,
        EntityKind::Notification,
        EntityKind::Organization,
        EntityKind::OrganizationMembership,
        EntityKind::Sticker,
        EntityKind::Token,
        EntityKind::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Action => "action",
            EntityKind::Attachment => "attachment",
            EntityKind::Board => "board",
            EntityKind::BoardMembership => "board_membership",
            EntityKind::Card => "card",
            EntityKind::CheckItem => "check_item",
            EntityKind::CheckList => "check_list",
            EntityKind::CustomField => "custom_field",
            EntityKind::CustomFieldDefinition => "custom_field_definition",
            EntityKind::DropDownOption => "drop_down_option",
            EntityKind::Label => "label",
            EntityKind::List => "list",
            EntityKind::Member => "member",
            EntityKind::Notification => "notification",
            EntityKind::Organization => "organization",
            EntityKind::OrganizationMembership => "organization_membership",
            EntityKind::Sticker => "sticker",
            EntityKind::Token => "token",
            EntityKind::Webhook => "webhook",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache key: entity kind plus remote id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
