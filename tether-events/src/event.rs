use chrono::Utc;
use serde::{Deserialize, Serialize};
use tether_core::{EntityId, EntityKind, Timestamp};

/// Event type discriminator used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Updated,
    Deleted,
}

/// Lifecycle event published by a synchronization context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityEvent {
    /// Fields of an entity changed through a merge.
    Updated {
        kind: EntityKind,
        id: EntityId,
        /// Property names, not wire keys.
        changed_fields: Vec<String>,
        occurred_at: Timestamp,
    },
    /// An entity was deleted remotely. Terminal.
    Deleted {
        kind: EntityKind,
        id: EntityId,
        occurred_at: Timestamp,
    },
}

impl EntityEvent {
    pub fn updated(kind: EntityKind, id: EntityId, changed_fields: Vec<String>) -> Self {
        Self::Updated {
            kind,
            id,
            changed_fields,
            occurred_at: Utc::now(),
        }
    }

    pub fn deleted(kind: EntityKind, id: EntityId) -> Self {
        Self::Deleted {
            kind,
            id,
            occurred_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Updated { kind, .. } | Self::Deleted { kind, .. } => *kind,
        }
    }

    pub fn id(&self) -> &EntityId {
        match self {
            Self::Updated { id, .. } | Self::Deleted { id, .. } => id,
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::Updated { .. } => EventType::Updated,
            Self::Deleted { .. } => EventType::Deleted,
        }
    }

    /// Changed property names, empty for deletions.
    pub fn changed_fields(&self) -> &[String] {
        match self {
            Self::Updated { changed_fields, .. } => changed_fields,
            Self::Deleted { .. } => &[],
        }
    }
}

/// Selects which events a handler receives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFilter {
    kind: Option<EntityKind>,
    event_type: Option<EventType>,
}

impl EventFilter {
    /// Matches every event.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_kind(kind: EntityKind) -> Self {
        Self {
            kind: Some(kind),
            event_type: None,
        }
    }

    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn matches(&self, event: &EntityEvent) -> bool {
        self.kind.map_or(true, |k| k == event.kind())
            && self.event_type.map_or(true, |t| t == event.event_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matching() {
        let updated = EntityEvent::updated(
            EntityKind::Card,
            EntityId::from("c1"),
            vec!["Name".to_string()],
        );
        let deleted = EntityEvent::deleted(EntityKind::List, EntityId::from("l1"));

        assert!(EventFilter::any().matches(&updated));
        assert!(EventFilter::for_kind(EntityKind::Card).matches(&updated));
        assert!(!EventFilter::for_kind(EntityKind::Card).matches(&deleted));

        let deletions = EventFilter::any().with_event_type(EventType::Deleted);
        assert!(deletions.matches(&deleted));
        assert!(!deletions.matches(&updated));

        let card_deletions = deletions.with_kind(EntityKind::Card);
        assert!(!card_deletions.matches(&deleted));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = EntityEvent::deleted(EntityKind::CheckItem, EntityId::from("i1"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deleted");
        assert_eq!(json["kind"], "check_item");
        assert_eq!(json["id"], "i1");
        assert!(event.changed_fields().is_empty());
    }
}
