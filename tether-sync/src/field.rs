//! Typed accessor for one field of an entity.

use crate::cache::ReadMode;
use crate::context::SyncContext;
use crate::rules::RuleChain;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use tether_core::{FieldDescriptor, TetherResult, ValidationError};
use tokio_util::sync::CancellationToken;

/// Typed view over one entry of an entity's document.
///
/// Reads go through the owning context (and so honor the refresh throttle);
/// writes are validated by the field's [`RuleChain`] and then recorded as
/// pending changes.
pub struct Field<T> {
    context: SyncContext,
    descriptor: &'static FieldDescriptor,
    rules: RuleChain<T>,
}

impl<T> Field<T>
where
    T: Serialize + DeserializeOwned + PartialEq,
{
    /// Bind to the field called `name` in the context's descriptor table.
    pub fn new(context: &SyncContext, name: &str) -> TetherResult<Self> {
        let table = &context.descriptor().table;
        let descriptor = table.by_name(name).ok_or_else(|| ValidationError::UnknownField {
            kind: table.kind(),
            field: name.to_string(),
        })?;
        Ok(Self {
            context: context.clone(),
            descriptor,
            rules: RuleChain::new(),
        })
    }

    /// Bind to a descriptor row directly. The row should belong to the
    /// context's table.
    pub fn bound(context: &SyncContext, descriptor: &'static FieldDescriptor) -> Self {
        Self {
            context: context.clone(),
            descriptor,
            rules: RuleChain::new(),
        }
    }

    pub fn with_rules(mut self, rules: RuleChain<T>) -> Self {
        self.rules = rules;
        self
    }

    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn wire_key(&self) -> &'static str {
        self.descriptor.wire_key
    }

    /// Refresh if the local copy is stale, then read.
    pub async fn get(&self, cancel: &CancellationToken) -> TetherResult<Option<T>> {
        self.get_with(ReadMode::Throttled, cancel).await
    }

    pub async fn get_with(&self, mode: ReadMode, cancel: &CancellationToken) -> TetherResult<Option<T>> {
        self.context.read(mode, cancel).await?;
        self.peek()
    }

    /// Read the local value without any I/O.
    pub fn peek(&self) -> TetherResult<Option<T>> {
        self.context.read_field(self.descriptor.wire_key)
    }

    /// Validate and record a local write. Writing the current value is a
    /// no-op; a rejected write leaves the entity untouched. Fails without
    /// validating when the current value cannot be decoded.
    pub fn set(&self, value: impl Into<Option<T>>) -> TetherResult<()> {
        let candidate = value.into();
        let current = self.peek()?;
        if current == candidate {
            return Ok(());
        }

        self.rules
            .validate(self.descriptor.name, current.as_ref(), candidate.as_ref())?;

        let encoded = serde_json::to_value(&candidate).map_err(|e| ValidationError::Unencodable {
            field: self.descriptor.name.to_string(),
            reason: e.to_string(),
        })?;
        self.context.write(self.descriptor.wire_key, encoded)
    }

    /// Whether a local write to this field awaits submission.
    pub fn is_pending(&self) -> bool {
        self.context
            .pending_fields()
            .iter()
            .any(|key| key == self.descriptor.wire_key)
    }
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("entity", self.context.key())
            .field("name", &self.descriptor.name)
            .field("rules", &self.rules)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EntityDescriptor;
    use crate::env::SyncEnv;
    use crate::rules::{NonEmptyString, NotNull, OldValueRequired, PositionRule, Range};
    use crate::test_support::ScriptedTransport;
    use serde_json::json;
    use std::sync::Arc;
    use tether_core::{
        EntityKind, FieldDescriptor, FieldTable, Position, RequestKind, Response, TetherError,
    };

    const FIELDS: &[FieldDescriptor] = &[
        FieldDescriptor::new("Name", "name"),
        FieldDescriptor::new("Position", "pos"),
        FieldDescriptor::new("Badges", "badges"),
    ];

    static CARD: EntityDescriptor = EntityDescriptor {
        table: FieldTable::new(EntityKind::Card, FIELDS),
        refresh: RequestKind::CardReadRefresh,
        update: RequestKind::CardWriteUpdate,
        delete: None,
        refresh_parameters: &[],
    };

    fn context() -> (Arc<ScriptedTransport>, SyncContext) {
        let transport = Arc::new(ScriptedTransport::new());
        let env = SyncEnv::builder(transport.clone()).build().unwrap();
        (transport, SyncContext::new(&env, &CARD, "c1"))
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let (_transport, ctx) = context();
        let err = Field::<String>::new(&ctx, "Nope").unwrap_err();
        assert!(matches!(
            err,
            TetherError::Validation(ValidationError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_rejected_write_leaves_entity_untouched() {
        let (_transport, ctx) = context();
        let name = Field::<String>::new(&ctx, "Name")
            .unwrap()
            .with_rules(RuleChain::new().with(NotNull).with(NonEmptyString));

        let err = name.set(None::<String>).unwrap_err();
        match err {
            TetherError::Validation(e) => assert_eq!(e.violations().len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(name.set("  ".to_string()).is_err());
        assert!(!ctx.is_dirty());
        assert_eq!(name.peek().unwrap(), None);
    }

    #[test]
    fn test_set_records_pending_change() {
        let (_transport, ctx) = context();
        let pos = Field::<Position>::new(&ctx, "Position")
            .unwrap()
            .with_rules(RuleChain::new().with(PositionRule));

        pos.set(Position::Fixed(16384.0)).unwrap();
        assert!(pos.is_pending());
        assert_eq!(ctx.value("pos"), Some(json!(16384.0)));

        pos.set(Position::Top).unwrap();
        assert_eq!(pos.peek().unwrap(), Some(Position::Top));
        assert!(pos.set(Position::Fixed(-1.0)).is_err());
    }

    #[test]
    fn test_setting_current_value_is_noop() {
        let (_transport, ctx) = context();
        let badges = Field::<i64>::new(&ctx, "Badges")
            .unwrap()
            .with_rules(RuleChain::new().with(Range::new(0, 10)));
        ctx.merge(&tether_core::Document::from_value(json!({"badges": 3})).unwrap(), false);

        badges.set(3i64).unwrap();
        assert!(!badges.is_pending());
        assert!(badges.set(11i64).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_refreshes_stub_first() {
        let (transport, ctx) = context();
        transport.push(
            RequestKind::CardReadRefresh,
            Response::ok(json!({"id": "c1", "name": "Fetched"})),
        );
        let name = Field::<String>::new(&ctx, "Name").unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(name.get(&cancel).await.unwrap().as_deref(), Some("Fetched"));
        assert_eq!(name.get(&cancel).await.unwrap().as_deref(), Some("Fetched"));
        assert_eq!(transport.calls(RequestKind::CardReadRefresh), 1);
    }

    #[test]
    fn test_type_mismatch_surfaces_as_malformed_response() {
        let (_transport, ctx) = context();
        ctx.merge(&tether_core::Document::from_value(json!({"badges": "many"})).unwrap(), false);
        let badges = Field::<i64>::new(&ctx, "Badges").unwrap();
        assert!(badges.peek().unwrap_err().is_transport());
    }

    #[test]
    fn test_undecodable_current_value_blocks_write() {
        let (_transport, ctx) = context();
        ctx.merge(&tether_core::Document::from_value(json!({"badges": "many"})).unwrap(), false);
        let badges = Field::<i64>::new(&ctx, "Badges")
            .unwrap()
            .with_rules(RuleChain::new().with(OldValueRequired));

        assert!(badges.set(None::<i64>).unwrap_err().is_transport());
        assert!(badges.set(4i64).unwrap_err().is_transport());
        assert!(!badges.is_pending());
        assert_eq!(ctx.value("badges"), Some(json!("many")));
    }
}
