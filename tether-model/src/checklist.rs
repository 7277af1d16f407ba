//! Checklists and their nested check items.

use crate::check_item::{self, CheckItem};
use std::fmt;
use std::sync::Arc;
use tether_core::{
    EntityId, EntityKind, FieldDescriptor, FieldTable, Position, RequestKind, TetherResult,
};
use tether_sync::{
    Deletable, DeletableContext, EntityCollection, EntityDescriptor, Field, IdRule,
    NonEmptyString, NotNull, PositionRule, Resolvable, RuleChain, SyncContext, SyncEnv, Syncable,
};
use tracing::warn;

const NAME: FieldDescriptor = FieldDescriptor::new("Name", "name");
const POSITION: FieldDescriptor = FieldDescriptor::new("Position", "pos");
const CARD: FieldDescriptor = FieldDescriptor::new("Card", "idCard");
const BOARD: FieldDescriptor = FieldDescriptor::new("Board", "idBoard");
const CHECK_ITEMS: FieldDescriptor = FieldDescriptor::unrequested("CheckItems", "checkItems");

const FIELDS: &[FieldDescriptor] = &[NAME, POSITION, CARD, BOARD, CHECK_ITEMS];

pub(crate) static DESCRIPTOR: EntityDescriptor = EntityDescriptor {
    table: FieldTable::new(EntityKind::CheckList, FIELDS),
    refresh: RequestKind::CheckListReadRefresh,
    update: RequestKind::CheckListWriteUpdate,
    delete: Some(RequestKind::CheckListWriteDelete),
    refresh_parameters: &[
        ("checkItems", "all"),
        ("checkItem_fields", "name,state,pos,idChecklist"),
    ],
};

pub(crate) const MEMBERSHIP: &str = CARD.wire_key;

/// A named list of check items attached to a card.
///
/// Refreshing a checklist also refreshes its items: the nested `checkItems`
/// payload is merged into the shared [`CheckItem`] instances.
pub struct CheckList {
    context: DeletableContext,
    name: Field<String>,
    position: Field<Position>,
    card_id: Field<String>,
    board_id: Field<String>,
    check_items: EntityCollection<CheckItem>,
}

impl CheckList {
    fn new(env: &SyncEnv, id: EntityId) -> Self {
        let context = SyncContext::new(env, &DESCRIPTOR, id);
        let check_items = EntityCollection::new(
            env,
            context.key().clone(),
            RequestKind::CheckListReadCheckItems,
        );
        context.register_dependency(check_items.dependency(CHECK_ITEMS.wire_key));
        if let Err(e) = check_items.enable_consistency(Some(check_item::MEMBERSHIP)) {
            warn!(key = %context.key(), error = %e, "Consistency processing unavailable");
        }

        Self {
            name: Field::bound(&context, &NAME)
                .with_rules(RuleChain::new().with(NotNull).with(NonEmptyString)),
            position: Field::bound(&context, &POSITION)
                .with_rules(RuleChain::new().with(PositionRule)),
            card_id: Field::bound(&context, &CARD).with_rules(RuleChain::new().with(IdRule)),
            board_id: Field::bound(&context, &BOARD).with_rules(RuleChain::new().with(IdRule)),
            check_items,
            context: DeletableContext::for_kind(context, RequestKind::CheckListWriteDelete),
        }
    }

    /// The shared instance for `id`.
    pub fn get(env: &SyncEnv, id: impl Into<EntityId>) -> TetherResult<Arc<Self>> {
        Self::resolve(env, id.into())
    }

    /// A private instance that bypasses the identity cache.
    pub fn detached(env: &SyncEnv, id: impl Into<EntityId>) -> Arc<Self> {
        Arc::new(Self::new(env, id.into()))
    }

    pub fn name(&self) -> &Field<String> {
        &self.name
    }

    pub fn position(&self) -> &Field<Position> {
        &self.position
    }

    pub fn card_id(&self) -> &Field<String> {
        &self.card_id
    }

    pub fn board_id(&self) -> &Field<String> {
        &self.board_id
    }

    pub fn check_items(&self) -> &EntityCollection<CheckItem> {
        &self.check_items
    }
}

impl Syncable for CheckList {
    fn context(&self) -> &SyncContext {
        self.context.context()
    }
}

impl Deletable for CheckList {
    fn deletable(&self) -> &DeletableContext {
        &self.context
    }
}

impl Resolvable for CheckList {
    fn descriptor() -> &'static EntityDescriptor {
        &DESCRIPTOR
    }

    fn resolve(env: &SyncEnv, id: EntityId) -> TetherResult<Arc<Self>> {
        let owned = env.clone();
        env.resolve(EntityKind::CheckList, id.clone(), move || Self::new(&owned, id))
    }
}

impl fmt::Debug for CheckList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckList")
            .field("id", self.id())
            .field("state", &self.state())
            .field("check_items", &self.check_items.len())
            .finish()
    }
}
