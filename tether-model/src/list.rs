//! Lists and the cards on them.

use crate::card::{self, Card};
use std::fmt;
use std::sync::Arc;
use tether_core::{
    EntityId, EntityKind, FieldDescriptor, FieldTable, Position, RequestKind, TetherResult,
};
use tether_sync::{
    EntityCollection, EntityDescriptor, Field, IdRule, NonEmptyString, NotNull, PositionRule,
    Resolvable, RuleChain, SyncContext, SyncEnv, Syncable,
};
use tracing::warn;

const NAME: FieldDescriptor = FieldDescriptor::new("Name", "name");
const IS_ARCHIVED: FieldDescriptor = FieldDescriptor::new("IsArchived", "closed");
const POSITION: FieldDescriptor = FieldDescriptor::new("Position", "pos");
const IS_SUBSCRIBED: FieldDescriptor = FieldDescriptor::new("IsSubscribed", "subscribed");
const BOARD: FieldDescriptor = FieldDescriptor::new("Board", "idBoard");
const CARDS: FieldDescriptor = FieldDescriptor::unrequested("Cards", "cards");

const FIELDS: &[FieldDescriptor] = &[NAME, IS_ARCHIVED, POSITION, IS_SUBSCRIBED, BOARD, CARDS];

pub(crate) static DESCRIPTOR: EntityDescriptor = EntityDescriptor {
    table: FieldTable::new(EntityKind::List, FIELDS),
    refresh: RequestKind::ListReadRefresh,
    update: RequestKind::ListWriteUpdate,
    delete: None,
    refresh_parameters: &[
        ("cards", "open"),
        ("card_fields", "name,desc,pos,closed,due,idList"),
    ],
};

/// A list on a board. Lists are archived, never deleted.
pub struct List {
    context: SyncContext,
    name: Field<String>,
    is_archived: Field<bool>,
    position: Field<Position>,
    is_subscribed: Field<bool>,
    board_id: Field<String>,
    cards: EntityCollection<Card>,
}

impl List {
    fn new(env: &SyncEnv, id: EntityId) -> Self {
        let context = SyncContext::new(env, &DESCRIPTOR, id);
        let cards = EntityCollection::new(env, context.key().clone(), RequestKind::ListReadCards);
        context.register_dependency(cards.dependency(CARDS.wire_key));
        if let Err(e) = cards.enable_consistency(Some(card::MEMBERSHIP)) {
            warn!(key = %context.key(), error = %e, "Consistency processing unavailable");
        }

        Self {
            name: Field::bound(&context, &NAME)
                .with_rules(RuleChain::new().with(NotNull).with(NonEmptyString)),
            is_archived: Field::bound(&context, &IS_ARCHIVED),
            position: Field::bound(&context, &POSITION)
                .with_rules(RuleChain::new().with(PositionRule)),
            is_subscribed: Field::bound(&context, &IS_SUBSCRIBED),
            board_id: Field::bound(&context, &BOARD).with_rules(RuleChain::new().with(IdRule)),
            cards,
            context,
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

    pub fn is_archived(&self) -> &Field<bool> {
        &self.is_archived
    }

    pub fn position(&self) -> &Field<Position> {
        &self.position
    }

    pub fn is_subscribed(&self) -> &Field<bool> {
        &self.is_subscribed
    }

    pub fn board_id(&self) -> &Field<String> {
        &self.board_id
    }

    pub fn cards(&self) -> &EntityCollection<Card> {
        &self.cards
    }
}

impl Syncable for List {
    fn context(&self) -> &SyncContext {
        &self.context
    }
}

impl Resolvable for List {
    fn descriptor() -> &'static EntityDescriptor {
        &DESCRIPTOR
    }

    fn resolve(env: &SyncEnv, id: EntityId) -> TetherResult<Arc<Self>> {
        let owned = env.clone();
        env.resolve(EntityKind::List, id.clone(), move || Self::new(&owned, id))
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List")
            .field("id", self.id())
            .field("state", &self.state())
            .field("cards", &self.cards.len())
            .finish()
    }
}
