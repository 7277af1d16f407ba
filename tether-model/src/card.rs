//! Cards.

use crate::checklist::{self, CheckList};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tether_core::{
    EntityId, EntityKind, FieldDescriptor, FieldTable, Position, RequestKind, TetherResult,
};
use tether_sync::{
    Deletable, DeletableContext, EntityCollection, EntityDescriptor, Field, IdRule,
    NonEmptyString, NotNull, OldValueRequired, PositionRule, Resolvable, RuleChain, SyncContext,
    SyncEnv, Syncable,
};
use tracing::warn;

const NAME: FieldDescriptor = FieldDescriptor::new("Name", "name");
const DESCRIPTION: FieldDescriptor = FieldDescriptor::new("Description", "desc");
const POSITION: FieldDescriptor = FieldDescriptor::new("Position", "pos");
const IS_ARCHIVED: FieldDescriptor = FieldDescriptor::new("IsArchived", "closed");
const DUE_DATE: FieldDescriptor = FieldDescriptor::new("DueDate", "due");
const LIST: FieldDescriptor = FieldDescriptor::new("List", "idList");
const CHECKLISTS: FieldDescriptor = FieldDescriptor::unrequested("CheckLists", "checklists");

const FIELDS: &[FieldDescriptor] = &[
    NAME,
    DESCRIPTION,
    POSITION,
    IS_ARCHIVED,
    DUE_DATE,
    LIST,
    CHECKLISTS,
];

pub(crate) static DESCRIPTOR: EntityDescriptor = EntityDescriptor {
    table: FieldTable::new(EntityKind::Card, FIELDS),
    refresh: RequestKind::CardReadRefresh,
    update: RequestKind::CardWriteUpdate,
    delete: Some(RequestKind::CardWriteDelete),
    refresh_parameters: &[
        ("checklists", "all"),
        ("checklist_fields", "name,pos,idCard,idBoard"),
    ],
};

pub(crate) const MEMBERSHIP: &str = LIST.wire_key;

/// A card on a list.
///
/// Moving a card is a write to [`Card::list_id`]. Once a card belongs to a
/// list that field can be changed but never cleared.
pub struct Card {
    context: DeletableContext,
    name: Field<String>,
    description: Field<String>,
    position: Field<Position>,
    is_archived: Field<bool>,
    due_date: Field<DateTime<Utc>>,
    list_id: Field<String>,
    checklists: EntityCollection<CheckList>,
}

impl Card {
    fn new(env: &SyncEnv, id: EntityId) -> Self {
        let context = SyncContext::new(env, &DESCRIPTOR, id);
        let checklists = EntityCollection::new(
            env,
            context.key().clone(),
            RequestKind::CardReadCheckLists,
        );
        context.register_dependency(checklists.dependency(CHECKLISTS.wire_key));
        if let Err(e) = checklists.enable_consistency(Some(checklist::MEMBERSHIP)) {
            warn!(key = %context.key(), error = %e, "Consistency processing unavailable");
        }

        Self {
            name: Field::bound(&context, &NAME)
                .with_rules(RuleChain::new().with(NotNull).with(NonEmptyString)),
            description: Field::bound(&context, &DESCRIPTION),
            position: Field::bound(&context, &POSITION)
                .with_rules(RuleChain::new().with(PositionRule)),
            is_archived: Field::bound(&context, &IS_ARCHIVED),
            due_date: Field::bound(&context, &DUE_DATE),
            list_id: Field::bound(&context, &LIST)
                .with_rules(RuleChain::new().with(IdRule).with(OldValueRequired)),
            checklists,
            context: DeletableContext::for_kind(context, RequestKind::CardWriteDelete),
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

    pub fn description(&self) -> &Field<String> {
        &self.description
    }

    pub fn position(&self) -> &Field<Position> {
        &self.position
    }

    pub fn is_archived(&self) -> &Field<bool> {
        &self.is_archived
    }

    pub fn due_date(&self) -> &Field<DateTime<Utc>> {
        &self.due_date
    }

    pub fn list_id(&self) -> &Field<String> {
        &self.list_id
    }

    pub fn checklists(&self) -> &EntityCollection<CheckList> {
        &self.checklists
    }
}

impl Syncable for Card {
    fn context(&self) -> &SyncContext {
        self.context.context()
    }
}

impl Deletable for Card {
    fn deletable(&self) -> &DeletableContext {
        &self.context
    }
}

impl Resolvable for Card {
    fn descriptor() -> &'static EntityDescriptor {
        &DESCRIPTOR
    }

    fn resolve(env: &SyncEnv, id: EntityId) -> TetherResult<Arc<Self>> {
        let owned = env.clone();
        env.resolve(EntityKind::Card, id.clone(), move || Self::new(&owned, id))
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("id", self.id())
            .field("state", &self.state())
            .finish()
    }
}
