//! Check items: the individual entries of a checklist.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tether_core::{
    EntityId, EntityKind, FieldDescriptor, FieldTable, Position, RequestKind, TetherResult,
};
use tether_sync::{
    Deletable, DeletableContext, EntityDescriptor, Field, IdRule, NonEmptyString, NotNull,
    PositionRule, Resolvable, RuleChain, SyncContext, SyncEnv, Syncable,
};

/// Completion state of a check item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckItemState {
    Complete,
    Incomplete,
}

impl fmt::Display for CheckItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Incomplete => write!(f, "incomplete"),
        }
    }
}

const NAME: FieldDescriptor = FieldDescriptor::new("Name", "name");
const STATE: FieldDescriptor = FieldDescriptor::new("State", "state");
const POSITION: FieldDescriptor = FieldDescriptor::new("Position", "pos");
const CHECKLIST: FieldDescriptor = FieldDescriptor::new("CheckList", "idChecklist");

const FIELDS: &[FieldDescriptor] = &[NAME, STATE, POSITION, CHECKLIST];

pub(crate) static DESCRIPTOR: EntityDescriptor = EntityDescriptor {
    table: FieldTable::new(EntityKind::CheckItem, FIELDS),
    refresh: RequestKind::CheckItemReadRefresh,
    update: RequestKind::CheckItemWriteUpdate,
    delete: Some(RequestKind::CheckItemWriteDelete),
    refresh_parameters: &[],
};

/// Wire key of the membership field pointing at the owning checklist.
pub(crate) const MEMBERSHIP: &str = CHECKLIST.wire_key;

/// One entry of a checklist.
pub struct CheckItem {
    context: DeletableContext,
    name: Field<String>,
    state: Field<CheckItemState>,
    position: Field<Position>,
    checklist_id: Field<String>,
}

impl CheckItem {
    fn new(env: &SyncEnv, id: EntityId) -> Self {
        let context = SyncContext::new(env, &DESCRIPTOR, id);
        Self {
            name: Field::bound(&context, &NAME)
                .with_rules(RuleChain::new().with(NotNull).with(NonEmptyString)),
            state: Field::bound(&context, &STATE).with_rules(RuleChain::new().with(NotNull)),
            position: Field::bound(&context, &POSITION)
                .with_rules(RuleChain::new().with(PositionRule)),
            checklist_id: Field::bound(&context, &CHECKLIST)
                .with_rules(RuleChain::new().with(IdRule)),
            context: DeletableContext::for_kind(context, RequestKind::CheckItemWriteDelete),
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

    pub fn state(&self) -> &Field<CheckItemState> {
        &self.state
    }

    pub fn position(&self) -> &Field<Position> {
        &self.position
    }

    pub fn checklist_id(&self) -> &Field<String> {
        &self.checklist_id
    }
}

impl Syncable for CheckItem {
    fn context(&self) -> &SyncContext {
        self.context.context()
    }
}

impl Deletable for CheckItem {
    fn deletable(&self) -> &DeletableContext {
        &self.context
    }
}

impl Resolvable for CheckItem {
    fn descriptor() -> &'static EntityDescriptor {
        &DESCRIPTOR
    }

    fn resolve(env: &SyncEnv, id: EntityId) -> TetherResult<Arc<Self>> {
        let owned = env.clone();
        env.resolve(EntityKind::CheckItem, id.clone(), move || Self::new(&owned, id))
    }
}

impl fmt::Debug for CheckItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckItem")
            .field("id", self.id())
            .field("state", &Syncable::state(self))
            .finish()
    }
}
