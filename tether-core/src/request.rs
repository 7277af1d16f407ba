//! Request kinds, endpoint descriptors and the request/response envelope.
//!
//! The core never builds URLs. It names *what* it wants through a
//! [`RequestKind`] plus named parameters and lets an [`EndpointFactory`]
//! turn that into an opaque [`Endpoint`] for the transport.

use crate::{Document, EntityKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Whether a request reads or mutates remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
}

macro_rules! request_kinds {
    ($($variant:ident => ($target:expr, $access:ident)),* $(,)?) => {
        /// Every request the object model can issue, one per entity and operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum RequestKind {
            $($variant),*
        }

        impl RequestKind {
            pub const ALL: &'static [RequestKind] = &[$(RequestKind::$variant),*];

            /// The entity kind addressed by this request, `None` for service-level calls.
            pub fn target(&self) -> Option<EntityKind> {
                match self {
                    $(RequestKind::$variant => $target),*
                }
            }

            pub fn access(&self) -> Access {
                match self {
                    $(RequestKind::$variant => Access::$access),*
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(RequestKind::$variant => stringify!($variant)),*
                }
            }
        }
    };
}

use EntityKind as K;

request_kinds! {
    ActionReadRefresh => (Some(K::Action), Read),
    ActionWriteDelete => (Some(K::Action), Write),
    ActionWriteUpdate => (Some(K::Action), Write),
    AttachmentReadRefresh => (Some(K::Attachment), Read),
    AttachmentWriteDelete => (Some(K::Attachment), Write),
    AttachmentWriteUpdate => (Some(K::Attachment), Write),
    BoardReadActions => (Some(K::Board), Read),
    BoardReadCards => (Some(K::Board), Read),
    BoardReadCardsForMember => (Some(K::Board), Read),
    BoardReadCustomFields => (Some(K::Board), Read),
    BoardReadLabels => (Some(K::Board), Read),
    BoardReadLists => (Some(K::Board), Read),
    BoardReadMembers => (Some(K::Board), Read),
    BoardReadMemberships => (Some(K::Board), Read),
    BoardReadPersonalPrefs => (Some(K::Board), Read),
    BoardReadPowerUpData => (Some(K::Board), Read),
    BoardReadPowerUps => (Some(K::Board), Read),
    BoardReadRefresh => (Some(K::Board), Read),
    BoardWriteUpdate => (Some(K::Board), Write),
    BoardWriteAddLabel => (Some(K::Board), Write),
    BoardWriteAddList => (Some(K::Board), Write),
    BoardWriteAddOrUpdateMember => (Some(K::Board), Write),
    BoardWriteDelete => (Some(K::Board), Write),
    BoardWritePersonalPrefs => (Some(K::Board), Write),
    BoardWriteRemoveLabel => (Some(K::Board), Write),
    BoardWriteRemoveMember => (Some(K::Board), Write),
    BoardMembershipReadRefresh => (Some(K::BoardMembership), Read),
    BoardMembershipWriteUpdate => (Some(K::BoardMembership), Write),
    CardReadActions => (Some(K::Card), Read),
    CardReadAttachments => (Some(K::Card), Read),
    CardReadCheckLists => (Some(K::Card), Read),
    CardReadCustomFields => (Some(K::Card), Read),
    CardReadLabels => (Some(K::Card), Read),
    CardReadMembers => (Some(K::Card), Read),
    CardReadMembersVoted => (Some(K::Card), Read),
    CardReadPowerUpData => (Some(K::Card), Read),
    CardReadRefresh => (Some(K::Card), Read),
    CardReadStickers => (Some(K::Card), Read),
    CardWriteUpdate => (Some(K::Card), Write),
    CardWriteAddAttachment => (Some(K::Card), Write),
    CardWriteAddChecklist => (Some(K::Card), Write),
    CardWriteAddComment => (Some(K::Card), Write),
    CardWriteAddLabel => (Some(K::Card), Write),
    CardWriteAddSticker => (Some(K::Card), Write),
    CardWriteAssignMember => (Some(K::Card), Write),
    CardWriteDelete => (Some(K::Card), Write),
    CardWriteRemoveLabel => (Some(K::Card), Write),
    CardWriteRemoveMember => (Some(K::Card), Write),
    CardWriteRemoveSticker => (Some(K::Card), Write),
    CheckItemReadRefresh => (Some(K::CheckItem), Read),
    CheckItemWriteDelete => (Some(K::CheckItem), Write),
    CheckItemWriteUpdate => (Some(K::CheckItem), Write),
    CheckListReadCheckItems => (Some(K::CheckList), Read),
    CheckListReadRefresh => (Some(K::CheckList), Read),
    CheckListWriteAddCheckItem => (Some(K::CheckList), Write),
    CheckListWriteDelete => (Some(K::CheckList), Write),
    CheckListWriteUpdate => (Some(K::CheckList), Write),
    CustomFieldWriteUpdate => (Some(K::CustomField), Write),
    CustomFieldDefinitionReadOptions => (Some(K::CustomFieldDefinition), Read),
    CustomFieldDefinitionReadRefresh => (Some(K::CustomFieldDefinition), Read),
    CustomFieldDefinitionWriteCreate => (Some(K::CustomFieldDefinition), Write),
    CustomFieldDefinitionWriteAddOption => (Some(K::CustomFieldDefinition), Write),
    CustomFieldDefinitionWriteDelete => (Some(K::CustomFieldDefinition), Write),
    CustomFieldDefinitionWriteUpdate => (Some(K::CustomFieldDefinition), Write),
    DropDownOptionReadRefresh => (Some(K::DropDownOption), Read),
    DropDownOptionWriteDelete => (Some(K::DropDownOption), Write),
    LabelReadRefresh => (Some(K::Label), Read),
    LabelWriteDelete => (Some(K::Label), Write),
    LabelWriteUpdate => (Some(K::Label), Write),
    ListReadActions => (Some(K::List), Read),
    ListReadCards => (Some(K::List), Read),
    ListReadRefresh => (Some(K::List), Read),
    ListWriteAddCard => (Some(K::List), Write),
    ListWriteUpdate => (Some(K::List), Write),
    MemberReadActions => (Some(K::Member), Read),
    MemberReadBoards => (Some(K::Member), Read),
    MemberReadCards => (Some(K::Member), Read),
    MemberReadNotifications => (Some(K::Member), Read),
    MemberReadOrganizations => (Some(K::Member), Read),
    MemberReadRefresh => (Some(K::Member), Read),
    MemberWriteCreateBoard => (Some(K::Member), Write),
    MemberWriteCreateOrganization => (Some(K::Member), Write),
    MemberWriteUpdate => (Some(K::Member), Write),
    NotificationReadRefresh => (Some(K::Notification), Read),
    NotificationWriteUpdate => (Some(K::Notification), Write),
    OrganizationReadActions => (Some(K::Organization), Read),
    OrganizationReadBoards => (Some(K::Organization), Read),
    OrganizationReadMembers => (Some(K::Organization), Read),
    OrganizationReadMemberships => (Some(K::Organization), Read),
    OrganizationReadPowerUpData => (Some(K::Organization), Read),
    OrganizationReadRefresh => (Some(K::Organization), Read),
    OrganizationWriteAddOrUpdateMember => (Some(K::Organization), Write),
    OrganizationWriteCreateBoard => (Some(K::Organization), Write),
    OrganizationWriteDelete => (Some(K::Organization), Write),
    OrganizationWriteRemoveMember => (Some(K::Organization), Write),
    OrganizationWriteUpdate => (Some(K::Organization), Write),
    OrganizationMembershipReadRefresh => (Some(K::OrganizationMembership), Read),
    OrganizationMembershipWriteUpdate => (Some(K::OrganizationMembership), Write),
    OrganizationPreferencesReadRefresh => (Some(K::Organization), Read),
    ServiceReadBatch => (None, Read),
    ServiceReadMe => (None, Read),
    ServiceReadSearch => (None, Read),
    ServiceReadSearchMembers => (None, Read),
    ServiceReadTypeQuery => (None, Read),
    StickerReadRefresh => (Some(K::Sticker), Read),
    StickerWriteDelete => (Some(K::Sticker), Write),
    StickerWriteUpdate => (Some(K::Sticker), Write),
    TokenReadRefresh => (Some(K::Token), Read),
    TokenWriteDelete => (Some(K::Token), Write),
    WebhookReadRefresh => (Some(K::Webhook), Read),
    WebhookWriteDelete => (Some(K::Webhook), Write),
    WebhookWriteEntity => (Some(K::Webhook), Write),
    WebhookWriteUpdate => (Some(K::Webhook), Write),
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Named parameters used to build an endpoint (`_id`, `_labelId`, ...).
pub type EndpointParams = BTreeMap<String, String>;

/// Opaque endpoint descriptor handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub kind: RequestKind,
    /// Factory-defined location, meaningless to the core.
    pub path: String,
    pub params: EndpointParams,
}

/// Builds endpoint descriptors from request kinds.
pub trait EndpointFactory: Send + Sync {
    fn build(&self, kind: RequestKind, params: EndpointParams) -> Endpoint;
}

/// Endpoint factory that records the request name as its path.
///
/// Useful for transports that dispatch on [`RequestKind`] directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorEndpointFactory;

impl EndpointFactory for DescriptorEndpointFactory {
    fn build(&self, kind: RequestKind, params: EndpointParams) -> Endpoint {
        let path = match params.get("_id") {
            Some(id) => format!("{}/{}", kind.name(), id),
            None => kind.name().to_string(),
        };
        Endpoint { kind, path, params }
    }
}

/// Single outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub request_id: Uuid,
    pub endpoint: Endpoint,
    /// Query parameters (`fields`, nested expansions, ...).
    pub parameters: BTreeMap<String, String>,
    pub payload: Option<Document>,
    /// Payload encoded by the environment's serializer.
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            endpoint,
            parameters: BTreeMap::new(),
            payload: None,
            body: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, payload: Document) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Value of a named endpoint parameter such as `_id`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.endpoint.params.get(name).map(String::as_str)
    }

    pub fn kind(&self) -> RequestKind {
        self.endpoint.kind
    }
}

/// Outcome of one transport call as seen by the retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub payload: Option<Value>,
    pub message: Option<String>,
}

impl Response {
    pub fn ok(payload: Value) -> Self {
        Self {
            status: 200,
            payload: Some(payload),
            message: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            status: 200,
            payload: None,
            message: None,
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: None,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
