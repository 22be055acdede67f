use crate::issue::IssueAssignmentType;

/// Errors surfaced by every engine operation. Business-rule variants are
/// returned verbatim to the caller; nothing staged by the failing unit of work
/// is committed.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: String },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(entity: Entity, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        EngineError::Unauthorized(reason.into())
    }
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        EngineError::InvalidState(reason.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Application,
    Group,
    Member,
    Assignment,
    Decision,
    Issue,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Entity::Application => "application",
            Entity::Group => "approval group",
            Entity::Member => "group member",
            Entity::Assignment => "assignment",
            Entity::Decision => "decision",
            Entity::Issue => "issue",
        };
        f.write_str(name)
    }
}

/// Malformed issue configuration, rejected before anything is written.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("issue title must not be empty")]
    EmptyTitle,
    #[error("{0:?} issues take no assignee")]
    UnexpectedAssignee(IssueAssignmentType),
    #[error("{0:?} issues require exactly one assignee reference of the matching kind")]
    AssigneeMismatch(IssueAssignmentType),
    #[error("assigned member {0} is not an active member of the group")]
    AssigneeNotInGroup(String),
    #[error("assigned member {0} can neither approve nor reject")]
    AssigneeLacksCapability(String),
    #[error("member capabilities must include approve, reject or raise-issues")]
    NoCapabilities,
    #[error("a final approver must be able to approve or reject")]
    FinalApproverCannotDecide,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("failed to encode record {key}: {reason}")]
    Encode { key: String, reason: String },
    #[error("failed to decode record {key}: {reason}")]
    Decode { key: String, reason: String },
    #[error("concurrent update conflict persisted after {0} attempts")]
    Conflict(u32),
}
