//! Issues raised during review. Any open issue keeps the assignment from
//! becoming ready for the final approver.
//!
//! Who may resolve an issue is fixed when it is raised:
//!
//! - `Collaborative`: any active member of the group.
//! - `GroupMember`: only the referenced member, who must be able to approve or
//!   reject.
//! - `SpecificUser`: only the referenced user, member or not.
use chrono::Utc;
use tracing::info;

use crate::assignment::{self, Review};
use crate::decision;
use crate::error::{EngineError, Entity, ValidationError};
use crate::registry::{self, GroupMember};
use crate::statistics;
use crate::store::{Record, Tx, keys};
use crate::types::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IssuePriority {
    #[n(0)]
    Low,
    #[n(1)]
    #[default]
    Medium,
    #[n(2)]
    High,
    #[n(3)]
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueAssignmentType {
    Collaborative,
    GroupMember,
    SpecificUser,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum IssueAssignment {
    #[n(0)]
    Collaborative,
    #[n(1)]
    GroupMember {
        #[n(0)]
        member_id: String,
    },
    #[n(2)]
    SpecificUser {
        #[n(0)]
        user_id: String,
    },
}

impl IssueAssignment {
    /// Build the assignment from its declared type and the raw assignee
    /// references. Exactly the references the type calls for must be present;
    /// blank strings count as absent.
    pub fn from_parts(
        kind: IssueAssignmentType,
        member_id: Option<String>,
        user_id: Option<String>,
    ) -> Result<Self, ValidationError> {
        let member_id = member_id.filter(|m| !m.trim().is_empty());
        let user_id = user_id.filter(|u| !u.trim().is_empty());

        match (kind, member_id, user_id) {
            (IssueAssignmentType::Collaborative, None, None) => Ok(IssueAssignment::Collaborative),
            (IssueAssignmentType::Collaborative, _, _) => {
                Err(ValidationError::UnexpectedAssignee(kind))
            }
            (IssueAssignmentType::GroupMember, Some(member_id), None) => {
                Ok(IssueAssignment::GroupMember { member_id })
            }
            (IssueAssignmentType::SpecificUser, None, Some(user_id)) => {
                Ok(IssueAssignment::SpecificUser { user_id })
            }
            (kind, _, _) => Err(ValidationError::AssigneeMismatch(kind)),
        }
    }

    pub fn kind(&self) -> IssueAssignmentType {
        match self {
            IssueAssignment::Collaborative => IssueAssignmentType::Collaborative,
            IssueAssignment::GroupMember { .. } => IssueAssignmentType::GroupMember,
            IssueAssignment::SpecificUser { .. } => IssueAssignmentType::SpecificUser,
        }
    }
}

/// Request to raise an issue, as received from the caller.
#[derive(Debug, Clone)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    pub priority: IssuePriority,
    pub assignment_type: IssueAssignmentType,
    pub assigned_member_id: Option<String>,
    pub assigned_user_id: Option<String>,
}

impl NewIssue {
    pub fn collaborative(title: &str, description: &str) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
            priority: IssuePriority::default(),
            assignment_type: IssueAssignmentType::Collaborative,
            assigned_member_id: None,
            assigned_user_id: None,
        }
    }
    pub fn for_member(title: &str, description: &str, member_id: &str) -> Self {
        Self {
            assignment_type: IssueAssignmentType::GroupMember,
            assigned_member_id: Some(member_id.to_string()),
            ..Self::collaborative(title, description)
        }
    }
    pub fn for_user(title: &str, description: &str, user_id: &str) -> Self {
        Self {
            assignment_type: IssueAssignmentType::SpecificUser,
            assigned_user_id: Some(user_id.to_string()),
            ..Self::collaborative(title, description)
        }
    }
    pub fn set_priority(mut self, priority: IssuePriority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub assignment_id: String,
    #[n(2)]
    pub application_id: String,
    #[n(3)]
    pub raised_by_member_id: String,
    #[n(4)]
    pub raised_by_user_id: String,
    #[n(5)]
    pub title: String,
    #[n(6)]
    pub description: String,
    #[n(7)]
    pub priority: IssuePriority,
    #[n(8)]
    pub assignment: IssueAssignment, // immutable after creation
    #[n(9)]
    pub thread_id: Option<String>,
    #[n(10)]
    pub is_resolved: bool,
    #[n(11)]
    pub resolved_by: Option<String>,
    #[n(12)]
    pub resolved_at: Option<TimeStamp<Utc>>,
    #[n(13)]
    pub resolution: Option<String>,
    #[n(14)]
    pub raised_at: TimeStamp<Utc>,
}

impl Record for Issue {
    fn key(&self) -> String {
        keys::issue(&self.assignment_id, &self.id)
    }
}

impl Issue {
    pub fn resolve(
        &mut self,
        resolved_by: &str,
        resolution: Option<String>,
        now: TimeStamp<Utc>,
    ) -> Result<(), EngineError> {
        if self.is_resolved {
            return Err(EngineError::invalid_state(format!(
                "issue {} is already resolved",
                self.id
            )));
        }
        self.is_resolved = true;
        self.resolved_by = Some(resolved_by.to_string());
        self.resolved_at = Some(now);
        self.resolution = resolution;
        Ok(())
    }

    pub fn reopen(&mut self) -> Result<(), EngineError> {
        if !self.is_resolved {
            return Err(EngineError::invalid_state(format!(
                "issue {} is not resolved",
                self.id
            )));
        }
        self.is_resolved = false;
        self.resolved_by = None;
        self.resolved_at = None;
        self.resolution = None;
        Ok(())
    }
}

/// Typed filter for issue reads. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub resolved: Option<bool>,
    pub priority: Option<IssuePriority>,
    pub assignment_type: Option<IssueAssignmentType>,
    pub raised_by_user_id: Option<String>,
}

impl IssueFilter {
    pub fn open() -> Self {
        Self {
            resolved: Some(false),
            ..Self::default()
        }
    }
    pub fn resolved() -> Self {
        Self {
            resolved: Some(true),
            ..Self::default()
        }
    }
    pub fn with_priority(mut self, priority: IssuePriority) -> Self {
        self.priority = Some(priority);
        self
    }
    pub fn with_assignment_type(mut self, kind: IssueAssignmentType) -> Self {
        self.assignment_type = Some(kind);
        self
    }
    pub fn raised_by(mut self, user_id: &str) -> Self {
        self.raised_by_user_id = Some(user_id.to_string());
        self
    }

    pub fn matches(&self, issue: &Issue) -> bool {
        self.resolved.is_none_or(|r| issue.is_resolved == r)
            && self.priority.is_none_or(|p| issue.priority == p)
            && self
                .assignment_type
                .is_none_or(|k| issue.assignment.kind() == k)
            && self
                .raised_by_user_id
                .as_ref()
                .is_none_or(|u| &issue.raised_by_user_id == u)
    }
}

pub fn issues_of(tx: &mut Tx<'_>, assignment_id: &str) -> Result<Vec<Issue>, EngineError> {
    Ok(tx.scan(&keys::issues_of(assignment_id))?)
}

pub fn find(
    tx: &mut Tx<'_>,
    assignment_id: &str,
    filter: &IssueFilter,
) -> Result<Vec<Issue>, EngineError> {
    Ok(issues_of(tx, assignment_id)?
        .into_iter()
        .filter(|i| filter.matches(i))
        .collect())
}

pub fn locate(tx: &mut Tx<'_>, issue_id: &str) -> Result<Issue, EngineError> {
    let assignment_id = tx
        .get_index(&keys::issue_assignment(issue_id))?
        .ok_or_else(|| EngineError::not_found(Entity::Issue, issue_id))?;
    tx.get(&keys::issue(&assignment_id, issue_id))?
        .ok_or_else(|| EngineError::not_found(Entity::Issue, issue_id))
}

/// Check that an assignee reference names someone who can act on the issue.
fn validate_assignee(
    tx: &mut Tx<'_>,
    group_id: &str,
    assignment: &IssueAssignment,
) -> Result<(), EngineError> {
    if let IssueAssignment::GroupMember { member_id } = assignment {
        let target = tx
            .get::<GroupMember>(&keys::member(group_id, member_id))?
            .filter(|m| m.is_active)
            .ok_or_else(|| ValidationError::AssigneeNotInGroup(member_id.clone()))?;
        if !target.capabilities.can_decide() {
            return Err(ValidationError::AssigneeLacksCapability(member_id.clone()).into());
        }
    }
    Ok(())
}

/// Check that `user_id` may resolve or reopen the issue.
pub fn authorize_resolver(
    tx: &mut Tx<'_>,
    issue: &Issue,
    group_id: &str,
    user_id: &str,
) -> Result<(), EngineError> {
    match &issue.assignment {
        IssueAssignment::Collaborative => {
            registry::active_member(tx, group_id, user_id)?;
        }
        IssueAssignment::GroupMember { member_id } => {
            let assignee = registry::member(tx, group_id, member_id)?;
            if assignee.user_id != user_id || !assignee.is_active {
                return Err(EngineError::unauthorized(format!(
                    "issue {} is assigned to group member {member_id}",
                    issue.id
                )));
            }
        }
        IssueAssignment::SpecificUser { user_id: assignee } => {
            if assignee != user_id {
                return Err(EngineError::unauthorized(format!(
                    "issue {} is assigned to user {assignee}",
                    issue.id
                )));
            }
        }
    }
    Ok(())
}

/// Everything a raise checks before writing: the request itself, the open
/// review, the raiser's seat and capability, and the assignee reference.
fn vet_raise(
    tx: &mut Tx<'_>,
    application_id: &str,
    user_id: &str,
    request: &NewIssue,
) -> Result<(Review, GroupMember, IssueAssignment), EngineError> {
    if request.title.trim().is_empty() {
        return Err(ValidationError::EmptyTitle.into());
    }
    let assignment = IssueAssignment::from_parts(
        request.assignment_type,
        request.assigned_member_id.clone(),
        request.assigned_user_id.clone(),
    )?;

    let review = assignment::load_review(tx, application_id)?;
    assignment::ensure_open(&review.assignment)?;

    let raiser = registry::active_member(tx, &review.group.id, user_id)?;
    if !raiser.capabilities.can_raise_issues {
        return Err(EngineError::unauthorized(format!(
            "member {} may not raise issues",
            raiser.id
        )));
    }
    validate_assignee(tx, &review.group.id, &assignment)?;

    Ok((review, raiser, assignment))
}

/// Read-only pre-flight of [`raise`], run before a discussion thread is
/// opened so a request that is going to fail never creates one.
pub fn check_raise(
    tx: &mut Tx<'_>,
    application_id: &str,
    user_id: &str,
    request: &NewIssue,
) -> Result<(), EngineError> {
    vet_raise(tx, application_id, user_id, request).map(|_| ())
}

pub fn raise(
    tx: &mut Tx<'_>,
    application_id: &str,
    user_id: &str,
    issue_id: &str,
    thread_id: &str,
    request: &NewIssue,
    now: TimeStamp<Utc>,
) -> Result<Issue, EngineError> {
    let (mut review, raiser, assignment) = vet_raise(tx, application_id, user_id, request)?;

    if raiser.is_deciding_regular() {
        decision::ensure_for_member(tx, &review.assignment, &raiser, now.clone())?;
    }

    let issue = Issue {
        id: issue_id.to_string(),
        assignment_id: review.assignment.id.clone(),
        application_id: review.application.id.clone(),
        raised_by_member_id: raiser.id.clone(),
        raised_by_user_id: raiser.user_id.clone(),
        title: request.title.clone(),
        description: request.description.clone(),
        priority: request.priority,
        assignment,
        thread_id: Some(thread_id.to_string()),
        is_resolved: false,
        resolved_by: None,
        resolved_at: None,
        resolution: None,
        raised_at: now.clone(),
    };
    tx.put(&issue)?;
    tx.put_index(&keys::issue_assignment(&issue.id), &issue.assignment_id);

    statistics::recompute(tx, &mut review.assignment, &review.group, &now)?;
    review.save(tx)?;

    info!(
        application_id,
        issue_id = %issue.id,
        thread_id,
        raised_by = %raiser.id,
        kind = ?issue.assignment.kind(),
        priority = ?issue.priority,
        "issue raised"
    );
    Ok(issue)
}

fn load_issue_review(tx: &mut Tx<'_>, issue_id: &str) -> Result<(Issue, Review), EngineError> {
    let issue = locate(tx, issue_id)?;
    let review = assignment::load_review(tx, &issue.application_id)?;
    assignment::ensure_open(&review.assignment)?;
    Ok((issue, review))
}

pub fn resolve(
    tx: &mut Tx<'_>,
    issue_id: &str,
    user_id: &str,
    resolution: Option<String>,
    now: TimeStamp<Utc>,
) -> Result<Issue, EngineError> {
    let (mut issue, mut review) = load_issue_review(tx, issue_id)?;
    authorize_resolver(tx, &issue, &review.group.id, user_id)?;

    issue.resolve(user_id, resolution, now.clone())?;
    tx.put(&issue)?;

    statistics::recompute(tx, &mut review.assignment, &review.group, &now)?;
    review.save(tx)?;

    info!(
        issue_id,
        user_id,
        ready = review.assignment.ready_for_final_approval,
        "issue resolved"
    );
    Ok(issue)
}

pub fn reopen(
    tx: &mut Tx<'_>,
    issue_id: &str,
    user_id: &str,
    now: TimeStamp<Utc>,
) -> Result<Issue, EngineError> {
    let (mut issue, mut review) = load_issue_review(tx, issue_id)?;
    authorize_resolver(tx, &issue, &review.group.id, user_id)?;

    issue.reopen()?;
    tx.put(&issue)?;

    statistics::recompute(tx, &mut review.assignment, &review.group, &now)?;
    review.save(tx)?;

    info!(issue_id, user_id, "issue reopened");
    Ok(issue)
}
