//! Approval groups and their members.
//!
//! The decision path only reads from here. The administrative writes at the
//! bottom of the module seed and maintain membership; members are soft-removed
//! so decisions made under an old seat keep resolving to a record.
use chrono::Utc;
use tracing::info;

use crate::error::{EngineError, Entity, ValidationError};
use crate::store::{Record, Tx, keys};
use crate::types::{TimeStamp, Verdict};
use crate::utils::{self, GROUP_HRP, MEMBER_HRP};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ApprovalGroup {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub name: String,
    #[n(2)]
    pub description: Option<String>,
    #[n(3)]
    pub requires_all_approvals: bool,
    #[n(4)]
    pub minimum_approvals: u32, // only consulted when requires_all_approvals is false
    #[n(5)]
    pub is_active: bool,
    #[n(6)]
    pub created_at: TimeStamp<Utc>,
    #[n(7)]
    pub deactivated_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub seat_version: u64, // bumped by every seat write so racing writes conflict
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
    #[n(0)]
    Regular,
    #[n(1)]
    FinalApprover,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    #[n(0)]
    pub can_approve: bool,
    #[n(1)]
    pub can_reject: bool,
    #[n(2)]
    pub can_raise_issues: bool,
}

impl Capabilities {
    pub fn full() -> Self {
        Self {
            can_approve: true,
            can_reject: true,
            can_raise_issues: true,
        }
    }
    pub fn permits(&self, verdict: Verdict) -> bool {
        match verdict {
            Verdict::Approve => self.can_approve,
            Verdict::Reject => self.can_reject,
        }
    }
    pub fn can_decide(&self) -> bool {
        self.can_approve || self.can_reject
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::full()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub group_id: String,
    #[n(2)]
    pub user_id: String, // identity handed to us by the caller
    #[n(3)]
    pub role: MemberRole,
    #[n(4)]
    pub capabilities: Capabilities,
    #[n(5)]
    pub is_available: bool,
    #[n(6)]
    pub is_active: bool,
    #[n(7)]
    pub joined_at: TimeStamp<Utc>,
    #[n(8)]
    pub left_at: Option<TimeStamp<Utc>>,
}

impl GroupMember {
    pub fn is_final_approver(&self) -> bool {
        self.role == MemberRole::FinalApprover
    }

    /// Counted towards the review totals.
    pub fn is_deciding_regular(&self) -> bool {
        self.is_active && self.role == MemberRole::Regular && self.capabilities.can_decide()
    }
}

impl Record for ApprovalGroup {
    fn key(&self) -> String {
        keys::group(&self.id)
    }
}

impl Record for GroupMember {
    fn key(&self) -> String {
        keys::member(&self.group_id, &self.id)
    }
}

/// Draft of a group to register.
#[derive(Debug, Clone)]
pub struct NewGroup {
    pub name: String,
    pub description: Option<String>,
    pub requires_all_approvals: bool,
    pub minimum_approvals: u32,
}

impl NewGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            requires_all_approvals: true,
            minimum_approvals: 0,
        }
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
    /// Readiness on a threshold of approvals instead of every regular member.
    pub fn set_minimum_approvals(mut self, minimum: u32) -> Self {
        self.requires_all_approvals = false;
        self.minimum_approvals = minimum;
        self
    }
}

/// Draft of a seat to register.
#[derive(Debug, Clone)]
pub struct NewMember {
    pub group_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub capabilities: Capabilities,
    pub is_available: bool,
}

impl NewMember {
    pub fn regular(group_id: &str, user_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            role: MemberRole::Regular,
            capabilities: Capabilities::full(),
            is_available: true,
        }
    }
    pub fn final_approver(group_id: &str, user_id: &str) -> Self {
        Self {
            role: MemberRole::FinalApprover,
            ..Self::regular(group_id, user_id)
        }
    }
    pub fn set_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
    pub fn set_available(mut self, available: bool) -> Self {
        self.is_available = available;
        self
    }
}

pub fn group(tx: &mut Tx<'_>, group_id: &str) -> Result<ApprovalGroup, EngineError> {
    tx.get(&keys::group(group_id))?
        .ok_or_else(|| EngineError::not_found(Entity::Group, group_id))
}

/// Every seat ever registered in the group, including soft-removed ones.
pub fn members(tx: &mut Tx<'_>, group_id: &str) -> Result<Vec<GroupMember>, EngineError> {
    Ok(tx.scan(&keys::members_of(group_id))?)
}

pub fn member(
    tx: &mut Tx<'_>,
    group_id: &str,
    member_id: &str,
) -> Result<GroupMember, EngineError> {
    tx.get(&keys::member(group_id, member_id))?
        .ok_or_else(|| EngineError::not_found(Entity::Member, member_id))
}

/// The caller's active seat in the group.
pub fn active_member(
    tx: &mut Tx<'_>,
    group_id: &str,
    user_id: &str,
) -> Result<GroupMember, EngineError> {
    group(tx, group_id)?;

    let seats: Vec<GroupMember> = members(tx, group_id)?
        .into_iter()
        .filter(|m| m.user_id == user_id)
        .collect();

    if seats.is_empty() {
        return Err(EngineError::unauthorized(format!(
            "user {user_id} is not a member of group {group_id}"
        )));
    }

    seats.into_iter().find(|m| m.is_active).ok_or_else(|| {
        EngineError::unauthorized(format!(
            "membership of user {user_id} in group {group_id} is inactive"
        ))
    })
}

/// Active members other than the final approver that can approve or reject.
/// Observers who may only raise issues are left out.
pub fn regular_members(tx: &mut Tx<'_>, group_id: &str) -> Result<Vec<GroupMember>, EngineError> {
    Ok(members(tx, group_id)?
        .into_iter()
        .filter(GroupMember::is_deciding_regular)
        .collect())
}

/// Stage the group with its seat version bumped. Every seat write goes through
/// here, so two units of work changing seats of the same group conflict on
/// the group record at commit.
fn touch_seats(tx: &mut Tx<'_>, group: &mut ApprovalGroup) -> Result<(), EngineError> {
    group.seat_version += 1;
    tx.put(&*group)?;
    Ok(())
}

pub fn final_approver(
    tx: &mut Tx<'_>,
    group_id: &str,
) -> Result<Option<GroupMember>, EngineError> {
    Ok(members(tx, group_id)?
        .into_iter()
        .find(|m| m.is_active && m.is_final_approver()))
}

pub fn register_group(
    tx: &mut Tx<'_>,
    draft: NewGroup,
    now: TimeStamp<Utc>,
) -> Result<ApprovalGroup, EngineError> {
    let group = ApprovalGroup {
        id: utils::new_uuid_to_bech32(GROUP_HRP)?,
        name: draft.name,
        description: draft.description,
        requires_all_approvals: draft.requires_all_approvals,
        minimum_approvals: draft.minimum_approvals,
        is_active: true,
        created_at: now,
        deactivated_at: None,
        seat_version: 0,
    };
    tx.put(&group)?;

    info!(group_id = %group.id, name = %group.name, "approval group registered");
    Ok(group)
}

pub fn deactivate_group(
    tx: &mut Tx<'_>,
    group_id: &str,
    now: TimeStamp<Utc>,
) -> Result<ApprovalGroup, EngineError> {
    let mut group = group(tx, group_id)?;
    if !group.is_active {
        return Err(EngineError::invalid_state(format!(
            "group {group_id} is already deactivated"
        )));
    }
    group.is_active = false;
    group.deactivated_at = Some(now);
    tx.put(&group)?;

    info!(group_id, "approval group deactivated");
    Ok(group)
}

pub fn register_member(
    tx: &mut Tx<'_>,
    draft: NewMember,
    now: TimeStamp<Utc>,
) -> Result<GroupMember, EngineError> {
    let mut group = group(tx, &draft.group_id)?;
    if !group.is_active {
        return Err(EngineError::invalid_state(format!(
            "group {} is deactivated",
            group.id
        )));
    }
    let caps = draft.capabilities;
    if !(caps.can_approve || caps.can_reject || caps.can_raise_issues) {
        return Err(ValidationError::NoCapabilities.into());
    }
    if draft.role == MemberRole::FinalApprover && !caps.can_decide() {
        return Err(ValidationError::FinalApproverCannotDecide.into());
    }

    let existing = members(tx, &group.id)?;
    if existing
        .iter()
        .any(|m| m.is_active && m.user_id == draft.user_id)
    {
        return Err(EngineError::invalid_state(format!(
            "user {} already holds an active seat in group {}",
            draft.user_id, group.id
        )));
    }
    if draft.role == MemberRole::FinalApprover
        && existing.iter().any(|m| m.is_active && m.is_final_approver())
    {
        return Err(EngineError::invalid_state(format!(
            "group {} already has an active final approver",
            group.id
        )));
    }

    let member = GroupMember {
        id: utils::new_uuid_to_bech32(MEMBER_HRP)?,
        group_id: group.id.clone(),
        user_id: draft.user_id,
        role: draft.role,
        capabilities: draft.capabilities,
        is_available: draft.is_available,
        is_active: true,
        joined_at: now,
        left_at: None,
    };
    tx.put(&member)?;
    touch_seats(tx, &mut group)?;

    info!(
        group_id = %member.group_id,
        member_id = %member.id,
        user_id = %member.user_id,
        role = ?member.role,
        "group member registered"
    );
    Ok(member)
}

pub fn deactivate_member(
    tx: &mut Tx<'_>,
    group_id: &str,
    member_id: &str,
    now: TimeStamp<Utc>,
) -> Result<GroupMember, EngineError> {
    let mut group = group(tx, group_id)?;
    let mut member = member(tx, group_id, member_id)?;
    if !member.is_active {
        return Err(EngineError::invalid_state(format!(
            "member {member_id} is already inactive"
        )));
    }
    member.is_active = false;
    member.left_at = Some(now);
    tx.put(&member)?;
    touch_seats(tx, &mut group)?;

    info!(group_id, member_id, "group member deactivated");
    Ok(member)
}

pub fn set_availability(
    tx: &mut Tx<'_>,
    group_id: &str,
    member_id: &str,
    available: bool,
) -> Result<GroupMember, EngineError> {
    let mut group = group(tx, group_id)?;
    let mut member = member(tx, group_id, member_id)?;
    member.is_available = available;
    tx.put(&member)?;
    touch_seats(tx, &mut group)?;
    Ok(member)
}
