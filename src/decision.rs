//! Decision ledger: one decision per member per assignment.
//!
//! ```text
//! Pending --approve--> Approved --revoke--> Revoked --redecide--> Pending
//!         --reject---> Rejected --revoke-->
//! ```
//!
//! A revoked decision stays in the ledger with its audit fields as a tombstone
//! and counts as pending everywhere. When the member decides again the
//! decision passes back through `Pending` first.
use chrono::Utc;
use tracing::{debug, info};

use crate::application::ApplicationStatus;
use crate::assignment::{self, Assignment};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::final_approval;
use crate::registry::{self, GroupMember};
use crate::statistics;
use crate::store::{Record, Tx, keys};
use crate::types::{TimeStamp, Verdict};
use crate::utils::{self, DECISION_HRP};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Revoked,
}

impl DecisionStatus {
    pub fn can_transition_to(self, next: DecisionStatus) -> bool {
        use DecisionStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Approved, Revoked)
                | (Rejected, Revoked)
                | (Revoked, Pending)
        )
    }
    pub fn is_decided(self) -> bool {
        matches!(self, DecisionStatus::Approved | DecisionStatus::Rejected)
    }
}

impl From<Verdict> for DecisionStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Approve => DecisionStatus::Approved,
            Verdict::Reject => DecisionStatus::Rejected,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub assignment_id: String,
    #[n(2)]
    pub application_id: String,
    #[n(3)]
    pub member_id: String,
    #[n(4)]
    pub user_id: String,
    #[n(5)]
    pub status: DecisionStatus,
    #[n(6)]
    pub comment: Option<String>,
    #[n(7)]
    pub decided_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub is_final_approver_decision: bool,
    #[n(9)]
    pub was_available: bool, // member availability when the verdict was given
    #[n(10)]
    pub revoked_by: Option<String>,
    #[n(11)]
    pub revoked_at: Option<TimeStamp<Utc>>,
    #[n(12)]
    pub revocation_reason: Option<String>,
    #[n(13)]
    pub created_at: TimeStamp<Utc>,
}

impl Record for Decision {
    fn key(&self) -> String {
        keys::decision(&self.assignment_id, &self.member_id)
    }
}

impl Decision {
    pub fn pending(
        assignment: &Assignment,
        member: &GroupMember,
        now: TimeStamp<Utc>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32(DECISION_HRP)?,
            assignment_id: assignment.id.clone(),
            application_id: assignment.application_id.clone(),
            member_id: member.id.clone(),
            user_id: member.user_id.clone(),
            status: DecisionStatus::Pending,
            comment: None,
            decided_at: None,
            is_final_approver_decision: member.is_final_approver(),
            was_available: member.is_available,
            revoked_by: None,
            revoked_at: None,
            revocation_reason: None,
            created_at: now,
        })
    }

    /// The status as the readiness gate sees it: revoked counts as pending.
    pub fn effective_status(&self) -> DecisionStatus {
        match self.status {
            DecisionStatus::Revoked => DecisionStatus::Pending,
            status => status,
        }
    }

    fn transition(&mut self, next: DecisionStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::invalid_state(format!(
                "decision {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn decide(
        &mut self,
        verdict: Verdict,
        comment: Option<String>,
        member: &GroupMember,
        now: TimeStamp<Utc>,
    ) -> Result<(), EngineError> {
        if self.status.is_decided() {
            return Err(EngineError::invalid_state(format!(
                "member {} has already decided ({:?})",
                self.member_id, self.status
            )));
        }
        if self.status == DecisionStatus::Revoked {
            self.transition(DecisionStatus::Pending)?;
        }

        self.transition(verdict.into())?;
        self.comment = comment;
        self.decided_at = Some(now);
        self.was_available = member.is_available;
        Ok(())
    }

    /// Returns the status held before the revocation.
    pub fn revoke(
        &mut self,
        revoked_by: &str,
        reason: &str,
        now: TimeStamp<Utc>,
    ) -> Result<DecisionStatus, EngineError> {
        let previous = self.status;
        match previous {
            DecisionStatus::Revoked => {
                return Err(EngineError::invalid_state(format!(
                    "decision {} is already revoked",
                    self.id
                )));
            }
            DecisionStatus::Pending => {
                return Err(EngineError::invalid_state(format!(
                    "decision {} is pending, there is nothing to revoke",
                    self.id
                )));
            }
            _ => {}
        }

        self.transition(DecisionStatus::Revoked)?;
        self.revoked_by = Some(revoked_by.to_string());
        self.revoked_at = Some(now);
        self.revocation_reason = Some(reason.to_string());
        Ok(previous)
    }
}

/// Typed filter for ledger reads. Unset fields match everything.
///
/// `status` matches the stored status, so `Revoked` finds tombstones.
/// `effective_status` matches what counters and readiness see, so `Pending`
/// also finds revoked decisions.
#[derive(Debug, Clone, Default)]
pub struct DecisionFilter {
    pub status: Option<DecisionStatus>,
    pub effective_status: Option<DecisionStatus>,
    pub member_id: Option<String>,
    pub final_approver: Option<bool>,
}

impl DecisionFilter {
    pub fn with_status(mut self, status: DecisionStatus) -> Self {
        self.status = Some(status);
        self
    }
    pub fn with_effective_status(mut self, status: DecisionStatus) -> Self {
        self.effective_status = Some(status);
        self
    }
    pub fn for_member(mut self, member_id: &str) -> Self {
        self.member_id = Some(member_id.to_string());
        self
    }
    pub fn final_approver(mut self, final_approver: bool) -> Self {
        self.final_approver = Some(final_approver);
        self
    }

    pub fn matches(&self, decision: &Decision) -> bool {
        self.status.is_none_or(|s| decision.status == s)
            && self
                .effective_status
                .is_none_or(|s| decision.effective_status() == s)
            && self
                .member_id
                .as_ref()
                .is_none_or(|m| &decision.member_id == m)
            && self
                .final_approver
                .is_none_or(|f| decision.is_final_approver_decision == f)
    }
}

pub fn decisions_of(tx: &mut Tx<'_>, assignment_id: &str) -> Result<Vec<Decision>, EngineError> {
    Ok(tx.scan(&keys::decisions_of(assignment_id))?)
}

pub fn find(
    tx: &mut Tx<'_>,
    assignment_id: &str,
    filter: &DecisionFilter,
) -> Result<Vec<Decision>, EngineError> {
    Ok(decisions_of(tx, assignment_id)?
        .into_iter()
        .filter(|d| filter.matches(d))
        .collect())
}

pub fn for_member(
    tx: &mut Tx<'_>,
    assignment_id: &str,
    member_id: &str,
) -> Result<Option<Decision>, EngineError> {
    Ok(tx.get(&keys::decision(assignment_id, member_id))?)
}

/// The member's decision, staging a pending one if the member has none yet.
pub fn ensure_for_member(
    tx: &mut Tx<'_>,
    assignment: &Assignment,
    member: &GroupMember,
    now: TimeStamp<Utc>,
) -> Result<Decision, EngineError> {
    if let Some(decision) = for_member(tx, &assignment.id, &member.id)? {
        return Ok(decision);
    }

    let decision = Decision::pending(assignment, member, now)?;
    tx.put(&decision)?;
    debug!(
        assignment_id = %assignment.id,
        member_id = %member.id,
        "pending decision created lazily"
    );
    Ok(decision)
}

/// Result of recording a verdict.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub application_status: ApplicationStatus,
    pub is_final_approver: bool,
    pub ready_for_final_approval: bool,
    pub approved_count: u32,
    pub rejected_count: u32,
    pub total_members: u32,
    pub unresolved_issues: u32,
    pub rejection_recommended: bool,
}

/// Record `user_id`'s verdict on the application's active assignment.
///
/// A regular member's verdict only feeds the counters and readiness. The final
/// approver's verdict is gated on readiness and open issues and, once given,
/// completes the assignment and sets the terminal application status.
pub fn record(
    tx: &mut Tx<'_>,
    config: &EngineConfig,
    application_id: &str,
    user_id: &str,
    verdict: Verdict,
    comment: Option<String>,
    now: TimeStamp<Utc>,
) -> Result<DecisionOutcome, EngineError> {
    let mut review = assignment::load_review(tx, application_id)?;
    assignment::ensure_open(&review.assignment)?;

    let member = registry::active_member(tx, &review.group.id, user_id)?;
    if !member.capabilities.permits(verdict) {
        return Err(EngineError::unauthorized(format!(
            "member {} may not {verdict:?}",
            member.id
        )));
    }

    // gate on the ledger as it is, not on whatever the cache says
    let before = statistics::recompute(tx, &mut review.assignment, &review.group, &now)?;
    if member.is_final_approver() {
        final_approval::check_gate(config, &review.assignment, &before, verdict)?;
    } else if config.block_regular_decisions_on_open_issues && before.open_issues() > 0 {
        return Err(EngineError::invalid_state(format!(
            "{} issue(s) must be resolved before deciding",
            before.open_issues()
        )));
    }

    let mut decision = ensure_for_member(tx, &review.assignment, &member, now.clone())?;
    decision.decide(verdict, comment, &member, now.clone())?;
    tx.put(&decision)?;

    if member.is_final_approver() {
        final_approval::record(
            tx,
            &mut review.application,
            &mut review.assignment,
            &decision,
            now.clone(),
        )?;
    }

    let stats = statistics::recompute(tx, &mut review.assignment, &review.group, &now)?;
    review.save(tx)?;

    info!(
        application_id,
        user_id,
        verdict = ?verdict,
        final_approver = member.is_final_approver(),
        approved = stats.approved,
        total = stats.total_members,
        ready = review.assignment.ready_for_final_approval,
        "decision recorded"
    );

    Ok(DecisionOutcome {
        decision,
        application_status: review.application.status,
        is_final_approver: member.is_final_approver(),
        ready_for_final_approval: review.assignment.ready_for_final_approval,
        approved_count: stats.approved,
        rejected_count: stats.rejected,
        total_members: stats.total_members,
        unresolved_issues: stats.open_issues(),
        rejection_recommended: stats.rejection_recommended(),
    })
}
