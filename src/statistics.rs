//! Assignment counters as a projection of the ledger and the issue gate.
//!
//! Counters are never adjusted in place. Every mutating operation finishes by
//! calling [`recompute`], which rebuilds them from the records visible in the
//! current unit of work and derives readiness from the result. The copy kept
//! on the assignment is a read cache.
use chrono::Utc;
use tracing::{debug, warn};

use crate::assignment::Assignment;
use crate::decision::{self, Decision, DecisionStatus};
use crate::error::EngineError;
use crate::issue::{self, Issue};
use crate::registry::{self, ApprovalGroup, GroupMember};
use crate::store::Tx;
use crate::types::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    #[n(0)]
    pub approved: u32,
    #[n(1)]
    pub rejected: u32,
    #[n(2)]
    pub pending: u32, // includes revoked and not yet created decisions
    #[n(3)]
    pub total_members: u32, // active regular members only
    #[n(4)]
    pub issues_raised: u32,
    #[n(5)]
    pub issues_resolved: u32,
}

impl Statistics {
    /// Pure projection. Only active regular members that can approve or reject
    /// are counted; decisions of removed members, observers and the final
    /// approver are ignored.
    pub fn project(members: &[GroupMember], decisions: &[Decision], issues: &[Issue]) -> Self {
        let mut stats = Statistics::default();

        for member in members.iter().filter(|m| m.is_deciding_regular()) {
            stats.total_members += 1;
            let status = decisions
                .iter()
                .find(|d| d.member_id == member.id)
                .map(Decision::effective_status)
                .unwrap_or(DecisionStatus::Pending);

            match status {
                DecisionStatus::Approved => stats.approved += 1,
                DecisionStatus::Rejected => stats.rejected += 1,
                DecisionStatus::Pending | DecisionStatus::Revoked => stats.pending += 1,
            }
        }

        stats.issues_raised = issues.len() as u32;
        stats.issues_resolved = issues.iter().filter(|i| i.is_resolved).count() as u32;
        stats
    }

    pub fn open_issues(&self) -> u32 {
        self.issues_raised.saturating_sub(self.issues_resolved)
    }

    pub fn all_decided(&self) -> bool {
        self.pending == 0
    }

    /// Every regular member has decided and at least one rejected. Nothing is
    /// rejected automatically; this only informs the final approver.
    pub fn rejection_recommended(&self) -> bool {
        self.total_members > 0 && self.all_decided() && self.rejected > 0
    }

    pub fn is_ready(&self, group: &ApprovalGroup) -> bool {
        if self.rejected > 0 || self.open_issues() > 0 || self.total_members == 0 {
            return false;
        }
        if group.requires_all_approvals {
            self.approved == self.total_members
        } else {
            self.approved >= group.minimum_approvals.max(1)
        }
    }
}

/// Cached counters that disagree with a fresh projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatisticsDrift {
    pub cached: Statistics,
    pub actual: Statistics,
    pub cached_ready: bool,
    pub actual_ready: bool,
}

/// Rebuild the assignment's counters and readiness flag from the ledger.
/// Must run inside the unit of work that made the changes.
pub fn recompute(
    tx: &mut Tx<'_>,
    assignment: &mut Assignment,
    group: &ApprovalGroup,
    now: &TimeStamp<Utc>,
) -> Result<Statistics, EngineError> {
    let members = registry::members(tx, &group.id)?;
    let decisions = decision::decisions_of(tx, &assignment.id)?;
    let issues = issue::issues_of(tx, &assignment.id)?;

    let stats = Statistics::project(&members, &decisions, &issues);
    let ready = stats.is_ready(group);

    if ready && !assignment.ready_for_final_approval {
        assignment.final_approver_assigned_at = Some(now.clone());
    } else if !ready {
        assignment.final_approver_assigned_at = None;
    }
    assignment.ready_for_final_approval = ready;
    assignment.statistics = stats;

    debug!(
        assignment_id = %assignment.id,
        approved = stats.approved,
        rejected = stats.rejected,
        pending = stats.pending,
        open_issues = stats.open_issues(),
        ready,
        "statistics recomputed"
    );
    Ok(stats)
}

/// Compare the cached counters against a fresh projection without writing.
pub fn audit(
    tx: &mut Tx<'_>,
    assignment: &Assignment,
    group: &ApprovalGroup,
) -> Result<Option<StatisticsDrift>, EngineError> {
    let mut fresh = assignment.clone();
    let actual = recompute(tx, &mut fresh, group, &TimeStamp::new())?;

    if actual == assignment.statistics
        && fresh.ready_for_final_approval == assignment.ready_for_final_approval
    {
        return Ok(None);
    }

    warn!(
        assignment_id = %assignment.id,
        cached = ?assignment.statistics,
        actual = ?actual,
        "cached assignment statistics drifted from the ledger"
    );
    Ok(Some(StatisticsDrift {
        cached: assignment.statistics,
        actual,
        cached_ready: assignment.ready_for_final_approval,
        actual_ready: fresh.ready_for_final_approval,
    }))
}
