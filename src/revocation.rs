//! Reversal of a recorded decision.
//!
//! Revoking a decision always re-derives the review from the ledger: any final
//! decision on the application is withdrawn (its validity rested on the whole
//! ledger staying put), the application returns to `UnderReview` and readiness
//! is recomputed. The handler does not care who revokes, only what is revoked.
use chrono::Utc;
use tracing::info;

use crate::application::ApplicationStatus;
use crate::assignment;
use crate::decision::{self, Decision, DecisionStatus};
use crate::error::{EngineError, Entity};
use crate::final_approval;
use crate::registry;
use crate::statistics;
use crate::store::{Record, Tx, keys};
use crate::types::TimeStamp;
use crate::utils::{self, REVOCATION_HRP};

/// Append-only audit entry for one revocation.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DecisionRevocation {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub decision_id: String,
    #[n(2)]
    pub assignment_id: String,
    #[n(3)]
    pub application_id: String,
    #[n(4)]
    pub member_id: String,
    #[n(5)]
    pub previous_status: DecisionStatus,
    #[n(6)]
    pub reason: String,
    #[n(7)]
    pub revoked_by: String,
    #[n(8)]
    pub revoked_at: TimeStamp<Utc>,
}

impl Record for DecisionRevocation {
    fn key(&self) -> String {
        keys::revocation(&self.assignment_id, &self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationOutcome {
    pub previous_status: ApplicationStatus,
    pub new_status: ApplicationStatus,
    pub was_final_approver: bool,
    pub ready_for_final_approval: bool,
    pub previous_decision: DecisionStatus,
    pub final_approval_withdrawn: bool,
}

/// Revocations on the assignment, oldest first.
pub fn revocations_of(
    tx: &mut Tx<'_>,
    assignment_id: &str,
) -> Result<Vec<DecisionRevocation>, EngineError> {
    let mut entries: Vec<DecisionRevocation> = tx.scan(&keys::revocations_of(assignment_id))?;
    entries.sort_by_key(|entry| entry.revoked_at.to_datetime_utc());
    Ok(entries)
}

fn append_audit(
    tx: &mut Tx<'_>,
    decision: &Decision,
    previous_status: DecisionStatus,
    revoked_by: &str,
    reason: &str,
    now: TimeStamp<Utc>,
) -> Result<DecisionRevocation, EngineError> {
    let entry = DecisionRevocation {
        id: utils::new_uuid_to_bech32(REVOCATION_HRP)?,
        decision_id: decision.id.clone(),
        assignment_id: decision.assignment_id.clone(),
        application_id: decision.application_id.clone(),
        member_id: decision.member_id.clone(),
        previous_status,
        reason: reason.to_string(),
        revoked_by: revoked_by.to_string(),
        revoked_at: now,
    };
    tx.put(&entry)?;
    Ok(entry)
}

pub fn revoke(
    tx: &mut Tx<'_>,
    application_id: &str,
    user_id: &str,
    reason: &str,
    now: TimeStamp<Utc>,
) -> Result<RevocationOutcome, EngineError> {
    let mut review = assignment::load_review(tx, application_id)?;
    let member = registry::active_member(tx, &review.group.id, user_id)?;

    let mut revoked = decision::for_member(tx, &review.assignment.id, &member.id)?
        .ok_or_else(|| {
            EngineError::not_found(
                Entity::Decision,
                format!("{} on assignment {}", member.id, review.assignment.id),
            )
        })?;
    // read before anything below touches the decision
    let previous_decision = revoked.status;
    let previous_status = review.application.status;

    if !previous_decision.is_decided() {
        return Err(EngineError::invalid_state(format!(
            "decision {} is {previous_decision:?}, there is nothing to revoke",
            revoked.id
        )));
    }

    let withdrawn = final_approval::withdraw(tx, &review.application.id)?;
    if let Some(final_record) = &withdrawn {
        review.assignment.reopen();

        // the final approver's verdict rested on the decision being revoked;
        // retire it too so the final approver can decide again
        if final_record.decision_id != revoked.id {
            if let Some(mut linked) =
                decision::for_member(tx, &review.assignment.id, &final_record.member_id)?
            {
                if linked.status.is_decided() {
                    let cascade_reason =
                        format!("superseded by revocation of decision {}: {reason}", revoked.id);
                    let linked_previous = linked.revoke(user_id, &cascade_reason, now.clone())?;
                    tx.put(&linked)?;
                    append_audit(tx, &linked, linked_previous, user_id, &cascade_reason, now.clone())?;
                }
            }
        }
    }

    revoked.revoke(user_id, reason, now.clone())?;
    tx.put(&revoked)?;
    append_audit(tx, &revoked, previous_decision, user_id, reason, now.clone())?;

    let stats = statistics::recompute(tx, &mut review.assignment, &review.group, &now)?;
    review.application.reset_to_review();
    review.save(tx)?;

    info!(
        application_id,
        user_id,
        decision_id = %revoked.id,
        previous = ?previous_decision,
        final_approval_withdrawn = withdrawn.is_some(),
        pending = stats.pending,
        ready = review.assignment.ready_for_final_approval,
        "decision revoked"
    );

    Ok(RevocationOutcome {
        previous_status,
        new_status: review.application.status,
        was_final_approver: member.is_final_approver(),
        ready_for_final_approval: review.assignment.ready_for_final_approval,
        previous_decision,
        final_approval_withdrawn: withdrawn.is_some(),
    })
}
