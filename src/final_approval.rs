//! The binding decision of the final approver.
//!
//! This is the only path that moves an application into a terminal status, and
//! there is at most one record per application: the key is the application id.
use chrono::Utc;
use tracing::info;

use crate::application::Application;
use crate::assignment::Assignment;
use crate::config::{EngineConfig, FinalRejectGate};
use crate::decision::{self, Decision, DecisionStatus};
use crate::error::EngineError;
use crate::statistics::Statistics;
use crate::store::{Record, Tx, keys};
use crate::types::{TimeStamp, Verdict};
use crate::utils::{self, FINAL_APPROVAL_HRP};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalOutcome {
    #[n(0)]
    Approved,
    #[n(1)]
    Rejected,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct FinalApproval {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub application_id: String,
    #[n(2)]
    pub assignment_id: String,
    #[n(3)]
    pub decision_id: String,
    #[n(4)]
    pub member_id: String,
    #[n(5)]
    pub approver_user_id: String,
    #[n(6)]
    pub decision: FinalOutcome,
    #[n(7)]
    pub decision_at: TimeStamp<Utc>,
    #[n(8)]
    pub comment: Option<String>,
    #[n(9)]
    pub ledger_digest: String, // sha256 over the CBOR ledger the decision rested on
}

impl Record for FinalApproval {
    fn key(&self) -> String {
        keys::final_approval(&self.application_id)
    }
}

pub fn for_application(
    tx: &mut Tx<'_>,
    application_id: &str,
) -> Result<Option<FinalApproval>, EngineError> {
    Ok(tx.get(&keys::final_approval(application_id))?)
}

/// Whether the final approver may give `verdict` right now.
pub fn check_gate(
    config: &EngineConfig,
    assignment: &Assignment,
    stats: &Statistics,
    verdict: Verdict,
) -> Result<(), EngineError> {
    let open = stats.open_issues();
    if open > 0 {
        return Err(EngineError::invalid_state(format!(
            "{open} issue(s) are still open on assignment {}",
            assignment.id
        )));
    }

    let ready = assignment.ready_for_final_approval;
    match verdict {
        Verdict::Approve if !ready => Err(EngineError::invalid_state(format!(
            "assignment {} is not ready for final approval ({} of {} approved, {} rejected)",
            assignment.id, stats.approved, stats.total_members, stats.rejected
        ))),
        Verdict::Reject if !ready => match config.final_reject_gate {
            FinalRejectGate::AllDecided if stats.all_decided() => Ok(()),
            FinalRejectGate::AllDecided => Err(EngineError::invalid_state(format!(
                "{} regular member(s) have not decided on assignment {}",
                stats.pending, assignment.id
            ))),
            FinalRejectGate::Ready => Err(EngineError::invalid_state(format!(
                "assignment {} is not ready for a final decision",
                assignment.id
            ))),
        },
        _ => Ok(()),
    }
}

/// Record the final approver's verdict and move the application to the
/// matching terminal status.
pub fn record(
    tx: &mut Tx<'_>,
    application: &mut Application,
    assignment: &mut Assignment,
    decision: &Decision,
    now: TimeStamp<Utc>,
) -> Result<FinalApproval, EngineError> {
    if let Some(existing) = for_application(tx, &application.id)? {
        return Err(EngineError::invalid_state(format!(
            "application {} already has a final decision ({})",
            application.id, existing.id
        )));
    }
    let outcome = match decision.status {
        DecisionStatus::Approved => FinalOutcome::Approved,
        DecisionStatus::Rejected => FinalOutcome::Rejected,
        status => {
            return Err(EngineError::invalid_state(format!(
                "decision {} is {status:?}, not a final verdict",
                decision.id
            )));
        }
    };

    let ledger = decision::decisions_of(tx, &assignment.id)?;
    let (ledger_digest, _) = utils::cbor_digest(&ledger)?;

    let record = FinalApproval {
        id: utils::new_uuid_to_bech32(FINAL_APPROVAL_HRP)?,
        application_id: application.id.clone(),
        assignment_id: assignment.id.clone(),
        decision_id: decision.id.clone(),
        member_id: decision.member_id.clone(),
        approver_user_id: decision.user_id.clone(),
        decision: outcome,
        decision_at: now.clone(),
        comment: decision.comment.clone(),
        ledger_digest,
    };
    tx.put(&record)?;

    application.finalize(outcome, now.clone());
    assignment.complete(&decision.id, now);

    info!(
        application_id = %application.id,
        final_approval_id = %record.id,
        outcome = ?outcome,
        "final decision recorded"
    );
    Ok(record)
}

/// Delete the application's final approval, if any, and return it.
pub fn withdraw(
    tx: &mut Tx<'_>,
    application_id: &str,
) -> Result<Option<FinalApproval>, EngineError> {
    let existing = for_application(tx, application_id)?;
    if let Some(record) = &existing {
        tx.delete(&record.key());
        info!(
            application_id,
            final_approval_id = %record.id,
            "final decision withdrawn"
        );
    }
    Ok(existing)
}
