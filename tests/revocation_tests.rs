mod common;

use common::{Fixture, is_invalid_state, is_unauthorized, user};
use permit_approval::{
    application::ApplicationStatus,
    decision::{DecisionFilter, DecisionStatus},
    error::{EngineError, Entity},
};

#[test]
fn revocation_retracts_readiness() -> anyhow::Result<()> {
    let fx = Fixture::assigned("revoke_ripple")?;
    fx.service.approve(fx.app(), &fx.m1.user_id, None)?;
    fx.service.approve(fx.app(), &fx.m2.user_id, None)?;
    assert!(fx.assignment()?.ready_for_final_approval);

    let outcome = fx
        .service
        .revoke_decision(fx.app(), &fx.m1.user_id, "wrong parcel")?;
    assert!(!outcome.final_approval_withdrawn);
    assert_eq!(outcome.previous_status, ApplicationStatus::UnderReview);
    assert!(!outcome.ready_for_final_approval);

    let assignment = fx.assignment()?;
    assert!(!assignment.ready_for_final_approval);
    assert!(assignment.final_approver_assigned_at.is_none());
    assert_eq!(assignment.statistics.approved, 1);
    assert_eq!(assignment.statistics.pending, 1);

    // and the final approver is locked out again
    assert!(is_invalid_state(
        &fx.service.approve(fx.app(), &fx.m3.user_id, None)
    ));
    Ok(())
}

#[test]
fn revocation_leaves_an_audit_entry() -> anyhow::Result<()> {
    let fx = Fixture::assigned("revoke_audit")?;
    fx.service.reject(fx.app(), &fx.m2.user_id, None)?;
    fx.service
        .revoke_decision(fx.app(), &fx.m2.user_id, "misread the survey")?;

    let entries = fx.service.revocations(fx.app())?;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.member_id, fx.m2.id);
    assert_eq!(entry.previous_status, DecisionStatus::Rejected);
    assert_eq!(entry.reason, "misread the survey");
    assert_eq!(entry.revoked_by, fx.m2.user_id);

    // the ledger row is kept, not deleted
    let revoked = fx
        .service
        .decisions(fx.app(), &DecisionFilter::default().with_status(DecisionStatus::Revoked))?;
    assert_eq!(revoked.len(), 1);
    assert_eq!(revoked[0].id, entry.decision_id);
    assert_eq!(fx.service.decisions(fx.app(), &DecisionFilter::default())?.len(), 2);
    Ok(())
}

#[test]
fn final_approver_can_revoke_own_verdict() -> anyhow::Result<()> {
    let fx = Fixture::assigned("revoke_final")?;
    fx.service.approve(fx.app(), &fx.m1.user_id, None)?;
    fx.service.approve(fx.app(), &fx.m2.user_id, None)?;
    fx.service.approve(fx.app(), &fx.m3.user_id, None)?;

    let outcome = fx
        .service
        .revoke_decision(fx.app(), &fx.m3.user_id, "conditions missing")?;
    assert!(outcome.was_final_approver);
    assert!(outcome.final_approval_withdrawn);
    // regular approvals still stand
    assert!(outcome.ready_for_final_approval);
    assert_eq!(outcome.new_status, ApplicationStatus::UnderReview);
    assert_eq!(fx.service.revocations(fx.app())?.len(), 1);

    let again = fx
        .service
        .approve(fx.app(), &fx.m3.user_id, Some("with conditions".into()))?;
    assert_eq!(again.application_status, ApplicationStatus::Approved);
    Ok(())
}

#[test]
fn revoking_pending_or_missing_decisions_fails() -> anyhow::Result<()> {
    let fx = Fixture::assigned("revoke_errors")?;

    // seeded but undecided
    assert!(is_invalid_state(
        &fx.service.revoke_decision(fx.app(), &fx.m1.user_id, "r")
    ));

    // the final approver has no decision before deciding
    let missing = fx.service.revoke_decision(fx.app(), &fx.m3.user_id, "r");
    assert!(matches!(
        missing,
        Err(EngineError::NotFound {
            entity: Entity::Decision,
            ..
        })
    ));

    fx.service.approve(fx.app(), &fx.m1.user_id, None)?;
    fx.service.revoke_decision(fx.app(), &fx.m1.user_id, "r")?;
    assert!(is_invalid_state(
        &fx.service.revoke_decision(fx.app(), &fx.m1.user_id, "again")
    ));

    assert!(is_unauthorized(
        &fx.service.revoke_decision(fx.app(), &user()?, "r")
    ));
    assert!(matches!(
        fx.service.revoke_decision("app_missing", &fx.m1.user_id, "r"),
        Err(EngineError::NotFound {
            entity: Entity::Application,
            ..
        })
    ));
    Ok(())
}

#[test]
fn failed_revocation_changes_nothing() -> anyhow::Result<()> {
    let fx = Fixture::assigned("revoke_noop")?;
    fx.service.approve(fx.app(), &fx.m1.user_id, None)?;
    let before = fx.assignment()?;

    assert!(fx
        .service
        .revoke_decision(fx.app(), &fx.m2.user_id, "nothing to revoke")
        .is_err());

    assert_eq!(fx.assignment()?, before);
    assert!(fx.service.revocations(fx.app())?.is_empty());
    Ok(())
}

#[test]
fn approve_revoke_approve_lands_where_it_started() -> anyhow::Result<()> {
    let fx = Fixture::assigned("revoke_round_trip")?;

    let first = fx.service.approve(fx.app(), &fx.m1.user_id, None)?;
    let before = fx.assignment()?.statistics;

    fx.service
        .revoke_decision(fx.app(), &fx.m1.user_id, "wrong drawing set")?;
    let during = fx.assignment()?.statistics;
    assert_eq!(during.approved, before.approved - 1);
    assert_eq!(during.pending, before.pending + 1);

    // the revoked row is stored as Revoked but awaits a verdict like a pending one
    let awaiting = fx.service.decisions(
        fx.app(),
        &DecisionFilter::default().with_effective_status(DecisionStatus::Pending),
    )?;
    assert!(awaiting.iter().any(|d| d.member_id == fx.m1.id));
    assert!(
        fx.service
            .decisions(fx.app(), &DecisionFilter::default().with_status(DecisionStatus::Pending))?
            .iter()
            .all(|d| d.member_id != fx.m1.id)
    );

    let second = fx.service.approve(fx.app(), &fx.m1.user_id, None)?;
    assert_eq!(second.approved_count, first.approved_count);
    assert_eq!(second.total_members, first.total_members);
    assert_eq!(fx.assignment()?.statistics, before);
    assert!(fx.service.audit_statistics(fx.app())?.is_none());
    Ok(())
}
