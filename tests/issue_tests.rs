mod common;

use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use common::{Fixture, is_invalid_state, is_unauthorized, user};
use permit_approval::{
    config::EngineConfig,
    error::{EngineError, ValidationError},
    issue::{IssueAssignment, IssueAssignmentType, IssueFilter, IssuePriority, NewIssue},
    registry::{Capabilities, NewMember},
    threads::DiscussionThreads,
};

/// Records every call so the tests can check what reached the thread seam.
#[derive(Default)]
struct RecordingThreads {
    opened: Mutex<Vec<String>>,
    mirrored: Mutex<Vec<(String, bool)>>,
    fail_open: bool,
    fail_mirror: bool,
}

impl DiscussionThreads for RecordingThreads {
    fn open_thread(&self, issue_id: &str, _title: &str) -> anyhow::Result<String> {
        if self.fail_open {
            return Err(anyhow!("chat service unavailable"));
        }
        let thread_id = format!("chat-{issue_id}");
        self.opened
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .push(thread_id.clone());
        Ok(thread_id)
    }

    fn mark_resolved(&self, thread_id: &str, resolved: bool) -> anyhow::Result<()> {
        if self.fail_mirror {
            return Err(anyhow!("chat service unavailable"));
        }
        self.mirrored
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .push((thread_id.to_string(), resolved));
        Ok(())
    }
}

#[test]
fn collaborative_issue_is_resolvable_by_any_member() -> anyhow::Result<()> {
    let fx = Fixture::assigned("collaborative_any_member")?;

    let issue = fx.service.raise_issue(
        fx.app(),
        &fx.m2.user_id,
        NewIssue::collaborative("fire access", "no turning circle")
            .set_priority(IssuePriority::Critical),
    )?;
    assert_eq!(issue.assignment, IssueAssignment::Collaborative);
    assert_eq!(issue.raised_by_member_id, fx.m2.id);
    assert!(
        issue
            .thread_id
            .as_deref()
            .is_some_and(|t| t.starts_with("thread_1"))
    );

    assert!(is_unauthorized(
        &fx.service.resolve_issue(&issue.id, &user()?, None)
    ));

    // the final approver sits in the group too
    let resolved = fx.service.resolve_issue(&issue.id, &fx.m3.user_id, None)?;
    assert!(resolved.is_resolved);

    let assignment = fx.assignment()?;
    assert_eq!(assignment.statistics.issues_raised, 1);
    assert_eq!(assignment.statistics.issues_resolved, 1);
    Ok(())
}

#[test]
fn specific_user_issue_is_resolvable_only_by_that_user() -> anyhow::Result<()> {
    let fx = Fixture::assigned("specific_user_issue")?;
    let engineer = user()?;

    let issue = fx.service.raise_issue(
        fx.app(),
        &fx.m1.user_id,
        NewIssue::for_user("load calc", "structural engineer to confirm", &engineer),
    )?;

    assert!(is_unauthorized(
        &fx.service.resolve_issue(&issue.id, &fx.m1.user_id, None)
    ));
    assert!(is_unauthorized(
        &fx.service.resolve_issue(&issue.id, &fx.m3.user_id, None)
    ));

    // no seat in the group needed
    let resolved = fx
        .service
        .resolve_issue(&issue.id, &engineer, Some("calc attached".into()))?;
    assert_eq!(resolved.resolution.as_deref(), Some("calc attached"));
    Ok(())
}

#[test]
fn resolving_twice_is_rejected_without_side_effects() -> anyhow::Result<()> {
    let fx = Fixture::assigned("resolve_twice")?;
    let issue = fx.service.raise_issue(
        fx.app(),
        &fx.m1.user_id,
        NewIssue::collaborative("parking", "two spaces short"),
    )?;
    let first = fx
        .service
        .resolve_issue(&issue.id, &fx.m1.user_id, Some("variance granted".into()))?;
    let assignment = fx.assignment()?;

    assert!(is_invalid_state(
        &fx.service.resolve_issue(&issue.id, &fx.m2.user_id, None)
    ));
    assert_eq!(fx.service.issue(&issue.id)?, first);
    assert_eq!(fx.assignment()?, assignment);
    Ok(())
}

#[test]
fn reopening_an_issue_retracts_readiness() -> anyhow::Result<()> {
    let fx = Fixture::assigned("reopen_issue")?;
    fx.service.approve(fx.app(), &fx.m1.user_id, None)?;
    fx.service.approve(fx.app(), &fx.m2.user_id, None)?;

    let issue = fx.service.raise_issue(
        fx.app(),
        &fx.m3.user_id,
        NewIssue::for_member("heritage overlay", "check the overlay", &fx.m1.id),
    )?;
    assert!(!fx.assignment()?.ready_for_final_approval);

    fx.service.resolve_issue(&issue.id, &fx.m1.user_id, None)?;
    let ready = fx.assignment()?;
    assert!(ready.ready_for_final_approval);
    assert!(ready.final_approver_assigned_at.is_some());

    let reopened = fx.service.reopen_issue(&issue.id, &fx.m1.user_id)?;
    assert!(!reopened.is_resolved);
    assert!(reopened.resolved_at.is_none());

    let assignment = fx.assignment()?;
    assert!(!assignment.ready_for_final_approval);
    assert!(assignment.final_approver_assigned_at.is_none());
    assert_eq!(assignment.statistics.open_issues(), 1);

    assert!(is_unauthorized(
        &fx.service.reopen_issue(&issue.id, &fx.m2.user_id)
    ));
    assert!(is_invalid_state(
        &fx.service.reopen_issue(&issue.id, &fx.m1.user_id)
    ));
    Ok(())
}

#[test]
fn malformed_issues_are_rejected_before_writing() -> anyhow::Result<()> {
    let fx = Fixture::assigned("malformed_issues")?;

    let empty = fx.service.raise_issue(
        fx.app(),
        &fx.m1.user_id,
        NewIssue::collaborative("   ", "no title"),
    );
    assert!(matches!(
        empty,
        Err(EngineError::Validation(ValidationError::EmptyTitle))
    ));

    let mut both = NewIssue::for_member("t", "d", &fx.m2.id);
    both.assigned_user_id = Some(fx.m2.user_id.clone());
    assert!(matches!(
        fx.service.raise_issue(fx.app(), &fx.m1.user_id, both),
        Err(EngineError::Validation(ValidationError::AssigneeMismatch(
            IssueAssignmentType::GroupMember
        )))
    ));

    let stranger = NewIssue::for_member("t", "d", "member_unknown");
    assert!(matches!(
        fx.service.raise_issue(fx.app(), &fx.m1.user_id, stranger),
        Err(EngineError::Validation(ValidationError::AssigneeNotInGroup(_)))
    ));

    let observer = fx.service.register_member(
        NewMember::regular(&fx.group.id, &user()?).set_capabilities(Capabilities {
            can_approve: false,
            can_reject: false,
            can_raise_issues: true,
        }),
    )?;
    assert!(matches!(
        fx.service.raise_issue(
            fx.app(),
            &fx.m1.user_id,
            NewIssue::for_member("t", "d", &observer.id)
        ),
        Err(EngineError::Validation(
            ValidationError::AssigneeLacksCapability(_)
        ))
    ));

    assert!(fx.service.issues(fx.app(), &IssueFilter::default())?.is_empty());
    Ok(())
}

#[test]
fn raising_requires_the_capability() -> anyhow::Result<()> {
    let fx = Fixture::assigned("raise_capability")?;
    let quiet = fx.service.register_member(
        NewMember::regular(&fx.group.id, &user()?).set_capabilities(Capabilities {
            can_approve: true,
            can_reject: true,
            can_raise_issues: false,
        }),
    )?;

    let attempt = fx.service.raise_issue(
        fx.app(),
        &quiet.user_id,
        NewIssue::collaborative("t", "d"),
    );
    assert!(is_unauthorized(&attempt));
    assert!(is_unauthorized(&fx.service.raise_issue(
        fx.app(),
        &user()?,
        NewIssue::collaborative("t", "d")
    )));
    Ok(())
}

#[test]
fn issues_are_frozen_once_the_review_completes() -> anyhow::Result<()> {
    let fx = Fixture::assigned("issues_after_completion")?;
    fx.service.approve(fx.app(), &fx.m1.user_id, None)?;
    fx.service.approve(fx.app(), &fx.m2.user_id, None)?;
    fx.service.approve(fx.app(), &fx.m3.user_id, None)?;

    assert!(is_invalid_state(&fx.service.raise_issue(
        fx.app(),
        &fx.m1.user_id,
        NewIssue::collaborative("late", "after the fact")
    )));
    Ok(())
}

#[test]
fn blocking_config_stops_regular_decisions() -> anyhow::Result<()> {
    let config = EngineConfig {
        block_regular_decisions_on_open_issues: true,
        ..EngineConfig::default()
    };
    let fx = Fixture::with_config("blocking_config", config)?;
    fx.assign()?;

    let issue = fx.service.raise_issue(
        fx.app(),
        &fx.m1.user_id,
        NewIssue::collaborative("survey", "boundary survey outdated"),
    )?;
    assert!(is_invalid_state(
        &fx.service.approve(fx.app(), &fx.m2.user_id, None)
    ));

    fx.service.resolve_issue(&issue.id, &fx.m1.user_id, None)?;
    fx.service.approve(fx.app(), &fx.m2.user_id, None)?;
    Ok(())
}

#[test]
fn thread_seam_sees_opening_and_resolution() -> anyhow::Result<()> {
    let fx = Fixture::assigned("thread_seam")?;
    let threads = Arc::new(RecordingThreads::default());
    let service = permit_approval::service::ApprovalService::new(fx.db.clone())
        .with_threads(threads.clone());

    let issue = service.raise_issue(
        fx.app(),
        &fx.m1.user_id,
        NewIssue::collaborative("noise", "plant room noise report"),
    )?;
    let thread_id = issue.thread_id.clone().context("thread id missing")?;
    assert_eq!(thread_id, format!("chat-{}", issue.id));
    assert_eq!(threads.opened.lock().map_err(|_| anyhow!("poisoned"))?.len(), 1);

    service.resolve_issue(&issue.id, &fx.m2.user_id, None)?;
    service.reopen_issue(&issue.id, &fx.m2.user_id)?;

    let mirrored = threads.mirrored.lock().map_err(|_| anyhow!("poisoned"))?;
    assert_eq!(
        *mirrored,
        vec![(thread_id.clone(), true), (thread_id, false)]
    );
    Ok(())
}

#[test]
fn thread_failures() -> anyhow::Result<()> {
    let fx = Fixture::assigned("thread_failures")?;

    let broken = permit_approval::service::ApprovalService::new(fx.db.clone()).with_threads(
        Arc::new(RecordingThreads {
            fail_open: true,
            ..RecordingThreads::default()
        }),
    );
    let attempt = broken.raise_issue(
        fx.app(),
        &fx.m1.user_id,
        NewIssue::collaborative("t", "d"),
    );
    assert!(matches!(attempt, Err(EngineError::Internal(_))));
    assert!(fx.service.issues(fx.app(), &IssueFilter::default())?.is_empty());

    // mirroring is best effort
    let mute = permit_approval::service::ApprovalService::new(fx.db.clone()).with_threads(
        Arc::new(RecordingThreads {
            fail_mirror: true,
            ..RecordingThreads::default()
        }),
    );
    let issue = mute.raise_issue(fx.app(), &fx.m1.user_id, NewIssue::collaborative("t", "d"))?;
    let resolved = mute.resolve_issue(&issue.id, &fx.m1.user_id, None)?;
    assert!(resolved.is_resolved);
    Ok(())
}

#[test]
fn refused_raises_open_no_thread() -> anyhow::Result<()> {
    let fx = Fixture::assigned("refused_raise_threads")?;
    let threads = Arc::new(RecordingThreads::default());
    let service = permit_approval::service::ApprovalService::new(fx.db.clone())
        .with_threads(threads.clone());

    assert!(is_unauthorized(&service.raise_issue(
        fx.app(),
        &user()?,
        NewIssue::collaborative("t", "d")
    )));
    assert!(matches!(
        service.raise_issue(fx.app(), &fx.m1.user_id, NewIssue::collaborative(" ", "d")),
        Err(EngineError::Validation(ValidationError::EmptyTitle))
    ));
    assert!(matches!(
        service.raise_issue(
            fx.app(),
            &fx.m1.user_id,
            NewIssue::for_member("t", "d", "member_unknown")
        ),
        Err(EngineError::Validation(ValidationError::AssigneeNotInGroup(_)))
    ));
    assert!(threads.opened.lock().map_err(|_| anyhow!("poisoned"))?.is_empty());

    let issue = service.raise_issue(fx.app(), &fx.m1.user_id, NewIssue::collaborative("t", "d"))?;
    let opened = threads.opened.lock().map_err(|_| anyhow!("poisoned"))?;
    assert_eq!(*opened, vec![issue.thread_id.context("thread id missing")?]);
    Ok(())
}
