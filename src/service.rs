//! Service layer API for the approval workflow.
//!
//! Each method is one atomic unit of work against the sled database handed to
//! [`ApprovalService::new`]. Errors abort the unit and nothing it staged is
//! written.
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::application::{self, Application};
use crate::assignment::{self, Assignment};
use crate::config::EngineConfig;
use crate::decision::{self, Decision, DecisionFilter, DecisionOutcome};
use crate::error::EngineError;
use crate::final_approval::{self, FinalApproval};
use crate::issue::{self, Issue, IssueFilter, NewIssue};
use crate::registry::{self, ApprovalGroup, GroupMember, NewGroup, NewMember};
use crate::revocation::{self, DecisionRevocation, RevocationOutcome};
use crate::statistics::{self, StatisticsDrift};
use crate::store::Store;
use crate::threads::{DiscussionThreads, LocalThreads};
use crate::types::{TimeStamp, Verdict};
use crate::utils::{self, ISSUE_HRP};

pub struct ApprovalService {
    store: Store,
    config: EngineConfig,
    threads: Arc<dyn DiscussionThreads>,
}

impl ApprovalService {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self::with_config(instance, EngineConfig::default())
    }

    pub fn with_config(instance: Arc<sled::Db>, config: EngineConfig) -> Self {
        Self {
            store: Store::new(instance, &config),
            config,
            threads: Arc::new(LocalThreads),
        }
    }

    /// Use a messaging subsystem other than the local identifier issuer.
    pub fn with_threads(mut self, threads: Arc<dyn DiscussionThreads>) -> Self {
        self.threads = threads;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a new application awaiting assignment.
    pub fn submit_application(&self, reference: &str) -> Result<Application, EngineError> {
        let now = TimeStamp::new();
        self.store.atomically(|tx| {
            let application = Application::new(reference, now.clone())?;
            tx.put(&application)?;
            info!(application_id = %application.id, reference, "application submitted");
            Ok(application)
        })
    }

    pub fn register_group(&self, draft: NewGroup) -> Result<ApprovalGroup, EngineError> {
        let now = TimeStamp::new();
        self.store
            .atomically(|tx| registry::register_group(tx, draft.clone(), now.clone()))
    }

    pub fn deactivate_group(&self, group_id: &str) -> Result<ApprovalGroup, EngineError> {
        let now = TimeStamp::new();
        self.store
            .atomically(|tx| registry::deactivate_group(tx, group_id, now.clone()))
    }

    pub fn register_member(&self, draft: NewMember) -> Result<GroupMember, EngineError> {
        let now = TimeStamp::new();
        self.store
            .atomically(|tx| registry::register_member(tx, draft.clone(), now.clone()))
    }

    pub fn deactivate_member(
        &self,
        group_id: &str,
        member_id: &str,
    ) -> Result<GroupMember, EngineError> {
        let now = TimeStamp::new();
        self.store
            .atomically(|tx| registry::deactivate_member(tx, group_id, member_id, now.clone()))
    }

    pub fn set_member_availability(
        &self,
        group_id: &str,
        member_id: &str,
        available: bool,
    ) -> Result<GroupMember, EngineError> {
        self.store
            .atomically(|tx| registry::set_availability(tx, group_id, member_id, available))
    }

    /// Bind a submitted application to an approval group.
    pub fn assign_group(
        &self,
        application_id: &str,
        group_id: &str,
    ) -> Result<Assignment, EngineError> {
        let now = TimeStamp::new();
        self.store
            .atomically(|tx| assignment::open(tx, application_id, group_id, now.clone()))
            .map(|review| review.assignment)
    }

    pub fn approve(
        &self,
        application_id: &str,
        user_id: &str,
        comment: Option<String>,
    ) -> Result<DecisionOutcome, EngineError> {
        self.record_decision(application_id, user_id, Verdict::Approve, comment)
    }

    pub fn reject(
        &self,
        application_id: &str,
        user_id: &str,
        comment: Option<String>,
    ) -> Result<DecisionOutcome, EngineError> {
        self.record_decision(application_id, user_id, Verdict::Reject, comment)
    }

    pub fn record_decision(
        &self,
        application_id: &str,
        user_id: &str,
        verdict: Verdict,
        comment: Option<String>,
    ) -> Result<DecisionOutcome, EngineError> {
        let now = TimeStamp::new();
        self.store.atomically(|tx| {
            decision::record(
                tx,
                &self.config,
                application_id,
                user_id,
                verdict,
                comment.clone(),
                now.clone(),
            )
        })
    }

    pub fn raise_issue(
        &self,
        application_id: &str,
        user_id: &str,
        request: NewIssue,
    ) -> Result<Issue, EngineError> {
        self.store
            .read(|tx| issue::check_raise(tx, application_id, user_id, &request))?;

        // both fixed before the unit of work so a conflict retry reuses them
        let issue_id = utils::new_uuid_to_bech32(ISSUE_HRP)?;
        let thread_id = self
            .threads
            .open_thread(&issue_id, &request.title)
            .with_context(|| format!("opening discussion thread for issue {issue_id}"))?;

        let now = TimeStamp::new();
        self.store.atomically(|tx| {
            issue::raise(
                tx,
                application_id,
                user_id,
                &issue_id,
                &thread_id,
                &request,
                now.clone(),
            )
        })
    }

    pub fn resolve_issue(
        &self,
        issue_id: &str,
        user_id: &str,
        resolution: Option<String>,
    ) -> Result<Issue, EngineError> {
        let now = TimeStamp::new();
        let issue = self.store.atomically(|tx| {
            issue::resolve(tx, issue_id, user_id, resolution.clone(), now.clone())
        })?;
        self.mirror_thread(&issue);
        Ok(issue)
    }

    pub fn reopen_issue(&self, issue_id: &str, user_id: &str) -> Result<Issue, EngineError> {
        let now = TimeStamp::new();
        let issue = self
            .store
            .atomically(|tx| issue::reopen(tx, issue_id, user_id, now.clone()))?;
        self.mirror_thread(&issue);
        Ok(issue)
    }

    fn mirror_thread(&self, issue: &Issue) {
        let Some(thread_id) = &issue.thread_id else {
            return;
        };
        if let Err(err) = self.threads.mark_resolved(thread_id, issue.is_resolved) {
            warn!(
                issue_id = %issue.id,
                thread_id = %thread_id,
                error = %err,
                "failed to mirror issue resolution onto its thread"
            );
        }
    }

    pub fn revoke_decision(
        &self,
        application_id: &str,
        user_id: &str,
        reason: &str,
    ) -> Result<RevocationOutcome, EngineError> {
        let now = TimeStamp::new();
        self.store
            .atomically(|tx| revocation::revoke(tx, application_id, user_id, reason, now.clone()))
    }

    pub fn application(&self, application_id: &str) -> Result<Application, EngineError> {
        self.store.read(|tx| application::load(tx, application_id))
    }

    pub fn assignment_for(&self, application_id: &str) -> Result<Option<Assignment>, EngineError> {
        self.store
            .read(|tx| assignment::for_application(tx, application_id))
    }

    pub fn group_members(&self, group_id: &str) -> Result<Vec<GroupMember>, EngineError> {
        self.store.read(|tx| {
            registry::group(tx, group_id)?;
            registry::members(tx, group_id)
        })
    }

    pub fn decisions(
        &self,
        application_id: &str,
        filter: &DecisionFilter,
    ) -> Result<Vec<Decision>, EngineError> {
        self.store.read(|tx| {
            let review = assignment::load_review(tx, application_id)?;
            decision::find(tx, &review.assignment.id, filter)
        })
    }

    pub fn issues(
        &self,
        application_id: &str,
        filter: &IssueFilter,
    ) -> Result<Vec<Issue>, EngineError> {
        self.store.read(|tx| {
            let review = assignment::load_review(tx, application_id)?;
            issue::find(tx, &review.assignment.id, filter)
        })
    }

    pub fn issue(&self, issue_id: &str) -> Result<Issue, EngineError> {
        self.store.read(|tx| issue::locate(tx, issue_id))
    }

    pub fn revocations(
        &self,
        application_id: &str,
    ) -> Result<Vec<DecisionRevocation>, EngineError> {
        self.store.read(|tx| {
            let review = assignment::load_review(tx, application_id)?;
            revocation::revocations_of(tx, &review.assignment.id)
        })
    }

    pub fn final_approval(
        &self,
        application_id: &str,
    ) -> Result<Option<FinalApproval>, EngineError> {
        self.store.read(|tx| {
            application::load(tx, application_id)?;
            final_approval::for_application(tx, application_id)
        })
    }

    /// Compare the cached counters of the application's assignment with the
    /// ledger. `None` means they agree.
    pub fn audit_statistics(
        &self,
        application_id: &str,
    ) -> Result<Option<StatisticsDrift>, EngineError> {
        self.store.read(|tx| {
            let review = assignment::load_review(tx, application_id)?;
            statistics::audit(tx, &review.assignment, &review.group)
        })
    }
}
