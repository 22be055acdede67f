//! Binding of an application to its approval group.
use chrono::Utc;
use tracing::info;

use crate::application::{self, Application, ApplicationStatus};
use crate::decision::Decision;
use crate::error::{EngineError, Entity};
use crate::registry::{self, ApprovalGroup};
use crate::statistics::{self, Statistics};
use crate::store::{Record, Tx, keys};
use crate::types::TimeStamp;
use crate::utils::{self, ASSIGNMENT_HRP};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub application_id: String,
    #[n(2)]
    pub group_id: String,
    #[n(3)]
    pub is_active: bool,
    #[n(4)]
    pub assigned_at: TimeStamp<Utc>,
    #[n(5)]
    pub completed_at: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub statistics: Statistics, // cache, see statistics::recompute
    #[n(7)]
    pub ready_for_final_approval: bool,
    #[n(8)]
    pub final_approver_assigned_at: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub final_decision_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub final_decision_id: Option<String>,
    #[n(11)]
    pub version: u64,
}

impl Record for Assignment {
    fn key(&self) -> String {
        keys::assignment(&self.id)
    }
}

impl Assignment {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub(crate) fn complete(&mut self, final_decision_id: &str, now: TimeStamp<Utc>) {
        self.completed_at = Some(now.clone());
        self.final_decision_at = Some(now);
        self.final_decision_id = Some(final_decision_id.to_string());
    }

    pub(crate) fn reopen(&mut self) {
        self.completed_at = None;
        self.final_decision_at = None;
        self.final_decision_id = None;
    }
}

/// Everything an operation on an application's review needs, loaded together.
#[derive(Debug, Clone)]
pub struct Review {
    pub application: Application,
    pub assignment: Assignment,
    pub group: ApprovalGroup,
}

impl Review {
    /// Stage the assignment and the application.
    pub fn save(&mut self, tx: &mut Tx<'_>) -> Result<(), EngineError> {
        save(tx, &mut self.assignment)?;
        tx.put(&self.application)?;
        Ok(())
    }
}

pub fn for_application(
    tx: &mut Tx<'_>,
    application_id: &str,
) -> Result<Option<Assignment>, EngineError> {
    let Some(assignment_id) = tx.get_index(&keys::application_assignment(application_id))? else {
        return Ok(None);
    };
    let assignment = tx
        .get(&keys::assignment(&assignment_id))?
        .ok_or_else(|| EngineError::not_found(Entity::Assignment, assignment_id))?;
    Ok(Some(assignment))
}

pub fn load_review(tx: &mut Tx<'_>, application_id: &str) -> Result<Review, EngineError> {
    let application = application::load(tx, application_id)?;
    let assignment = for_application(tx, application_id)?
        .filter(|a| a.is_active)
        .ok_or_else(|| {
            EngineError::invalid_state(format!(
                "application {application_id} has no active assignment"
            ))
        })?;
    let group = registry::group(tx, &assignment.group_id)?;

    Ok(Review {
        application,
        assignment,
        group,
    })
}

/// Decisions and issue changes need an assignment that has not reached its
/// final decision yet.
pub fn ensure_open(assignment: &Assignment) -> Result<(), EngineError> {
    if !assignment.is_active {
        return Err(EngineError::invalid_state(format!(
            "assignment {} is not active",
            assignment.id
        )));
    }
    if assignment.is_completed() {
        return Err(EngineError::invalid_state(format!(
            "assignment {} is completed; revoke the final decision to reopen it",
            assignment.id
        )));
    }
    Ok(())
}

pub fn save(tx: &mut Tx<'_>, assignment: &mut Assignment) -> Result<(), EngineError> {
    assignment.version += 1;
    tx.put(&*assignment)?;
    Ok(())
}

/// Bind the application to the group, seeding one pending decision per active
/// regular member.
pub fn open(
    tx: &mut Tx<'_>,
    application_id: &str,
    group_id: &str,
    now: TimeStamp<Utc>,
) -> Result<Review, EngineError> {
    let mut application = application::load(tx, application_id)?;
    if let Some(existing) = for_application(tx, application_id)? {
        return Err(EngineError::invalid_state(format!(
            "application {application_id} is already assigned ({})",
            existing.id
        )));
    }
    if application.status != ApplicationStatus::Submitted {
        return Err(EngineError::invalid_state(format!(
            "application {application_id} is {:?}, expected Submitted",
            application.status
        )));
    }

    let group = registry::group(tx, group_id)?;
    if !group.is_active {
        return Err(EngineError::invalid_state(format!(
            "group {group_id} is deactivated"
        )));
    }
    if registry::final_approver(tx, group_id)?.is_none() {
        return Err(EngineError::invalid_state(format!(
            "group {group_id} has no active final approver"
        )));
    }
    let regular = registry::regular_members(tx, group_id)?;
    if regular.is_empty() {
        return Err(EngineError::invalid_state(format!(
            "group {group_id} has no active regular members"
        )));
    }

    let mut assignment = Assignment {
        id: utils::new_uuid_to_bech32(ASSIGNMENT_HRP)?,
        application_id: application.id.clone(),
        group_id: group.id.clone(),
        is_active: true,
        assigned_at: now.clone(),
        completed_at: None,
        statistics: Statistics::default(),
        ready_for_final_approval: false,
        final_approver_assigned_at: None,
        final_decision_at: None,
        final_decision_id: None,
        version: 0,
    };

    for member in &regular {
        let decision = Decision::pending(&assignment, member, now.clone())?;
        tx.put(&decision)?;
    }
    tx.put_index(
        &keys::application_assignment(&application.id),
        &assignment.id,
    );

    statistics::recompute(tx, &mut assignment, &group, &now)?;
    application.begin_review(now);

    let mut review = Review {
        application,
        assignment,
        group,
    };
    review.save(tx)?;

    info!(
        application_id,
        assignment_id = %review.assignment.id,
        group_id,
        members = regular.len(),
        "application assigned to approval group"
    );
    Ok(review)
}
