//! The slice of a permit application the engine owns: its review status and
//! the dates that go with it.
use chrono::Utc;

use crate::error::{EngineError, Entity};
use crate::final_approval::FinalOutcome;
use crate::store::{Record, Tx, keys};
use crate::types::TimeStamp;
use crate::utils::{self, APPLICATION_HRP};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationStatus {
    #[n(0)]
    Submitted,
    #[n(1)]
    UnderReview,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
}

impl ApplicationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ApplicationStatus::Approved | ApplicationStatus::Rejected)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Application {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub reference: String, // applicant-facing permit number
    #[n(2)]
    pub status: ApplicationStatus,
    #[n(3)]
    pub submitted_at: TimeStamp<Utc>,
    #[n(4)]
    pub review_started_at: Option<TimeStamp<Utc>>,
    #[n(5)]
    pub final_approval_date: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub rejection_date: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub review_completed_at: Option<TimeStamp<Utc>>,
}

impl Record for Application {
    fn key(&self) -> String {
        keys::application(&self.id)
    }
}

impl Application {
    pub fn new(reference: &str, now: TimeStamp<Utc>) -> anyhow::Result<Self> {
        Ok(Self {
            id: utils::new_uuid_to_bech32(APPLICATION_HRP)?,
            reference: reference.to_string(),
            status: ApplicationStatus::Submitted,
            submitted_at: now,
            review_started_at: None,
            final_approval_date: None,
            rejection_date: None,
            review_completed_at: None,
        })
    }

    pub(crate) fn begin_review(&mut self, now: TimeStamp<Utc>) {
        self.status = ApplicationStatus::UnderReview;
        self.review_started_at = Some(now);
    }

    pub(crate) fn finalize(&mut self, outcome: FinalOutcome, now: TimeStamp<Utc>) {
        match outcome {
            FinalOutcome::Approved => {
                self.status = ApplicationStatus::Approved;
                self.final_approval_date = Some(now.clone());
            }
            FinalOutcome::Rejected => {
                self.status = ApplicationStatus::Rejected;
                self.rejection_date = Some(now.clone());
            }
        }
        self.review_completed_at = Some(now);
    }

    /// Back to review with every terminal date cleared.
    pub(crate) fn reset_to_review(&mut self) {
        self.status = ApplicationStatus::UnderReview;
        self.final_approval_date = None;
        self.rejection_date = None;
        self.review_completed_at = None;
    }
}

pub fn load(tx: &mut Tx<'_>, application_id: &str) -> Result<Application, EngineError> {
    tx.get(&keys::application(application_id))?
        .ok_or_else(|| EngineError::not_found(Entity::Application, application_id))
}
