//! Shared fixture for the integration tests: a sled database in a temp dir, a
//! service over it and one application assigned to a group of two regular
//! members (M1, M2) and a final approver (M3).
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Context;
use permit_approval::{
    application::Application,
    assignment::Assignment,
    config::EngineConfig,
    error::EngineError,
    registry::{ApprovalGroup, GroupMember, NewGroup, NewMember},
    service::ApprovalService,
    utils,
};
use tempfile::{TempDir, tempdir};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn user() -> anyhow::Result<String> {
    utils::new_uuid_to_bech32("user_")
}

pub struct Fixture {
    // keeps the database directory alive for the duration of the test
    _dir: TempDir,
    pub db: Arc<sled::Db>,
    pub service: ApprovalService,
    pub group: ApprovalGroup,
    pub m1: GroupMember,
    pub m2: GroupMember,
    pub m3: GroupMember,
    pub application: Application,
}

impl Fixture {
    pub fn new(name: &str) -> anyhow::Result<Self> {
        Self::build(name, EngineConfig::default(), NewGroup::new("planning board"))
    }

    pub fn with_config(name: &str, config: EngineConfig) -> anyhow::Result<Self> {
        Self::build(name, config, NewGroup::new("planning board"))
    }

    pub fn with_group(name: &str, group: NewGroup) -> anyhow::Result<Self> {
        Self::build(name, EngineConfig::default(), group)
    }

    /// Group and members are registered, the application is submitted but not
    /// assigned yet.
    pub fn build(name: &str, config: EngineConfig, group: NewGroup) -> anyhow::Result<Self> {
        init_tracing();

        // one database per test, sled holds a file lock on it
        let dir = tempdir()?;
        let db = Arc::new(sled::open(dir.path().join(format!("{name}.db")))?);
        let service = ApprovalService::with_config(db.clone(), config);

        let group = service
            .register_group(group.set_description("reviews building permits"))
            .context("registering group")?;
        let m1 = service.register_member(NewMember::regular(&group.id, &user()?))?;
        let m2 = service.register_member(NewMember::regular(&group.id, &user()?))?;
        let m3 = service.register_member(NewMember::final_approver(&group.id, &user()?))?;

        let application = service
            .submit_application("PRM-2024-0042")
            .context("submitting application")?;

        Ok(Self {
            _dir: dir,
            db,
            service,
            group,
            m1,
            m2,
            m3,
            application,
        })
    }

    /// Same as [`Fixture::new`] with the application already assigned.
    pub fn assigned(name: &str) -> anyhow::Result<Self> {
        let fixture = Self::new(name)?;
        fixture.assign()?;
        Ok(fixture)
    }

    pub fn assign(&self) -> anyhow::Result<Assignment> {
        self.service
            .assign_group(&self.application.id, &self.group.id)
            .context("assigning group")
    }

    pub fn app(&self) -> &str {
        &self.application.id
    }

    pub fn assignment(&self) -> anyhow::Result<Assignment> {
        self.service
            .assignment_for(self.app())?
            .context("application has no assignment")
    }
}

pub fn is_invalid_state<T>(result: &Result<T, EngineError>) -> bool {
    matches!(result, Err(EngineError::InvalidState(_)))
}

pub fn is_unauthorized<T>(result: &Result<T, EngineError>) -> bool {
    matches!(result, Err(EngineError::Unauthorized(_)))
}
