//! Reconciliation routines and the boundaries to the systems they converge.

pub mod account_assignments;
pub mod app_assignments;
pub mod capability_groups;
pub mod clients;
pub mod cost_tags;
pub mod memory;

use std::sync::Arc;

pub use account_assignments::AccountAssignmentSync;
pub use app_assignments::AppAssignmentSync;
pub use capability_groups::CapabilityGroupSync;
pub use clients::{CapabilityRegistry, CostPlatform, Directory, SsoAdmin};
pub use cost_tags::CostCentreTagSync;
pub use memory::MemoryBackend;

use crate::config::{ScheduleConfig, SyncSettings};
use crate::error::Result;
use crate::scheduler::{Routine, Scheduler};

pub const CAP_SVC_TO_AAD: &str = "capSvcToAad";
pub const AAD_TO_AWS: &str = "aadToAws";
pub const AWS_MAPPING: &str = "awsMapping";
pub const COST_CENTRE_TO_FINOUT: &str = "costCentreToFinout";

pub const JOB_NAMES: [&str; 4] = [CAP_SVC_TO_AAD, AAD_TO_AWS, AWS_MAPPING, COST_CENTRE_TO_FINOUT];

/// Display name of the group that represents `id` in a capability-aware system.
pub fn group_display_name(prefix: &str, id: &str) -> String {
    format!("{} {}", prefix, id)
}

/// Handles to every external system.
#[derive(Clone)]
pub struct Clients {
    pub registry: Arc<dyn CapabilityRegistry>,
    pub directory: Arc<dyn Directory>,
    pub sso: Arc<dyn SsoAdmin>,
    pub cost: Arc<dyn CostPlatform>,
}

impl Clients {
    /// Serve every boundary from one in-memory backend.
    pub fn memory(backend: Arc<MemoryBackend>) -> Self {
        Self {
            registry: backend.clone(),
            directory: backend.clone(),
            sso: backend.clone(),
            cost: backend,
        }
    }

    /// The routine behind each job name.
    pub fn routines(&self, settings: Arc<SyncSettings>) -> Vec<(&'static str, Arc<dyn Routine>)> {
        vec![
            (
                CAP_SVC_TO_AAD,
                Arc::new(CapabilityGroupSync::new(
                    self.registry.clone(),
                    self.directory.clone(),
                    settings.clone(),
                )) as Arc<dyn Routine>,
            ),
            (
                AAD_TO_AWS,
                Arc::new(AppAssignmentSync::new(self.directory.clone(), settings.clone()))
                    as Arc<dyn Routine>,
            ),
            (
                AWS_MAPPING,
                Arc::new(AccountAssignmentSync::new(self.sso.clone(), settings.clone()))
                    as Arc<dyn Routine>,
            ),
            (
                COST_CENTRE_TO_FINOUT,
                Arc::new(CostCentreTagSync::new(
                    self.registry.clone(),
                    self.cost.clone(),
                    settings,
                )) as Arc<dyn Routine>,
            ),
        ]
    }
}

/// Register every routine, reading each schedule through `lookup`.
pub fn register_all<F>(
    scheduler: &mut Scheduler,
    clients: &Clients,
    settings: Arc<SyncSettings>,
    lookup: F,
) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    for (name, routine) in clients.routines(settings) {
        let config = ScheduleConfig::from_lookup(name, &lookup)?;
        scheduler.register(name, routine, config)?;
    }
    Ok(())
}
