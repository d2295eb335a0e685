use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SyncSettings;
use crate::error::Result;
use crate::reconcile::{apply, ReconciliationPlan};
use crate::scheduler::Routine;
use crate::sync::clients::{AppAssignment, Directory, Group};
use crate::sync::AAD_TO_AWS;

/// Grants every capability group the configured role on the directory
/// application that fronts cloud sign-on, and withdraws it from capability
/// groups that no longer exist.
pub struct AppAssignmentSync {
    directory: Arc<dyn Directory>,
    settings: Arc<SyncSettings>,
}

impl AppAssignmentSync {
    pub fn new(directory: Arc<dyn Directory>, settings: Arc<SyncSettings>) -> Self {
        Self {
            directory,
            settings,
        }
    }
}

#[async_trait]
impl Routine for AppAssignmentSync {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let backoff = self.settings.backoff();
        let directory = self.directory.as_ref();
        let app_id = self.settings.application_object_id.as_str();
        let prefix = self.settings.group_prefix.as_str();

        let role_name = self.settings.application_role.as_str();
        let role_id = backoff
            .call(&cancel, || directory.app_role_id(app_id, role_name))
            .await?;

        let groups: Vec<Group> = backoff
            .collect_pages(&cancel, |token| directory.list_groups(prefix, token))
            .await?;
        // Only assignments of the managed role count; a group holding some
        // other role on the application still needs this one.
        let assignments: Vec<AppAssignment> = backoff
            .collect_pages(&cancel, |token| directory.list_app_assignments(app_id, token))
            .await?
            .into_iter()
            .filter(|a| a.role_id == role_id && a.principal_display_name.starts_with(prefix))
            .collect();

        let plan = ReconciliationPlan::diff(
            groups,
            assignments,
            |group: &Group| group.id.clone(),
            |assignment: &AppAssignment| assignment.principal_id.clone(),
        );

        let role_id = role_id.as_str();
        let report = apply(
            AAD_TO_AWS,
            plan,
            &cancel,
            |_, group: Group| async move {
                tracing::info!(
                    job = AAD_TO_AWS,
                    group = %group.display_name,
                    "Group has not been assigned to application yet, assigning"
                );
                directory.assign_app_role(app_id, &group.id, role_id).await
            },
            |_, assignment: AppAssignment| async move {
                directory.remove_app_assignment(app_id, &assignment.id).await
            },
        )
        .await?;

        if report.cancelled {
            tracing::info!(job = AAD_TO_AWS, "Job cancelled");
        }
        Ok(())
    }
}
