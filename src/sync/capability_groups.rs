use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SyncSettings;
use crate::error::Result;
use crate::reconcile::{apply, fold_key, ReconciliationPlan};
use crate::scheduler::Routine;
use crate::sync::clients::{CapabilityRegistry, Capability, Directory, Group, Member, NewGroup};
use crate::sync::{group_display_name, CAP_SVC_TO_AAD};

const MAIL_NICKNAME_PREFIX: &str = "ci-ssu_cap_";

/// Keeps one directory group per capability, holding exactly the
/// capability's members.
///
/// Groups live in a dedicated administrative unit and are created on demand.
/// Members are matched on their lower-cased principal name.
pub struct CapabilityGroupSync {
    registry: Arc<dyn CapabilityRegistry>,
    directory: Arc<dyn Directory>,
    settings: Arc<SyncSettings>,
}

impl CapabilityGroupSync {
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        directory: Arc<dyn Directory>,
        settings: Arc<SyncSettings>,
    ) -> Self {
        Self {
            registry,
            directory,
            settings,
        }
    }

    async fn ensure_group(&self, unit_id: &str, capability: &Capability) -> Result<Group> {
        let display_name = group_display_name(&self.settings.group_prefix, &capability.root_id);
        tracing::info!(
            job = CAP_SVC_TO_AAD,
            capability = %capability.root_id,
            "Capability has no directory group, creating"
        );
        let group = self
            .directory
            .create_unit_group(
                unit_id,
                NewGroup {
                    display_name,
                    mail_nickname: format!("{}{}", MAIL_NICKNAME_PREFIX, capability.root_id),
                    description: "[Automated] - access-sync".to_string(),
                },
            )
            .await?;
        Ok(group)
    }
}

#[async_trait]
impl Routine for CapabilityGroupSync {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let backoff = self.settings.backoff();
        let directory = self.directory.as_ref();

        let capabilities: BTreeMap<String, Capability> = self
            .registry
            .capabilities()
            .await?
            .into_iter()
            .filter(|c| c.has_context)
            .map(|c| (c.root_id.clone(), c))
            .collect();

        let unit_name = self.settings.administrative_unit.as_str();
        let unit = backoff
            .call(&cancel, || directory.administrative_unit(unit_name))
            .await?;
        let mut groups: HashMap<String, Group> = backoff
            .collect_pages(&cancel, |token| directory.list_unit_groups(&unit.id, token))
            .await?
            .into_iter()
            .map(|g| (g.display_name.clone(), g))
            .collect();

        tracing::debug!(
            job = CAP_SVC_TO_AAD,
            capabilities = capabilities.len(),
            groups = groups.len(),
            "Loaded capabilities and directory groups"
        );

        for (root_id, capability) in &capabilities {
            if cancel.is_cancelled() {
                tracing::info!(job = CAP_SVC_TO_AAD, "Job cancelled");
                return Ok(());
            }

            let display_name = group_display_name(&self.settings.group_prefix, root_id);
            let (group, members) = match groups.remove(&display_name) {
                Some(group) => {
                    let members: Vec<Member> = backoff
                        .collect_pages(&cancel, |token| {
                            directory.list_group_members(&group.id, token)
                        })
                        .await?;
                    (group, members)
                }
                None => (self.ensure_group(&unit.id, capability).await?, Vec::new()),
            };

            let plan = ReconciliationPlan::diff(
                capability.members.iter().cloned(),
                members,
                |email: &String| fold_key(email),
                |member: &Member| fold_key(&member.user_principal_name),
            );

            let group_id = group.id.as_str();
            let report = apply(
                &group.display_name,
                plan,
                &cancel,
                |_, email: String| async move { directory.add_group_member(group_id, &email).await },
                |_, member: Member| async move {
                    directory.remove_group_member(group_id, &member.id).await
                },
            )
            .await?;

            if report.cancelled {
                tracing::info!(job = CAP_SVC_TO_AAD, "Job cancelled");
                return Ok(());
            }
        }

        Ok(())
    }
}
