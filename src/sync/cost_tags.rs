use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::SyncSettings;
use crate::error::Result;
use crate::reconcile::ReconciliationPlan;
use crate::scheduler::Routine;
use crate::sync::clients::{
    Capability, CapabilityRegistry, CostPlatform, TagFilter, TagRule, VirtualTagRequest,
};
use crate::sync::COST_CENTRE_TO_FINOUT;

const TAG_CATEGORY: &str = "Project";
const UNTAGGED: &str = "Untagged";

/// Manual cost-centre assignments for accounts that belong to no capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mappings {
    #[serde(rename = "awsAccountAlias2CostCentre", default)]
    pub account_alias_to_cost_centre: Vec<AliasMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasMapping {
    pub alias: String,
    pub cost_centre: String,
}

impl Mappings {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Maintains the cost-centre virtual tag on the cost platform.
///
/// The tag's rule list is derived from capability metadata plus the manual
/// alias mappings and is always sent in full. Nothing is sent when the
/// current rules already match.
pub struct CostCentreTagSync {
    registry: Arc<dyn CapabilityRegistry>,
    cost: Arc<dyn CostPlatform>,
    settings: Arc<SyncSettings>,
}

impl CostCentreTagSync {
    pub fn new(
        registry: Arc<dyn CapabilityRegistry>,
        cost: Arc<dyn CostPlatform>,
        settings: Arc<SyncSettings>,
    ) -> Self {
        Self {
            registry,
            cost,
            settings,
        }
    }

    fn capability_rule(&self, capability: &Capability) -> Option<TagRule> {
        let cost_centre = capability.metadata_str(&self.settings.cost_tag_key)?;
        if cost_centre.is_empty() {
            return None;
        }
        Some(TagRule {
            to: cost_centre.to_string(),
            filter: TagFilter {
                cost_center: "virtualTag".to_string(),
                key: self.settings.capability_tag_id.clone(),
                kind: "virtual_tag".to_string(),
                operator: "oneOf".to_string(),
                value: vec![capability.id.clone()],
            },
        })
    }

    /// Rules the tag should carry, in a stable order.
    pub async fn desired_rules(&self) -> Result<Vec<TagRule>> {
        let capabilities = self.registry.capabilities().await?;
        let mut rules: Vec<TagRule> = capabilities
            .iter()
            .filter_map(|c| self.capability_rule(c))
            .collect();

        let mappings = match Mappings::load(&self.settings.mappings_file).await {
            Ok(mappings) => mappings,
            Err(e) => {
                tracing::warn!(
                    job = COST_CENTRE_TO_FINOUT,
                    path = %self.settings.mappings_file.display(),
                    error = %e,
                    "No manual mappings found, using default values"
                );
                Mappings::default()
            }
        };
        rules.extend(
            mappings
                .account_alias_to_cost_centre
                .into_iter()
                .map(|m| TagRule {
                    to: m.cost_centre,
                    filter: TagFilter {
                        cost_center: "amazon-cur".to_string(),
                        key: "aws_account_name".to_string(),
                        kind: "tag".to_string(),
                        operator: "oneOf".to_string(),
                        value: vec![m.alias],
                    },
                }),
        );

        rules.sort();
        rules.dedup();
        Ok(rules)
    }

    fn request(&self, rules: Vec<TagRule>) -> VirtualTagRequest {
        VirtualTagRequest {
            name: self.settings.cost_tag_key.clone(),
            category: TAG_CATEGORY.to_string(),
            default_value: UNTAGGED.to_string(),
            rules,
            author: self.settings.cost_tag_author.clone(),
        }
    }
}

#[async_trait]
impl Routine for CostCentreTagSync {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let tag_key = self.settings.cost_tag_key.as_str();
        let rules = self.desired_rules().await?;

        if cancel.is_cancelled() {
            tracing::info!(job = COST_CENTRE_TO_FINOUT, "Job cancelled");
            return Ok(());
        }

        let cost = self.cost.as_ref();
        let tags = self
            .settings
            .backoff()
            .call(&cancel, || cost.list_virtual_tags())
            .await?;
        match tags.into_iter().find(|t| t.name == tag_key) {
            None => {
                tracing::info!(
                    job = COST_CENTRE_TO_FINOUT,
                    tag = tag_key,
                    rules = rules.len(),
                    "Tag doesn't exist, creating"
                );
                self.cost.create_virtual_tag(self.request(rules)).await?;
            }
            Some(tag) => {
                let plan = ReconciliationPlan::diff(
                    rules.iter().cloned(),
                    tag.rules,
                    TagRule::clone,
                    TagRule::clone,
                );
                if plan.is_empty() {
                    tracing::debug!(job = COST_CENTRE_TO_FINOUT, tag = tag_key, "Tag is up to date");
                    return Ok(());
                }

                tracing::info!(
                    job = COST_CENTRE_TO_FINOUT,
                    tag = tag_key,
                    additions = plan.additions.len(),
                    removals = plan.removals.len(),
                    "Tag exists, updating"
                );
                self.cost
                    .update_virtual_tag(&tag.id, self.request(rules))
                    .await?;
            }
        }
        Ok(())
    }
}
