use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SyncSettings;
use crate::error::{Result, SyncError, UpstreamError};
use crate::reconcile::{apply, fan_out, ApplyReport, Backoff, ReconciliationPlan};
use crate::scheduler::Routine;
use crate::sync::clients::{Account, AccountAssignment, AccountStatus, Group, OrgUnit, SsoAdmin};
use crate::sync::{group_display_name, AWS_MAPPING};

/// A permission set granted to every capability group on one shared account.
struct SharedRole<'a> {
    label: &'static str,
    account_alias: &'a str,
    permission_set_arn: &'a str,
}

/// Converges SSO permission-set assignments for capability groups.
///
/// Every active capability account grants the capability permission set to
/// the group named after the account. Shared accounts (logs, container
/// registry) grant their permission set to every capability group.
pub struct AccountAssignmentSync {
    sso: Arc<dyn SsoAdmin>,
    settings: Arc<SyncSettings>,
}

impl AccountAssignmentSync {
    pub fn new(sso: Arc<dyn SsoAdmin>, settings: Arc<SyncSettings>) -> Self {
        Self { sso, settings }
    }

    /// All accounts below the organization root, found by walking nested
    /// organizational units.
    async fn accounts(
        &self,
        backoff: &Backoff,
        cancel: &CancellationToken,
    ) -> Result<Vec<Account>> {
        let root = self.settings.organizations_root_id.clone();
        let units = backoff
            .collect_tree(
                cancel,
                root.clone(),
                |parent: String, token| {
                    let sso = Arc::clone(&self.sso);
                    async move { sso.list_org_units(&parent, token).await }
                },
                |unit: &OrgUnit| unit.id.clone(),
            )
            .await?;

        let parents = std::iter::once(root).chain(units.into_iter().map(|unit| unit.id));
        let mut accounts = Vec::new();
        for parent in parents {
            let page = backoff
                .collect_pages(cancel, |token| self.sso.list_accounts(&parent, token))
                .await?;
            accounts.extend(page);
        }
        Ok(accounts)
    }

    /// Current assignments of `permission_set_arn` per account. Accounts whose
    /// lookup failed are missing from the result.
    async fn assignments_by_account(
        &self,
        backoff: Backoff,
        account_ids: Vec<String>,
        permission_set_arn: &str,
        cancel: &CancellationToken,
    ) -> HashMap<String, Vec<AccountAssignment>> {
        let sso = Arc::clone(&self.sso);
        let permission_set_arn = permission_set_arn.to_string();
        let cancel = cancel.clone();
        fan_out(
            account_ids,
            self.settings.fan_out_limit,
            move |account_id: String| {
                let sso = Arc::clone(&sso);
                let permission_set_arn = permission_set_arn.clone();
                let cancel = cancel.clone();
                async move {
                    let assignments = backoff
                        .collect_pages(&cancel, |token| {
                            sso.list_account_assignments(&account_id, &permission_set_arn, token)
                        })
                        .await?;
                    Ok::<_, SyncError>((account_id, assignments))
                }
            },
        )
        .await
        .into_iter()
        .collect()
    }

    async fn converge(
        &self,
        scope: &str,
        desired: Vec<AccountAssignment>,
        actual: Vec<AccountAssignment>,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport> {
        let sso = self.sso.as_ref();
        let plan = ReconciliationPlan::diff(desired, actual, AccountAssignment::key, AccountAssignment::key);
        apply(
            scope,
            plan,
            cancel,
            |_, assignment: AccountAssignment| async move {
                sso.create_account_assignment(&assignment).await
            },
            |_, assignment: AccountAssignment| async move {
                sso.delete_account_assignment(&assignment).await
            },
        )
        .await
    }

    async fn capability_accounts(
        &self,
        backoff: Backoff,
        accounts: &[Account],
        groups: &HashMap<String, Group>,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport> {
        let settings = &self.settings;
        let permission_set_arn = settings.capability_permission_set_arn.as_str();

        let mut desired = Vec::new();
        let mut eligible = Vec::new();
        for account in accounts {
            let Some(alias) = account.name.strip_prefix(&settings.account_name_prefix) else {
                continue;
            };
            if account.status == AccountStatus::Suspended {
                tracing::warn!(
                    job = AWS_MAPPING,
                    account = %account.name,
                    account_id = %account.id,
                    "Suspended account detected, skipping account"
                );
                continue;
            }
            eligible.push(account.id.clone());

            let name = group_display_name(&settings.group_prefix, alias);
            match groups.get(&name) {
                Some(group) => desired.push(AccountAssignment {
                    account_id: account.id.clone(),
                    permission_set_arn: permission_set_arn.to_string(),
                    group_id: group.id.clone(),
                }),
                None => tracing::debug!(
                    job = AWS_MAPPING,
                    account = %account.name,
                    "No capability group for account"
                ),
            }
        }

        let current = self
            .assignments_by_account(backoff, eligible, permission_set_arn, cancel)
            .await;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let capability_groups: HashSet<&str> = groups.values().map(|g| g.id.as_str()).collect();

        // Plan only for accounts whose assignments could be read.
        desired.retain(|a| current.contains_key(&a.account_id));
        let actual = current
            .into_values()
            .flatten()
            .filter(|a| capability_groups.contains(a.group_id.as_str()))
            .collect();

        self.converge("capability", desired, actual, cancel).await
    }

    async fn shared_role(
        &self,
        backoff: &Backoff,
        role: SharedRole<'_>,
        accounts: &[Account],
        groups: &HashMap<String, Group>,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport> {
        if role.account_alias.is_empty() || role.permission_set_arn.is_empty() {
            tracing::debug!(job = AWS_MAPPING, role = role.label, "Shared role not configured");
            return Ok(ApplyReport::default());
        }

        let account = accounts
            .iter()
            .find(|a| a.name == role.account_alias)
            .ok_or_else(|| {
                UpstreamError::not_found(
                    "sso",
                    format!("Unable to find account by alias {}", role.account_alias),
                )
            })?;

        let actual: Vec<AccountAssignment> = backoff
            .collect_pages(cancel, |token| {
                self.sso
                    .list_account_assignments(&account.id, role.permission_set_arn, token)
            })
            .await?;
        let actual = actual
            .into_iter()
            .filter(|a| groups.values().any(|g| g.id == a.group_id))
            .collect();

        let desired = groups
            .values()
            .map(|group| AccountAssignment {
                account_id: account.id.clone(),
                permission_set_arn: role.permission_set_arn.to_string(),
                group_id: group.id.clone(),
            })
            .collect();

        self.converge(role.label, desired, actual, cancel).await
    }
}

#[async_trait]
impl Routine for AccountAssignmentSync {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let backoff = self.settings.backoff();
        let settings = &self.settings;

        let accounts = self.accounts(&backoff, &cancel).await?;
        let groups: HashMap<String, Group> = backoff
            .collect_pages(&cancel, |token| self.sso.list_groups(&settings.group_prefix, token))
            .await?
            .into_iter()
            .map(|g| (g.display_name.clone(), g))
            .collect();

        tracing::debug!(
            job = AWS_MAPPING,
            accounts = accounts.len(),
            groups = groups.len(),
            "Loaded accounts and capability groups"
        );

        let mut report = self
            .capability_accounts(backoff, &accounts, &groups, &cancel)
            .await?;

        let shared = [
            SharedRole {
                label: "CapabilityLog",
                account_alias: &settings.capability_logs_account_alias,
                permission_set_arn: &settings.capability_logs_permission_set_arn,
            },
            SharedRole {
                label: "SharedECRPull",
                account_alias: &settings.shared_ecr_pull_account_alias,
                permission_set_arn: &settings.shared_ecr_pull_permission_set_arn,
            },
        ];
        for role in shared {
            if report.cancelled {
                break;
            }
            let outcome = self
                .shared_role(&backoff, role, &accounts, &groups, &cancel)
                .await?;
            report.merge(outcome);
        }

        if report.cancelled {
            tracing::info!(job = AWS_MAPPING, "Job cancelled");
        } else {
            tracing::info!(
                job = AWS_MAPPING,
                added = report.added,
                removed = report.removed,
                skipped = report.skipped,
                "Account assignments converged"
            );
        }
        Ok(())
    }
}
