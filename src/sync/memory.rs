//! In-memory implementation of every external-system boundary.
//!
//! State can be loaded from a JSON document, so the service runs end to end
//! without credentials. Listings are paginated and can be told to answer
//! with rate-limit errors, which makes the backoff path observable.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpstreamError, UpstreamErrorKind};
use crate::reconcile::Page;
use crate::sync::clients::{
    Account, AccountAssignment, AccountStatus, AdministrativeUnit, AppAssignment, Capability,
    CapabilityRegistry, CostPlatform, Directory, Group, Member, NewGroup, OrgUnit, SsoAdmin,
    UpstreamResult, VirtualTag, VirtualTagRequest,
};

const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub user_principal_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryGroup {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub unit_id: Option<String>,
    /// User ids.
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    /// Role name to role id.
    #[serde(default)]
    pub roles: BTreeMap<String, String>,
    #[serde(default)]
    pub assignments: Vec<AppAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgUnitRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub parent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: AccountStatus,
    pub parent_id: String,
}

/// Everything the backend knows about, in the shape of its JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryState {
    pub capabilities: Vec<Capability>,
    pub users: Vec<User>,
    pub administrative_units: Vec<AdministrativeUnit>,
    pub groups: Vec<DirectoryGroup>,
    pub applications: Vec<Application>,
    pub org_units: Vec<OrgUnitRecord>,
    pub accounts: Vec<AccountRecord>,
    pub sso_groups: Vec<Group>,
    pub account_assignments: Vec<AccountAssignment>,
    pub virtual_tags: Vec<VirtualTag>,
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    page_size: usize,
    next_id: AtomicU64,
    rate_limited_listings: AtomicU32,
    writes: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(MemoryState::default())
    }
}

impl MemoryBackend {
    pub fn new(state: MemoryState) -> Self {
        Self {
            state: Mutex::new(state),
            page_size: DEFAULT_PAGE_SIZE,
            next_id: AtomicU64::new(1),
            rate_limited_listings: AtomicU32::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let state: MemoryState = serde_json::from_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            capabilities = state.capabilities.len(),
            accounts = state.accounts.len(),
            "Loaded in-memory backend state"
        );
        Ok(Self::new(state))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Make the next `count` listing calls fail with a rate-limit error.
    pub fn rate_limit_next_listings(&self, count: u32) {
        self.rate_limited_listings.store(count, Ordering::SeqCst);
    }

    /// Number of mutating calls served so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MemoryState {
        self.lock().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut MemoryState)) {
        f(&mut self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> MutexGuard<'_, MemoryState> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.lock()
    }

    fn next_id(&self, kind: &str) -> String {
        format!("{}-{}", kind, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn page<T>(&self, system: &'static str, items: Vec<T>, token: Option<String>) -> UpstreamResult<Page<T>> {
        let throttled = self
            .rate_limited_listings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(UpstreamError::rate_limited(system, "TooManyRequestsException"));
        }

        let offset = match token {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                UpstreamError::new(system, UpstreamErrorKind::Decode, format!("bad page token {raw:?}"))
            })?,
            None => 0,
        };
        let end = offset.saturating_add(self.page_size).min(items.len());
        let next = (end < items.len()).then(|| end.to_string());
        let items = items.into_iter().skip(offset).take(end.saturating_sub(offset)).collect();
        Ok(Page { items, next })
    }
}

fn missing(system: &'static str, what: impl Into<String>) -> UpstreamError {
    UpstreamError::not_found(system, what)
}

#[async_trait]
impl CapabilityRegistry for MemoryBackend {
    async fn capabilities(&self) -> UpstreamResult<Vec<Capability>> {
        Ok(self.lock().capabilities.clone())
    }
}

#[async_trait]
impl Directory for MemoryBackend {
    async fn administrative_unit(&self, display_name: &str) -> UpstreamResult<AdministrativeUnit> {
        self.lock()
            .administrative_units
            .iter()
            .find(|u| u.display_name == display_name)
            .cloned()
            .ok_or_else(|| missing("directory", format!("administrative unit {display_name}")))
    }

    async fn list_unit_groups(
        &self,
        unit_id: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<Group>> {
        let groups = self
            .lock()
            .groups
            .iter()
            .filter(|g| g.unit_id.as_deref() == Some(unit_id))
            .map(|g| Group {
                id: g.id.clone(),
                display_name: g.display_name.clone(),
            })
            .collect();
        self.page("directory", groups, token)
    }

    async fn list_groups(
        &self,
        prefix: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<Group>> {
        let groups = self
            .lock()
            .groups
            .iter()
            .filter(|g| g.display_name.starts_with(prefix))
            .map(|g| Group {
                id: g.id.clone(),
                display_name: g.display_name.clone(),
            })
            .collect();
        self.page("directory", groups, token)
    }

    async fn create_unit_group(&self, unit_id: &str, group: NewGroup) -> UpstreamResult<Group> {
        let id = self.next_id("group");
        let mut state = self.write();
        if !state.administrative_units.iter().any(|u| u.id == unit_id) {
            return Err(missing("directory", format!("administrative unit {unit_id}")));
        }
        state.groups.push(DirectoryGroup {
            id: id.clone(),
            display_name: group.display_name.clone(),
            unit_id: Some(unit_id.to_string()),
            members: Vec::new(),
        });
        Ok(Group {
            id,
            display_name: group.display_name,
        })
    }

    async fn list_group_members(
        &self,
        group_id: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<Member>> {
        let members = {
            let state = self.lock();
            let group = state
                .groups
                .iter()
                .find(|g| g.id == group_id)
                .ok_or_else(|| missing("directory", format!("group {group_id}")))?;
            group
                .members
                .iter()
                .filter_map(|id| state.users.iter().find(|u| &u.id == id))
                .map(|u| Member {
                    id: u.id.clone(),
                    user_principal_name: u.user_principal_name.clone(),
                })
                .collect()
        };
        self.page("directory", members, token)
    }

    async fn add_group_member(
        &self,
        group_id: &str,
        user_principal_name: &str,
    ) -> UpstreamResult<()> {
        let mut state = self.write();
        let user_id = state
            .users
            .iter()
            .find(|u| u.user_principal_name.eq_ignore_ascii_case(user_principal_name))
            .map(|u| u.id.clone())
            .ok_or_else(|| missing("directory", format!("user {user_principal_name}")))?;
        let group = state
            .groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| missing("directory", format!("group {group_id}")))?;
        if !group.members.contains(&user_id) {
            group.members.push(user_id);
        }
        Ok(())
    }

    async fn remove_group_member(&self, group_id: &str, member_id: &str) -> UpstreamResult<()> {
        let mut state = self.write();
        let group = state
            .groups
            .iter_mut()
            .find(|g| g.id == group_id)
            .ok_or_else(|| missing("directory", format!("group {group_id}")))?;
        group.members.retain(|m| m != member_id);
        Ok(())
    }

    async fn app_role_id(&self, app_id: &str, role_name: &str) -> UpstreamResult<String> {
        let state = self.lock();
        let app = state
            .applications
            .iter()
            .find(|a| a.id == app_id)
            .ok_or_else(|| missing("directory", format!("application {app_id}")))?;
        app.roles
            .get(role_name)
            .cloned()
            .ok_or_else(|| missing("directory", format!("role {role_name} on {app_id}")))
    }

    async fn list_app_assignments(
        &self,
        app_id: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<AppAssignment>> {
        let assignments = self
            .lock()
            .applications
            .iter()
            .find(|a| a.id == app_id)
            .map(|a| a.assignments.clone())
            .ok_or_else(|| missing("directory", format!("application {app_id}")))?;
        self.page("directory", assignments, token)
    }

    async fn assign_app_role(
        &self,
        app_id: &str,
        group_id: &str,
        role_id: &str,
    ) -> UpstreamResult<()> {
        let id = self.next_id("assignment");
        let mut state = self.write();
        let display_name = state
            .groups
            .iter()
            .find(|g| g.id == group_id)
            .map(|g| g.display_name.clone())
            .ok_or_else(|| missing("directory", format!("group {group_id}")))?;
        let app = state
            .applications
            .iter_mut()
            .find(|a| a.id == app_id)
            .ok_or_else(|| missing("directory", format!("application {app_id}")))?;
        app.assignments.push(AppAssignment {
            id,
            principal_id: group_id.to_string(),
            principal_display_name: display_name,
            role_id: role_id.to_string(),
        });
        Ok(())
    }

    async fn remove_app_assignment(&self, app_id: &str, assignment_id: &str) -> UpstreamResult<()> {
        let mut state = self.write();
        let app = state
            .applications
            .iter_mut()
            .find(|a| a.id == app_id)
            .ok_or_else(|| missing("directory", format!("application {app_id}")))?;
        app.assignments.retain(|a| a.id != assignment_id);
        Ok(())
    }
}

#[async_trait]
impl SsoAdmin for MemoryBackend {
    async fn list_org_units(
        &self,
        parent_id: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<OrgUnit>> {
        let units = self
            .lock()
            .org_units
            .iter()
            .filter(|u| u.parent_id == parent_id)
            .map(|u| OrgUnit {
                id: u.id.clone(),
                name: u.name.clone(),
            })
            .collect();
        self.page("sso", units, token)
    }

    async fn list_accounts(
        &self,
        parent_id: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<Account>> {
        let accounts = self
            .lock()
            .accounts
            .iter()
            .filter(|a| a.parent_id == parent_id)
            .map(|a| Account {
                id: a.id.clone(),
                name: a.name.clone(),
                status: a.status,
            })
            .collect();
        self.page("sso", accounts, token)
    }

    async fn list_groups(
        &self,
        prefix: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<Group>> {
        let groups = self
            .lock()
            .sso_groups
            .iter()
            .filter(|g| g.display_name.starts_with(prefix))
            .cloned()
            .collect();
        self.page("sso", groups, token)
    }

    async fn list_account_assignments(
        &self,
        account_id: &str,
        permission_set_arn: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<AccountAssignment>> {
        let assignments = self
            .lock()
            .account_assignments
            .iter()
            .filter(|a| a.account_id == account_id && a.permission_set_arn == permission_set_arn)
            .cloned()
            .collect();
        self.page("sso", assignments, token)
    }

    async fn create_account_assignment(
        &self,
        assignment: &AccountAssignment,
    ) -> UpstreamResult<()> {
        let mut state = self.write();
        if !state.account_assignments.contains(assignment) {
            state.account_assignments.push(assignment.clone());
        }
        Ok(())
    }

    async fn delete_account_assignment(
        &self,
        assignment: &AccountAssignment,
    ) -> UpstreamResult<()> {
        self.write().account_assignments.retain(|a| a != assignment);
        Ok(())
    }
}

#[async_trait]
impl CostPlatform for MemoryBackend {
    async fn list_virtual_tags(&self) -> UpstreamResult<Vec<VirtualTag>> {
        Ok(self.lock().virtual_tags.clone())
    }

    async fn create_virtual_tag(&self, request: VirtualTagRequest) -> UpstreamResult<VirtualTag> {
        let tag = VirtualTag {
            id: self.next_id("tag"),
            name: request.name,
            rules: request.rules,
            updated_by: request.author,
        };
        self.write().virtual_tags.push(tag.clone());
        Ok(tag)
    }

    async fn update_virtual_tag(&self, id: &str, request: VirtualTagRequest) -> UpstreamResult<()> {
        let mut state = self.write();
        let tag = state
            .virtual_tags
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| missing("cost", format!("virtual tag {id}")))?;
        tag.name = request.name;
        tag.rules = request.rules;
        tag.updated_by = request.author;
        Ok(())
    }
}
