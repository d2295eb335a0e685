//! Boundaries to the external systems the routines converge.
//!
//! Each trait covers exactly the calls a routine makes. Listing calls return
//! one [`Page`] at a time so callers can drive them through
//! [`Backoff`](crate::reconcile::Backoff).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;
use crate::reconcile::Page;

pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub id: String,
    pub root_id: String,
    #[serde(default)]
    pub name: String,
    /// Whether the capability owns at least one cloud context. Capabilities
    /// without one get no directory group.
    #[serde(default)]
    pub has_context: bool,
    /// Member e-mail addresses.
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Capability {
    /// String value of a metadata key, if present and a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdministrativeUnit {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGroup {
    pub display_name: String,
    pub mail_nickname: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: String,
    pub user_principal_name: String,
}

/// A group's role assignment on a directory application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppAssignment {
    pub id: String,
    pub principal_id: String,
    pub principal_display_name: String,
    pub role_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    #[default]
    Active,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: AccountStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgUnit {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A group granted a permission set on an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAssignment {
    pub account_id: String,
    pub permission_set_arn: String,
    pub group_id: String,
}

impl AccountAssignment {
    pub fn key(&self) -> String {
        format!("{}/{}", self.account_id, self.group_id)
    }
}

/// One rule of a virtual cost tag: resources matching `filter` get `to`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRule {
    pub to: String,
    pub filter: TagFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagFilter {
    pub cost_center: String,
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub operator: String,
    pub value: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualTag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<TagRule>,
    #[serde(default)]
    pub updated_by: String,
}

/// Full definition sent when creating or replacing a virtual tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualTagRequest {
    pub name: String,
    pub category: String,
    pub default_value: String,
    pub rules: Vec<TagRule>,
    pub author: String,
}

/// Source of truth for capabilities, their members and metadata.
#[async_trait]
pub trait CapabilityRegistry: Send + Sync {
    async fn capabilities(&self) -> UpstreamResult<Vec<Capability>>;
}

/// Identity directory holding groups, members and application assignments.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn administrative_unit(&self, display_name: &str) -> UpstreamResult<AdministrativeUnit>;

    async fn list_unit_groups(
        &self,
        unit_id: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<Group>>;

    /// Groups whose display name starts with `prefix`.
    async fn list_groups(&self, prefix: &str, token: Option<String>)
        -> UpstreamResult<Page<Group>>;

    async fn create_unit_group(&self, unit_id: &str, group: NewGroup) -> UpstreamResult<Group>;

    async fn list_group_members(
        &self,
        group_id: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<Member>>;

    /// Fails with `NotFound` when no user has this principal name.
    async fn add_group_member(&self, group_id: &str, user_principal_name: &str)
        -> UpstreamResult<()>;

    async fn remove_group_member(&self, group_id: &str, member_id: &str) -> UpstreamResult<()>;

    async fn app_role_id(&self, app_id: &str, role_name: &str) -> UpstreamResult<String>;

    async fn list_app_assignments(
        &self,
        app_id: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<AppAssignment>>;

    async fn assign_app_role(&self, app_id: &str, group_id: &str, role_id: &str)
        -> UpstreamResult<()>;

    async fn remove_app_assignment(&self, app_id: &str, assignment_id: &str)
        -> UpstreamResult<()>;
}

/// Cloud organization and single sign-on administration.
#[async_trait]
pub trait SsoAdmin: Send + Sync {
    async fn list_org_units(
        &self,
        parent_id: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<OrgUnit>>;

    async fn list_accounts(
        &self,
        parent_id: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<Account>>;

    /// SSO groups whose display name starts with `prefix`.
    async fn list_groups(&self, prefix: &str, token: Option<String>)
        -> UpstreamResult<Page<Group>>;

    async fn list_account_assignments(
        &self,
        account_id: &str,
        permission_set_arn: &str,
        token: Option<String>,
    ) -> UpstreamResult<Page<AccountAssignment>>;

    async fn create_account_assignment(&self, assignment: &AccountAssignment)
        -> UpstreamResult<()>;

    async fn delete_account_assignment(&self, assignment: &AccountAssignment)
        -> UpstreamResult<()>;
}

/// Cost-management platform holding virtual tags.
#[async_trait]
pub trait CostPlatform: Send + Sync {
    async fn list_virtual_tags(&self) -> UpstreamResult<Vec<VirtualTag>>;

    async fn create_virtual_tag(&self, request: VirtualTagRequest) -> UpstreamResult<VirtualTag>;

    async fn update_virtual_tag(&self, id: &str, request: VirtualTagRequest) -> UpstreamResult<()>;
}
