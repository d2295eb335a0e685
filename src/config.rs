use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::reconcile::{Backoff, DEFAULT_FAN_OUT_LIMIT};

/// Environment prefix shared by every setting this service reads.
pub const ENV_PREFIX: &str = "SYNC";

const DEFAULT_JOB_INTERVAL: &str = "1h";

/// Per-job scheduling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Whether the timer loop may start this job on its own.
    pub enabled: bool,
    /// Minimum time between two timer-driven starts.
    pub interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(60 * 60),
        }
    }
}

impl ScheduleConfig {
    pub fn new(enabled: bool, interval: Duration) -> Self {
        Self { enabled, interval }
    }

    /// Resolve the schedule of `job_name` through `lookup`.
    ///
    /// Reads `SYNC_SCHEDULER_JOB_<NAME>_ENABLE` and `SYNC_SCHEDULER_JOB_<NAME>_INTERVAL`,
    /// where `<NAME>` is the upper-cased job name.
    pub fn from_lookup<F>(job_name: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prefix = format!("{}_SCHEDULER_JOB_{}", ENV_PREFIX, job_name.to_uppercase());

        let enable_key = format!("{}_ENABLE", prefix);
        let enabled = match lookup(&enable_key) {
            Some(raw) => parse_bool(&enable_key, &raw)?,
            None => false,
        };

        let interval_key = format!("{}_INTERVAL", prefix);
        let raw_interval = lookup(&interval_key).unwrap_or_else(|| DEFAULT_JOB_INTERVAL.into());
        let interval = parse_duration(&raw_interval)?;

        tracing::info!(
            job = job_name,
            enabled,
            interval_secs = interval.as_secs(),
            "Job schedule loaded"
        );

        Ok(Self { enabled, interval })
    }

    pub fn from_env(job_name: &str) -> Result<Self> {
        Self::from_lookup(job_name, |key| std::env::var(key).ok())
    }
}

/// Parse a duration string such as `1h`, `30m`, `1h30m` or `250ms`.
///
/// Every number must carry a unit, except for a bare `0`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let s = value.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| SyncError::InvalidDuration {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "t" => Ok(true),
        "false" | "0" | "no" | "n" | "f" | "" => Ok(false),
        _ => Err(SyncError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| SyncError::InvalidNumber {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Settings consumed by the reconciliation routines.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Display-name prefix shared by every capability group.
    pub group_prefix: String,
    /// Directory administrative unit that owns capability groups.
    pub administrative_unit: String,
    /// Directory application that capability groups are assigned to.
    pub application_object_id: String,
    /// Application role granted on assignment.
    pub application_role: String,
    pub capability_permission_set_arn: String,
    pub capability_logs_permission_set_arn: String,
    pub capability_logs_account_alias: String,
    pub shared_ecr_pull_permission_set_arn: String,
    pub shared_ecr_pull_account_alias: String,
    /// Prefix stripped from account names to obtain the capability alias.
    pub account_name_prefix: String,
    /// Organizational parent under which accounts are discovered.
    pub organizations_root_id: String,
    pub cost_tag_key: String,
    pub cost_tag_author: String,
    /// Identifier of the virtual tag that carries capability ids.
    pub capability_tag_id: String,
    pub mappings_file: PathBuf,
    pub backoff_max_attempts: u32,
    pub backoff_initial_delay: Duration,
    pub fan_out_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            group_prefix: "CI_SSU_Cap -".to_string(),
            administrative_unit: "Team - Cloud Engineering - Self service".to_string(),
            application_object_id: String::new(),
            application_role: "User".to_string(),
            capability_permission_set_arn: String::new(),
            capability_logs_permission_set_arn: String::new(),
            capability_logs_account_alias: String::new(),
            shared_ecr_pull_permission_set_arn: String::new(),
            shared_ecr_pull_account_alias: String::new(),
            account_name_prefix: String::new(),
            organizations_root_id: String::new(),
            cost_tag_key: "dfds.cost.centre".to_string(),
            cost_tag_author: "access-sync".to_string(),
            capability_tag_id: String::new(),
            mappings_file: PathBuf::from("mapping.json"),
            backoff_max_attempts: 4,
            backoff_initial_delay: Duration::from_secs(2),
            fan_out_limit: DEFAULT_FAN_OUT_LIMIT,
        }
    }
}

impl SyncSettings {
    /// Overlay `SYNC_<FIELD>` values found through `lookup` on top of the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let get = |field: &str| lookup(&format!("{}_{}", ENV_PREFIX, field));

        let strings: [(&str, &mut String); 14] = [
            ("GROUP_PREFIX", &mut settings.group_prefix),
            ("ADMINISTRATIVE_UNIT", &mut settings.administrative_unit),
            ("APPLICATION_OBJECT_ID", &mut settings.application_object_id),
            ("APPLICATION_ROLE", &mut settings.application_role),
            (
                "CAPABILITY_PERMISSION_SET_ARN",
                &mut settings.capability_permission_set_arn,
            ),
            (
                "CAPABILITY_LOGS_PERMISSION_SET_ARN",
                &mut settings.capability_logs_permission_set_arn,
            ),
            (
                "CAPABILITY_LOGS_ACCOUNT_ALIAS",
                &mut settings.capability_logs_account_alias,
            ),
            (
                "SHARED_ECR_PULL_PERMISSION_SET_ARN",
                &mut settings.shared_ecr_pull_permission_set_arn,
            ),
            (
                "SHARED_ECR_PULL_ACCOUNT_ALIAS",
                &mut settings.shared_ecr_pull_account_alias,
            ),
            ("ACCOUNT_NAME_PREFIX", &mut settings.account_name_prefix),
            ("ORGANIZATIONS_ROOT_ID", &mut settings.organizations_root_id),
            ("COST_TAG_KEY", &mut settings.cost_tag_key),
            ("COST_TAG_AUTHOR", &mut settings.cost_tag_author),
            ("CAPABILITY_TAG_ID", &mut settings.capability_tag_id),
        ];
        for (field, slot) in strings {
            if let Some(value) = get(field) {
                *slot = value;
            }
        }

        if let Some(path) = get("MAPPINGS_FILE") {
            settings.mappings_file = PathBuf::from(path);
        }
        if let Some(raw) = get("BACKOFF_MAX_ATTEMPTS") {
            settings.backoff_max_attempts = parse_u32("SYNC_BACKOFF_MAX_ATTEMPTS", &raw)?.max(1);
        }
        if let Some(raw) = get("BACKOFF_INITIAL_DELAY") {
            settings.backoff_initial_delay = parse_duration(&raw)?;
        }
        if let Some(raw) = get("FAN_OUT_LIMIT") {
            settings.fan_out_limit = parse_u32("SYNC_FAN_OUT_LIMIT", &raw)?.max(1) as usize;
        }

        Ok(settings)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_max_attempts, self.backoff_initial_delay)
    }
}
