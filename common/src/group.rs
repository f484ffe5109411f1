//! Runner group types.
//!
//! A runner group is a set of identically configured runners deployed as one
//! batch Job, all executing the same load profile.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use serde::{Deserialize, Serialize};

use crate::profile::LoadProfile;

/// A runner group with its current status.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
pub struct RunnerGroup {
    /// Name of the group. Also the name of its ConfigMap and Job.
    pub name: String,
    /// Desired behavior of the group.
    pub spec: RunnerGroupSpec,
    /// Current state, derived from the Job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunnerGroupStatus>,
}

/// Desired behavior of a runner group.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RunnerGroupSpec {
    /// Number of runner pods.
    pub count: i32,
    /// The load profile every runner executes.
    pub load_profile: LoadProfile,
    /// Pin runners to nodes carrying these labels. Keyed by label name,
    /// values are the accepted label values.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub node_affinity: std::collections::BTreeMap<String, Vec<String>>,
    /// ServiceAccount used by the runner pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    /// Owner of the group's resources, as `apiVersion:kind:name:uid`.
    /// Deleting the owner garbage collects the ConfigMap and Job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_reference: Option<String>,
}

impl RunnerGroupSpec {
    /// Parse the `apiVersion:kind:name:uid` owner reference, if any.
    pub fn owner_ref(&self) -> Result<Option<OwnerReference>, OwnerRefError> {
        let Some(raw) = &self.owner_reference else {
            return Ok(None);
        };

        let parts: Vec<&str> = raw.splitn(4, ':').collect();
        let &[api_version, kind, name, uid] = parts.as_slice() else {
            return Err(OwnerRefError(raw.clone()));
        };
        if api_version.is_empty() || kind.is_empty() || name.is_empty() || uid.is_empty() {
            return Err(OwnerRefError(raw.clone()));
        }

        Ok(Some(OwnerReference {
            api_version: api_version.to_owned(),
            kind: kind.to_owned(),
            name: name.to_owned(),
            uid: uid.to_owned(),
            controller: Some(true),
            ..Default::default()
        }))
    }
}

/// Owner reference string is not `apiVersion:kind:name:uid`.
#[derive(Debug, thiserror::Error)]
#[error("owner reference {0:?} is not in apiVersion:kind:name:uid format")]
pub struct OwnerRefError(pub String);

/// Lifecycle state of a runner group.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum RunnerGroupState {
    /// The Job does not exist or has not started.
    #[default]
    Unknown,
    /// Runners are still executing.
    Running,
    /// Every runner reached a terminal phase.
    Finished,
}

/// Current state of a runner group, derived from its Job.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RunnerGroupStatus {
    /// Lifecycle state.
    pub state: RunnerGroupState,
    /// When the Job started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,
    /// Runners that reached phase Succeeded.
    pub succeeded: i32,
    /// Runners that reached phase Failed.
    pub failed: i32,
}
