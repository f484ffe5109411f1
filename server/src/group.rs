//! Runner group lifecycle: deploy a batch Job of identical runners sharing
//! one ConfigMap-stored load profile, observe it, and wait for it to reach
//! a terminal state.
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, NodeAffinity,
    NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, ObjectFieldSelector, Pod, PodSpec,
    PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ListParams, ObjectMeta, PostParams, VersionMatch};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use kubeload_common::group::{
    OwnerRefError, RunnerGroup, RunnerGroupSpec, RunnerGroupState, RunnerGroupStatus,
};
use kubeload_common::profile::ProfileError;
use tracing::{debug, warn};

use crate::labels::managed_labels;

/// Name of the load profile inside the group's ConfigMap.
pub const CONFIG_MAP_PROFILE_KEY: &str = "load_profile.yaml";

/// Errors from runner group operations.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// Request against the apiserver failed.
    #[error(transparent)]
    Kube(#[from] kube::Error),
    /// The spec's owner reference string is malformed.
    #[error(transparent)]
    OwnerRef(#[from] OwnerRefError),
    /// The profile could not be rendered as YAML for the ConfigMap.
    #[error("failed to marshal load profile: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// A pre-existing ConfigMap does not carry the profile key.
    #[error("configmap {0} doesn't have a load profile")]
    MissingProfile(String),
    /// The group spec URI is unusable.
    #[error("invalid runner group spec uri {uri}: {reason}")]
    SpecUri {
        /// The offending URI.
        uri: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The group's load profile failed validation.
    #[error("invalid load profile: {0}")]
    Profile(#[from] ProfileError),
    /// Reading a file-based group spec failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handler for one runner group.
pub struct GroupHandler {
    name: String,
    namespace: String,
    spec: RunnerGroupSpec,
    owner_ref: Option<OwnerReference>,
    image: String,
    client: Client,
}

impl GroupHandler {
    /// Create a handler. The spec's owner reference is parsed eagerly so a
    /// malformed one fails before anything is deployed.
    pub fn new(
        client: Client,
        namespace: &str,
        name: &str,
        spec: RunnerGroupSpec,
        image: &str,
    ) -> Result<Self, GroupError> {
        let owner_ref = spec.owner_ref()?;
        Ok(Self {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            spec,
            owner_ref,
            image: image.to_owned(),
            client,
        })
    }

    /// The group's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group information with its current status, derived from the
    /// Job. An unreachable or missing Job reports the unknown state.
    pub async fn info(&self) -> RunnerGroup {
        let mut status = RunnerGroupStatus::default();

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        match jobs.get_status(&self.name).await {
            Ok(job) => {
                status.state = if job_finished(&job) {
                    RunnerGroupState::Finished
                } else if job.status.as_ref().and_then(|s| s.start_time.as_ref()).is_none() {
                    RunnerGroupState::Unknown
                } else {
                    RunnerGroupState::Running
                };
                if let Some(job_status) = job.status {
                    status.start_time = job_status.start_time;
                    status.succeeded = job_status.succeeded.unwrap_or(0);
                    status.failed = job_status.failed.unwrap_or(0);
                }
            }
            Err(err) => {
                debug!(group = %self.name, %err, "failed to get job for runner group");
            }
        }

        RunnerGroup {
            name: self.name.clone(),
            spec: self.spec.clone(),
            status: Some(status),
        }
    }

    /// Deploy the group: ensure the profile ConfigMap, then the Job. Both
    /// steps are idempotent.
    pub async fn deploy(&self, upload_url: &str) -> Result<(), GroupError> {
        self.ensure_profile_config_map().await?;
        self.ensure_job(upload_url).await
    }

    // Store the load profile as a ConfigMap for the runners to mount. If
    // the map already exists only the key presence is checked, not its
    // content.
    async fn ensure_profile_config_map(&self) -> Result<(), GroupError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);

        match api.get(&self.name).await {
            Ok(cm) => {
                let has_profile = cm
                    .data
                    .map(|data| data.contains_key(CONFIG_MAP_PROFILE_KEY))
                    .unwrap_or(false);
                if !has_profile {
                    return Err(GroupError::MissingProfile(self.name.clone()));
                }
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let raw = serde_yaml::to_string(&self.spec.load_profile)?;
                let cm = ConfigMap {
                    metadata: self.object_meta(),
                    immutable: Some(true),
                    data: Some(std::collections::BTreeMap::from_iter(vec![(
                        CONFIG_MAP_PROFILE_KEY.to_owned(),
                        raw,
                    )])),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &cm).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn ensure_job(&self, upload_url: &str) -> Result<(), GroupError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);

        match api.get(&self.name).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                api.create(&PostParams::default(), &self.build_job(upload_url))
                    .await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// All pods controlled by the group's Job.
    ///
    /// Listed with resource version "0" so the apiserver answers from its
    /// cache instead of loading the ETCD cluster. Both historical job-name
    /// label keys are matched for compatibility across API versions.
    pub async fn pods(&self) -> Result<Vec<Pod>, GroupError> {
        let selector = format!(
            "batch.kubernetes.io/job-name={name},job-name={name}",
            name = self.name
        );
        let mut params = ListParams::default().labels(&selector);
        params.resource_version = Some("0".to_owned());
        params.version_match = Some(VersionMatch::NotOlderThan);

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pods = api.list(&params).await?;
        Ok(pods.items)
    }

    /// Whether `pod_name` belongs to this group.
    pub async fn is_controlled(&self, pod_name: &str) -> Result<bool, GroupError> {
        // Fast path: the job's name prefixes every pod it owns.
        if !pod_name.starts_with(&self.name) {
            return Ok(false);
        }

        let pods = self.pods().await?;
        Ok(pods
            .iter()
            .any(|pod| pod.metadata.name.as_deref() == Some(pod_name)))
    }

    /// Wait until every runner of the group reached a terminal phase.
    ///
    /// The Job is watched by field selector; transient failures (connection
    /// refused, throttling, internal errors, expired resource versions,
    /// closed watch channels) are retried with the reflector backoff and
    /// never surfaced.
    pub async fn wait(&self) -> Result<(), GroupError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);

        let job = api.get(&self.name).await?;
        if job_finished(&job) {
            return Ok(());
        }

        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let stream = watcher(api, config).default_backoff().applied_objects();
        let mut stream = std::pin::pin!(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(job) => {
                    debug!(
                        group = %self.name,
                        succeeded = job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0),
                        failed = job.status.as_ref().and_then(|s| s.failed).unwrap_or(0),
                        "job update"
                    );
                    if job_finished(&job) {
                        return Ok(());
                    }
                }
                Err(err) => {
                    warn!(group = %self.name, %err, "job watch interrupted, retrying");
                }
            }
        }
        unreachable!("job watch runs until the group finishes");
    }

    fn object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: managed_labels(),
            owner_references: self.owner_ref.clone().map(|oref| vec![oref]),
            ..Default::default()
        }
    }

    fn build_job(&self, upload_url: &str) -> Job {
        let env_vars = vec![
            EnvVar {
                name: "POD_NAME".to_owned(),
                value_from: Some(field_ref("metadata.name")),
                ..Default::default()
            },
            EnvVar {
                name: "POD_NAMESPACE".to_owned(),
                value_from: Some(field_ref("metadata.namespace")),
                ..Default::default()
            },
            EnvVar {
                name: "POD_UID".to_owned(),
                value_from: Some(field_ref("metadata.uid")),
                ..Default::default()
            },
            // The kubelet expands $(POD_NAME) inside the value, giving
            // every runner its own upload route.
            EnvVar {
                name: "TARGET_URL".to_owned(),
                value: Some(upload_url.to_owned()),
                ..Default::default()
            },
            EnvVar {
                name: "RUST_LOG".to_owned(),
                value: Some("info".to_owned()),
                ..Default::default()
            },
        ];

        let node_affinity = if self.spec.node_affinity.is_empty() {
            None
        } else {
            let match_expressions = self
                .spec
                .node_affinity
                .iter()
                .map(|(key, values)| NodeSelectorRequirement {
                    key: key.clone(),
                    operator: "In".to_owned(),
                    values: Some(values.clone()),
                })
                .collect();
            Some(Affinity {
                node_affinity: Some(NodeAffinity {
                    required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: Some(match_expressions),
                            ..Default::default()
                        }],
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
        };

        Job {
            metadata: self.object_meta(),
            spec: Some(JobSpec {
                parallelism: Some(self.spec.count),
                completions: Some(self.spec.count),
                backoff_limit: Some(0),
                completion_mode: Some("Indexed".to_owned()),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "runner".to_owned(),
                            image: Some(self.image.clone()),
                            command: Some(vec![
                                "/usr/bin/kubeload-runner".to_owned(),
                                "run".to_owned(),
                                "--config".to_owned(),
                                "/config/load_profile.yaml".to_owned(),
                            ]),
                            env: Some(env_vars),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "config".to_owned(),
                                mount_path: "/config".to_owned(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        restart_policy: Some("Never".to_owned()),
                        affinity: node_affinity,
                        service_account_name: self.spec.service_account.clone(),
                        volumes: Some(vec![Volume {
                            name: "config".to_owned(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(self.name.clone()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn field_ref(path: &str) -> EnvVarSource {
    EnvVarSource {
        field_ref: Some(ObjectFieldSelector {
            field_path: path.to_owned(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A group finished once every runner reached a terminal phase.
pub fn job_finished(job: &Job) -> bool {
    let completions = job.spec.as_ref().and_then(|s| s.completions).unwrap_or(0);
    let (succeeded, failed) = job
        .status
        .as_ref()
        .map(|s| (s.succeeded.unwrap_or(0), s.failed.unwrap_or(0)))
        .unwrap_or((0, 0));
    succeeded + failed == completions
}

/// Load a [`RunnerGroupSpec`] from a URI.
///
/// Supported schemes:
/// - `file:///abs/path.yaml` reads the spec from the filesystem;
/// - `configmap://name?namespace=<ns>&key=<data-key>` reads it from a
///   ConfigMap in the target cluster (defaults: namespace `default`, key
///   `spec`).
pub async fn spec_from_uri(client: Client, uri: &str) -> Result<RunnerGroupSpec, GroupError> {
    let parsed = url::Url::parse(uri).map_err(|err| GroupError::SpecUri {
        uri: uri.to_owned(),
        reason: err.to_string(),
    })?;

    let raw = match parsed.scheme() {
        "file" => std::fs::read_to_string(parsed.path())?,
        "configmap" => {
            let name = parsed.host_str().unwrap_or_default().to_owned();
            let mut namespace = "default".to_owned();
            let mut key = "spec".to_owned();
            for (k, v) in parsed.query_pairs() {
                match k.as_ref() {
                    "namespace" if !v.is_empty() => namespace = v.into_owned(),
                    "key" if !v.is_empty() => key = v.into_owned(),
                    _ => {}
                }
            }

            let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
            let cm = api.get(&name).await?;
            cm.data
                .and_then(|mut data| data.remove(&key))
                .ok_or_else(|| GroupError::SpecUri {
                    uri: uri.to_owned(),
                    reason: format!("no data {key} in configmap {namespace}/{name}"),
                })?
        }
        other => {
            return Err(GroupError::SpecUri {
                uri: uri.to_owned(),
                reason: format!("unsupported scheme {other}"),
            })
        }
    };

    let spec: RunnerGroupSpec = serde_yaml::from_str(&raw).map_err(GroupError::Yaml)?;
    spec.load_profile.validate()?;
    Ok(spec)
}
