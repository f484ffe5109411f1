//! Load profile types.
//!
//! A load profile is the declarative description of one runner's workload:
//! rate ceiling, total request count, connection and worker counts, and the
//! weighted request mix. Profiles are written as YAML, validated once, and
//! then shared read-only by every worker.
use serde::{Deserialize, Serialize};

/// Errors produced by [`LoadProfile::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// The profile version is not supported.
    #[error("unsupported profile version {0}, expected 1")]
    Version(u32),
    /// The rate ceiling is negative.
    #[error("rate must be non-negative, got {0}")]
    NegativeRate(f64),
    /// The total request count is zero.
    #[error("total must be positive")]
    ZeroTotal,
    /// The connection count is zero.
    #[error("conns must be positive")]
    ZeroConns,
    /// The request mix is empty.
    #[error("spec must define at least one request")]
    NoRequests,
    /// A request entry does not have exactly one variant.
    #[error("request {0} must set exactly one of staleList/quorumList/staleGet/quorumGet/put/getPodLog")]
    VariantCount(usize),
    /// All shares are zero, so the weighted pick is undefined.
    #[error("sum of shares must be positive")]
    ZeroShares,
    /// A field inside one request variant is out of bounds.
    #[error("request {index}: {reason}")]
    Request {
        /// Position of the offending entry in `spec.requests`.
        index: usize,
        /// Human readable description of the violation.
        reason: String,
    },
}

/// LoadProfile defines how to generate load traffic from one runner to the
/// kube-apiserver.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
pub struct LoadProfile {
    /// Version of this object. Only version 1 exists.
    pub version: u32,
    /// Free text describing the profile.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Behavior of the load traffic.
    pub spec: LoadProfileSpec,
}

impl LoadProfile {
    /// Check the profile for out-of-bounds values before any traffic is
    /// generated.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.version != 1 {
            return Err(ProfileError::Version(self.version));
        }
        self.spec.validate()
    }
}

/// LoadProfileSpec defines the load traffic for the target cluster.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoadProfileSpec {
    /// Maximum requests per second. Zero means no ceiling.
    #[serde(default)]
    pub rate: f64,
    /// Total number of requests the runner issues before terminating.
    pub total: usize,
    /// Number of long-lived connections, each owned by one client.
    pub conns: usize,
    /// Number of worker tasks issuing requests. Zero falls back to `conns`.
    /// Workers beyond `conns` share connections round-robin.
    #[serde(default)]
    pub client: usize,
    /// Response encoding requested from the apiserver.
    #[serde(default)]
    pub content_type: ContentType,
    /// Restrict clients to HTTP/1.1 instead of negotiating HTTP/2.
    #[serde(default)]
    pub disable_http2: bool,
    /// Retry budget for 429 responses. Values <= 0 disable retries.
    #[serde(default)]
    pub max_retries: i32,
    /// The weighted request mix.
    #[serde(default)]
    pub requests: Vec<WeightedRequest>,
}

impl LoadProfileSpec {
    /// Check the spec for out-of-bounds values. [`LoadProfile::validate`]
    /// additionally checks the profile version.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.rate < 0.0 {
            return Err(ProfileError::NegativeRate(self.rate));
        }
        if self.total == 0 {
            return Err(ProfileError::ZeroTotal);
        }
        if self.conns == 0 {
            return Err(ProfileError::ZeroConns);
        }
        if self.requests.is_empty() {
            return Err(ProfileError::NoRequests);
        }
        for (index, req) in self.requests.iter().enumerate() {
            req.validate(index)?;
        }
        if self.requests.iter().map(|r| r.shares as u64).sum::<u64>() == 0 {
            return Err(ProfileError::ZeroShares);
        }
        Ok(())
    }
}

/// Response encoding to request via the `Accept` header.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    /// `application/json`
    #[default]
    Json,
    /// `application/vnd.kubernetes.protobuf`
    Protobuf,
}

impl ContentType {
    /// The `Accept` header value for this encoding.
    pub fn as_mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Protobuf => "application/vnd.kubernetes.protobuf",
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ContentType::Json),
            "protobuf" => Ok(ContentType::Protobuf),
            other => Err(format!("invalid content type {other:?}, expected json or protobuf")),
        }
    }
}

/// One request shape with its weight. Exactly one of the variant fields may
/// be set; unknown variants are rejected during deserialization.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WeightedRequest {
    /// Weight of this request within the mix.
    pub shares: u32,
    /// LIST served from the apiserver watch cache (resource version "0").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_list: Option<RequestList>,
    /// LIST served from quorum-backed storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum_list: Option<RequestList>,
    /// GET served from the apiserver watch cache (resource version "0").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_get: Option<RequestGet>,
    /// GET served from quorum-backed storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum_get: Option<RequestGet>,
    /// Mutating request writing randomly generated payloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub put: Option<RequestPut>,
    /// Fetch a pod's log subresource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_pod_log: Option<RequestGetPodLog>,
}

impl WeightedRequest {
    fn validate(&self, index: usize) -> Result<(), ProfileError> {
        let variants = [
            self.stale_list.is_some(),
            self.quorum_list.is_some(),
            self.stale_get.is_some(),
            self.quorum_get.is_some(),
            self.put.is_some(),
            self.get_pod_log.is_some(),
        ];
        if variants.iter().filter(|set| **set).count() != 1 {
            return Err(ProfileError::VariantCount(index));
        }

        let fail = |reason: String| ProfileError::Request { index, reason };

        // Paginated stale lists are unsupported by the apiserver cache.
        if let Some(list) = &self.stale_list {
            if list.limit != 0 {
                return Err(fail(format!(
                    "stale list cannot use a page limit (limit={})",
                    list.limit
                )));
            }
        }
        if let Some(list) = self.stale_list.as_ref().or(self.quorum_list.as_ref()) {
            if list.limit < 0 {
                return Err(fail(format!("limit must be non-negative, got {}", list.limit)));
            }
        }
        if let Some(get) = self.stale_get.as_ref().or(self.quorum_get.as_ref()) {
            if get.name.is_empty() {
                return Err(fail("get requires a target name".to_owned()));
            }
        }
        if let Some(put) = &self.put {
            if put.name_prefix.is_empty() {
                return Err(fail("put requires a name prefix".to_owned()));
            }
            if put.key_space_size == 0 {
                return Err(fail("put requires a positive keySpaceSize".to_owned()));
            }
            if put.value_size == 0 {
                return Err(fail("put requires a positive valueSize".to_owned()));
            }
        }
        if let Some(log) = &self.get_pod_log {
            if log.namespace.is_empty() || log.name.is_empty() {
                return Err(fail("getPodLog requires namespace and name".to_owned()));
            }
        }
        Ok(())
    }
}

/// LIST request against a collection of objects.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestList {
    /// API group. Empty means the core group.
    #[serde(default)]
    pub group: String,
    /// API version, e.g. `v1`.
    pub version: String,
    /// Plural resource name, e.g. `pods`.
    pub resource: String,
    /// Namespace scope. Empty means cluster scope.
    #[serde(default)]
    pub namespace: String,
    /// Page size. Zero disables pagination.
    #[serde(default)]
    pub limit: i64,
    /// Label selector expression.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label_selector: String,
    /// Field selector expression.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field_selector: String,
}

/// GET request for a single object.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestGet {
    /// API group. Empty means the core group.
    #[serde(default)]
    pub group: String,
    /// API version, e.g. `v1`.
    pub version: String,
    /// Plural resource name.
    pub resource: String,
    /// Namespace scope. Empty means cluster scope.
    #[serde(default)]
    pub namespace: String,
    /// Object name.
    pub name: String,
}

/// Mutating request for a resource type that tolerates random payloads
/// (configmaps, secrets).
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestPut {
    /// API group. Empty means the core group.
    #[serde(default)]
    pub group: String,
    /// API version.
    pub version: String,
    /// Plural resource name.
    pub resource: String,
    /// Namespace scope.
    #[serde(default)]
    pub namespace: String,
    /// Prefix for generated object names.
    pub name_prefix: String,
    /// Size of the random name suffix space.
    pub key_space_size: u64,
    /// Payload size in bytes.
    pub value_size: u64,
}

/// Fetch the log subresource of one pod.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RequestGetPodLog {
    /// Pod namespace.
    pub namespace: String,
    /// Pod name.
    pub name: String,
    /// Container to read from. Empty selects the only container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// Return only the last N lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_lines: Option<i64>,
    /// Truncate the log after this many bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
version: 1
description: test
spec:
  rate: 100
  total: 10000
  conns: 2
  client: 1
  contentType: json
  requests:
  - staleGet:
      version: v1
      resource: pods
      namespace: default
      name: x1
    shares: 100
  - quorumGet:
      group: apps
      version: v1
      resource: deployments
      namespace: default
      name: x2
    shares: 150
  - staleList:
      version: v1
      resource: pods
      namespace: default
      labelSelector: app=x2
      fieldSelector: spec.nodeName=x
    shares: 200
  - quorumList:
      version: v1
      resource: configmaps
      namespace: default
      limit: 10000
      labelSelector: app=x3
    shares: 400
  - put:
      version: v1
      resource: configmaps
      namespace: kubeload
      namePrefix: kubeload-
      keySpaceSize: 1000
      valueSize: 1024
    shares: 1000
  - getPodLog:
      namespace: default
      name: hello
      container: main
      tailLines: 1000
      limitBytes: 1024
    shares: 10
"#;

    #[test]
    fn unmarshal_from_yaml() {
        let profile: LoadProfile = serde_yaml::from_str(PROFILE).unwrap();
        assert_eq!(profile.version, 1);
        assert_eq!(profile.description, "test");
        assert_eq!(profile.spec.rate, 100.0);
        assert_eq!(profile.spec.total, 10000);
        assert_eq!(profile.spec.conns, 2);
        assert_eq!(profile.spec.client, 1);
        assert_eq!(profile.spec.content_type, ContentType::Json);
        assert_eq!(profile.spec.requests.len(), 6);

        let get = profile.spec.requests[0].stale_get.as_ref().unwrap();
        assert_eq!(profile.spec.requests[0].shares, 100);
        assert_eq!(get.group, "");
        assert_eq!(get.version, "v1");
        assert_eq!(get.resource, "pods");
        assert_eq!(get.namespace, "default");
        assert_eq!(get.name, "x1");

        assert!(profile.spec.requests[1].quorum_get.is_some());
        assert_eq!(profile.spec.requests[1].shares, 150);

        let list = profile.spec.requests[2].stale_list.as_ref().unwrap();
        assert_eq!(list.limit, 0);
        assert_eq!(list.label_selector, "app=x2");
        assert_eq!(list.field_selector, "spec.nodeName=x");

        let list = profile.spec.requests[3].quorum_list.as_ref().unwrap();
        assert_eq!(list.limit, 10000);

        let put = profile.spec.requests[4].put.as_ref().unwrap();
        assert_eq!(put.name_prefix, "kubeload-");
        assert_eq!(put.key_space_size, 1000);
        assert_eq!(put.value_size, 1024);

        let log = profile.spec.requests[5].get_pod_log.as_ref().unwrap();
        assert_eq!(log.container.as_deref(), Some("main"));
        assert_eq!(log.tail_lines, Some(1000));
        assert_eq!(log.limit_bytes, Some(1024));

        profile.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_version() {
        let mut profile: LoadProfile = serde_yaml::from_str(PROFILE).unwrap();
        profile.version = 2;
        assert!(matches!(profile.validate(), Err(ProfileError::Version(2))));
    }

    #[test]
    fn validate_rejects_zero_conns() {
        let mut profile: LoadProfile = serde_yaml::from_str(PROFILE).unwrap();
        profile.spec.conns = 0;
        assert!(matches!(profile.validate(), Err(ProfileError::ZeroConns)));
    }

    #[test]
    fn validate_rejects_stale_list_with_limit() {
        let mut profile: LoadProfile = serde_yaml::from_str(PROFILE).unwrap();
        profile.spec.requests[2].stale_list.as_mut().unwrap().limit = 500;
        assert!(matches!(
            profile.validate(),
            Err(ProfileError::Request { index: 2, .. })
        ));
    }

    #[test]
    fn validate_rejects_multiple_variants() {
        let mut profile: LoadProfile = serde_yaml::from_str(PROFILE).unwrap();
        profile.spec.requests[0].quorum_get = profile.spec.requests[1].quorum_get.clone();
        assert!(matches!(
            profile.validate(),
            Err(ProfileError::VariantCount(0))
        ));
    }

    #[test]
    fn validate_rejects_zero_shares() {
        let mut profile: LoadProfile = serde_yaml::from_str(PROFILE).unwrap();
        for req in &mut profile.spec.requests {
            req.shares = 0;
        }
        assert!(matches!(profile.validate(), Err(ProfileError::ZeroShares)));
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let doc = r#"
version: 1
spec:
  total: 1
  conns: 1
  requests:
  - shares: 1
    watchList:
      version: v1
      resource: pods
"#;
        assert!(serde_yaml::from_str::<LoadProfile>(doc).is_err());
    }
}
