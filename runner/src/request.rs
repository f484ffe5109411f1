//! Translation of request descriptors into concrete apiserver requests.
use kubeload_common::profile::{RequestGet, RequestGetPodLog, RequestList, WeightedRequest};
use url::Url;

use crate::client::LoadClient;

/// Stale reads pin the resource version to "0" so the apiserver answers
/// from its watch cache instead of quorum-backed storage.
const STALE_RESOURCE_VERSION: &str = "0";

/// A weighted request entry that cannot be turned into traffic.
#[derive(Debug, thiserror::Error)]
pub enum UnsupportedRequest {
    /// Mutating requests are modeled but not generated yet.
    #[error("put requests are not supported yet")]
    Put,
    /// The entry has no variant set. Validation normally catches this first.
    #[error("request defines no variant")]
    Empty,
}

/// Builder for one request shape of the load profile.
///
/// The scheduler treats builders as opaque: it never inspects which variant
/// it is driving.
#[derive(Debug, Clone)]
pub enum RequestBuilder {
    /// Single-object read.
    Get(GetBuilder),
    /// Collection read.
    List(ListBuilder),
    /// Pod log subresource read.
    PodLog(PodLogBuilder),
}

impl RequestBuilder {
    /// Map a validated profile entry onto a builder.
    pub fn from_weighted(req: &WeightedRequest) -> Result<Self, UnsupportedRequest> {
        if let Some(get) = &req.stale_get {
            return Ok(RequestBuilder::Get(GetBuilder::new(get, true)));
        }
        if let Some(get) = &req.quorum_get {
            return Ok(RequestBuilder::Get(GetBuilder::new(get, false)));
        }
        if let Some(list) = &req.stale_list {
            return Ok(RequestBuilder::List(ListBuilder::new(list, true)));
        }
        if let Some(list) = &req.quorum_list {
            return Ok(RequestBuilder::List(ListBuilder::new(list, false)));
        }
        if let Some(log) = &req.get_pod_log {
            return Ok(RequestBuilder::PodLog(PodLogBuilder::new(log)));
        }
        if req.put.is_some() {
            return Err(UnsupportedRequest::Put);
        }
        Err(UnsupportedRequest::Empty)
    }

    /// Logical verb, used for logging.
    pub fn method(&self) -> &'static str {
        match self {
            RequestBuilder::Get(_) => "GET",
            RequestBuilder::List(_) => "LIST",
            RequestBuilder::PodLog(_) => "POD_LOG",
        }
    }

    /// Build a concrete request against `client`'s target cluster.
    pub fn build(&self, client: &LoadClient) -> reqwest::Request {
        client.get(self.url(client.base_url()))
    }

    /// The request URL, including its query string.
    pub fn url(&self, base: &Url) -> Url {
        match self {
            RequestBuilder::Get(b) => b.url(base),
            RequestBuilder::List(b) => b.url(base),
            RequestBuilder::PodLog(b) => b.url(base),
        }
    }
}

// Core group resources live under /api/<version>, everything else under
// /apis/<group>/<version>.
fn resource_path(base: &Url, group: &str, version: &str, namespace: &str) -> Url {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .expect("cluster url must be a base url");
        segments.pop_if_empty();
        if group.is_empty() {
            segments.push("api");
        } else {
            segments.extend(["apis", group]);
        }
        segments.push(version);
        if !namespace.is_empty() {
            segments.extend(["namespaces", namespace]);
        }
    }
    url
}

/// Builds GET requests for one object.
#[derive(Debug, Clone)]
pub struct GetBuilder {
    group: String,
    version: String,
    resource: String,
    namespace: String,
    name: String,
    resource_version: Option<&'static str>,
}

impl GetBuilder {
    fn new(src: &RequestGet, stale: bool) -> Self {
        Self {
            group: src.group.clone(),
            version: src.version.clone(),
            resource: src.resource.clone(),
            namespace: src.namespace.clone(),
            name: src.name.clone(),
            resource_version: stale.then_some(STALE_RESOURCE_VERSION),
        }
    }

    fn url(&self, base: &Url) -> Url {
        let mut url = resource_path(base, &self.group, &self.version, &self.namespace);
        url.path_segments_mut()
            .expect("cluster url must be a base url")
            .extend([self.resource.as_str(), self.name.as_str()]);
        if let Some(rv) = self.resource_version {
            url.query_pairs_mut().append_pair("resourceVersion", rv);
        }
        url
    }
}

/// Builds LIST requests for a collection.
#[derive(Debug, Clone)]
pub struct ListBuilder {
    group: String,
    version: String,
    resource: String,
    namespace: String,
    limit: i64,
    label_selector: String,
    field_selector: String,
    resource_version: Option<&'static str>,
}

impl ListBuilder {
    fn new(src: &RequestList, stale: bool) -> Self {
        Self {
            group: src.group.clone(),
            version: src.version.clone(),
            resource: src.resource.clone(),
            namespace: src.namespace.clone(),
            limit: src.limit,
            label_selector: src.label_selector.clone(),
            field_selector: src.field_selector.clone(),
            resource_version: stale.then_some(STALE_RESOURCE_VERSION),
        }
    }

    fn url(&self, base: &Url) -> Url {
        let mut url = resource_path(base, &self.group, &self.version, &self.namespace);
        url.path_segments_mut()
            .expect("cluster url must be a base url")
            .push(&self.resource);
        {
            let mut query = url.query_pairs_mut();
            if !self.label_selector.is_empty() {
                query.append_pair("labelSelector", &self.label_selector);
            }
            if !self.field_selector.is_empty() {
                query.append_pair("fieldSelector", &self.field_selector);
            }
            if self.limit > 0 {
                query.append_pair("limit", &self.limit.to_string());
            }
            if let Some(rv) = self.resource_version {
                query.append_pair("resourceVersion", rv);
            }
        }
        url
    }
}

/// Builds pod log subresource requests.
#[derive(Debug, Clone)]
pub struct PodLogBuilder {
    namespace: String,
    name: String,
    container: Option<String>,
    tail_lines: Option<i64>,
    limit_bytes: Option<i64>,
}

impl PodLogBuilder {
    fn new(src: &RequestGetPodLog) -> Self {
        Self {
            namespace: src.namespace.clone(),
            name: src.name.clone(),
            container: src.container.clone(),
            tail_lines: src.tail_lines,
            limit_bytes: src.limit_bytes,
        }
    }

    fn url(&self, base: &Url) -> Url {
        let mut url = resource_path(base, "", "v1", &self.namespace);
        url.path_segments_mut()
            .expect("cluster url must be a base url")
            .extend(["pods", self.name.as_str(), "log"]);
        {
            let mut query = url.query_pairs_mut();
            if let Some(container) = &self.container {
                query.append_pair("container", container);
            }
            if let Some(tail) = self.tail_lines {
                query.append_pair("tailLines", &tail.to_string());
            }
            if let Some(limit) = self.limit_bytes {
                query.append_pair("limitBytes", &limit.to_string());
            }
        }
        url
    }
}
