//! HTTP client pool for the load engine.
//!
//! Every client in the pool owns its own connection pool, so `conns`
//! clients really mean `conns` independent TCP+TLS transports. Sharing one
//! transport would let HTTP/2 multiplex everything onto a single connection
//! and defeat the purpose of the setting.
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kubeload_common::profile::ContentType;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER};
use secrecy::ExposeSecret;
use tracing::debug;
use url::Url;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from building the client pool.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The kubeconfig could not be read or interpreted.
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    /// A credential referenced by the kubeconfig is unusable.
    #[error("invalid client credential: {0}")]
    Credential(String),
    /// The underlying HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    Build(#[from] reqwest::Error),
    /// The cluster URL is not a valid URL.
    #[error("invalid cluster url: {0}")]
    ClusterUrl(#[from] url::ParseError),
}

/// Tunables shared by every client in the pool.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `User-Agent` header. `None` uses `kubeload/<version>`.
    pub user_agent: Option<String>,
    /// Response encoding requested via `Accept`.
    pub content_type: ContentType,
    /// Restrict ALPN to HTTP/1.1.
    pub disable_http2: bool,
    /// Retry budget for 429 responses carrying `Retry-After`. Values <= 0
    /// disable retries.
    pub max_retries: i32,
    /// Per-request timeout, covering connect through end of body.
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_agent: None,
            content_type: ContentType::Json,
            disable_http2: false,
            max_retries: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// One client of the pool, owning its own transport.
#[derive(Debug, Clone)]
pub struct LoadClient {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    max_retries: u32,
}

impl LoadClient {
    /// Base URL of the target apiserver.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Start a GET request for `url` with the per-request timeout applied.
    pub fn get(&self, url: Url) -> reqwest::Request {
        let mut req = reqwest::Request::new(reqwest::Method::GET, url);
        *req.timeout_mut() = Some(self.timeout);
        req
    }

    /// Execute a request, honoring 429 + `Retry-After` up to the retry
    /// budget. Transport errors are returned to the caller untouched.
    pub async fn send(&self, req: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        let mut attempt: u32 = 0;
        loop {
            // GET requests have no body, so a clone is always available.
            let this_try = match req.try_clone() {
                Some(clone) if attempt < self.max_retries => Some(clone),
                _ => None,
            };

            let resp = match this_try {
                Some(clone) => self.http.execute(clone).await?,
                None => return self.http.execute(req).await,
            };

            if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if let Some(delay) = retry_after(resp.headers()) {
                    attempt += 1;
                    debug!(attempt, ?delay, "throttled by apiserver, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
            return Ok(resp);
        }
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.parse().ok()?;
    Some(Duration::from_secs(secs))
}

/// Create `conns` independent clients from a kubeconfig.
pub async fn new_clients(
    kubeconfig: &Path,
    conns: usize,
    opts: ClientOptions,
) -> Result<Vec<LoadClient>, ClientError> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig)?;
    let config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;

    let base_url = Url::parse(&config.cluster_url.to_string())?;
    let auth = ClientAuth::from_config(&config)?;
    build_pool(base_url, conns, opts, auth)
}

/// Create `conns` independent anonymous clients against `base_url`.
///
/// Used against auth-less endpoints, e.g. a local apiserver with an open
/// insecure port, and by tests.
pub fn new_anonymous_clients(
    base_url: Url,
    conns: usize,
    opts: ClientOptions,
) -> Result<Vec<LoadClient>, ClientError> {
    build_pool(base_url, conns, opts, ClientAuth::default())
}

fn build_pool(
    base_url: Url,
    conns: usize,
    opts: ClientOptions,
    auth: ClientAuth,
) -> Result<Vec<LoadClient>, ClientError> {
    let mut clients = Vec::with_capacity(conns);
    for _ in 0..conns {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(opts.content_type.as_mime()));
        if let Some(header) = auth.authorization()? {
            headers.insert(reqwest::header::AUTHORIZATION, header);
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(
                opts.user_agent
                    .clone()
                    .unwrap_or_else(|| format!("kubeload/{}", env!("CARGO_PKG_VERSION"))),
            )
            .default_headers(headers)
            .danger_accept_invalid_certs(auth.accept_invalid_certs);

        for cert in &auth.root_certs {
            builder = builder.add_root_certificate(cert.clone());
        }
        if let Some(identity) = &auth.identity {
            builder = builder.identity(identity.clone());
        }
        if opts.disable_http2 {
            builder = builder.http1_only();
        }

        clients.push(LoadClient {
            http: builder.build()?,
            base_url: base_url.clone(),
            timeout: opts.timeout,
            max_retries: opts.max_retries.max(0) as u32,
        });
    }
    Ok(clients)
}

/// Credentials resolved from a kubeconfig, shared by the whole pool.
#[derive(Default)]
struct ClientAuth {
    root_certs: Vec<reqwest::Certificate>,
    identity: Option<reqwest::Identity>,
    token: Option<String>,
    basic: Option<(String, String)>,
    accept_invalid_certs: bool,
}

impl ClientAuth {
    fn from_config(config: &kube::Config) -> Result<Self, ClientError> {
        let mut root_certs = Vec::new();
        if let Some(certs) = &config.root_cert {
            for der in certs {
                root_certs.push(
                    reqwest::Certificate::from_der(der)
                        .map_err(|e| ClientError::Credential(format!("root certificate: {e}")))?,
                );
            }
        }

        let auth = &config.auth_info;
        let token = match (&auth.token, &auth.token_file) {
            (Some(token), _) => Some(token.expose_secret().clone()),
            (None, Some(path)) => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| ClientError::Credential(format!("token file {path}: {e}")))?
                    .trim()
                    .to_owned(),
            ),
            (None, None) => None,
        };

        let basic = match (&auth.username, &auth.password) {
            (Some(user), Some(password)) => {
                Some((user.clone(), password.expose_secret().clone()))
            }
            _ => None,
        };

        let identity = identity_from_auth(auth)?;

        Ok(Self {
            root_certs,
            identity,
            token,
            basic,
            accept_invalid_certs: config.accept_invalid_certs,
        })
    }

    fn authorization(&self) -> Result<Option<HeaderValue>, ClientError> {
        let raw = if let Some(token) = &self.token {
            format!("Bearer {token}")
        } else if let Some((user, password)) = &self.basic {
            let encoded =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
            format!("Basic {encoded}")
        } else {
            return Ok(None);
        };

        let mut header = HeaderValue::from_str(&raw)
            .map_err(|e| ClientError::Credential(format!("authorization header: {e}")))?;
        header.set_sensitive(true);
        Ok(Some(header))
    }
}

fn identity_from_auth(
    auth: &kube::config::AuthInfo,
) -> Result<Option<reqwest::Identity>, ClientError> {
    let cert = match (&auth.client_certificate_data, &auth.client_certificate) {
        (Some(data), _) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| ClientError::Credential(format!("client certificate: {e}")))?,
        ),
        (None, Some(path)) => Some(
            std::fs::read(path)
                .map_err(|e| ClientError::Credential(format!("client certificate {path}: {e}")))?,
        ),
        (None, None) => None,
    };
    let key = match (&auth.client_key_data, &auth.client_key) {
        (Some(data), _) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(data.expose_secret())
                .map_err(|e| ClientError::Credential(format!("client key: {e}")))?,
        ),
        (None, Some(path)) => Some(
            std::fs::read(path)
                .map_err(|e| ClientError::Credential(format!("client key {path}: {e}")))?,
        ),
        (None, None) => None,
    };

    match (cert, key) {
        (Some(cert), Some(key)) => {
            let mut pem = key;
            pem.extend_from_slice(&cert);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| ClientError::Credential(format!("client identity: {e}")))?;
            Ok(Some(identity))
        }
        (None, None) => Ok(None),
        _ => Err(ClientError::Credential(
            "client certificate and key must both be set".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_owns_one_client_per_connection() {
        let base = Url::parse("https://kubernetes.default.svc").unwrap();
        let clients = new_anonymous_clients(base, 3, ClientOptions::default()).unwrap();
        assert_eq!(clients.len(), 3);
    }

    #[test]
    fn missing_kubeconfig_fails() {
        let err = futures::executor::block_on(new_clients(
            Path::new("/definitely/not/a/kubeconfig"),
            1,
            ClientOptions::default(),
        ));
        assert!(matches!(err, Err(ClientError::Kubeconfig(_))));
    }

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }
}
