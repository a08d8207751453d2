//! Caddy route reconciliation through the admin API.
//!
//! Each tenant gets one route, tagged with `"@id": "tenant-<name>"` so that it can be addressed
//! directly under `/id/<route id>` regardless of where it sits in the config tree. New routes are
//! appended to the configured HTTP server (`srv0` by default). A freshly started Caddy has no
//! such server, so the first append fails; the route reconciler then posts a minimal config with
//! an empty server and appends again.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use crate::config::CaddyConfig;
use crate::errors::{Error, Result};
use crate::reconcile::{Outcome, Reconcile, reconcile};
use crate::validation::{validate_name, validate_tenant_name};

/// Desired routing for one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Idempotence key; becomes the route's `@id`
    pub id: String,
    pub host: String,
    /// `host:port`, or a filesystem socket path
    pub upstream: String,
}

impl RouteSpec {
    pub fn new(id: impl Into<String>, host: impl Into<String>, upstream: impl Into<String>) -> Result<Self> {
        let spec = Self {
            id: id.into(),
            host: host.into(),
            upstream: upstream.into(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Route for a tenant: id `tenant-<name>`
    pub fn for_tenant(name: &str, host: impl Into<String>, upstream: impl Into<String>) -> Result<Self> {
        Self::new(route_id(name)?, host, upstream)
    }

    fn validate(&self) -> Result<()> {
        // The id is a URL path segment of the admin API
        validate_tenant_name(&self.id).map_err(|_| invalid("route id", &self.id, "only a-z, 0-9, '-' and '_' are allowed"))?;
        if self.host.is_empty() || self.host.contains(['/', ' ']) {
            return Err(invalid("host", &self.host, "must be a bare hostname"));
        }
        if self.upstream.is_empty() {
            return Err(invalid("upstream", &self.upstream, "must not be empty"));
        }
        Ok(())
    }

    pub fn to_caddy(&self) -> CaddyRoute {
        CaddyRoute {
            id: self.id.clone(),
            matchers: vec![HostMatch {
                host: vec![self.host.clone()],
            }],
            handle: vec![Handler {
                handler: "reverse_proxy".to_string(),
                upstreams: vec![Upstream {
                    dial: upstream_dial(&self.upstream),
                }],
            }],
        }
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> Error {
    Error::Validation {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

pub fn route_id(tenant: &str) -> Result<String> {
    validate_tenant_name(tenant)?;
    Ok(format!("tenant-{tenant}"))
}

/// Caddy dial address for an upstream target.
///
/// Targets starting with `/` or `.` are unix socket paths and get Caddy's `unix/` network
/// prefix; anything else is taken to be `host:port` and passed through unchanged.
pub fn upstream_dial(target: &str) -> String {
    if target.starts_with('/') || target.starts_with('.') {
        format!("unix/{target}")
    } else {
        target.to_string()
    }
}

/// Route document as understood by Caddy's JSON config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaddyRoute {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "match")]
    pub matchers: Vec<HostMatch>,
    pub handle: Vec<Handler>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMatch {
    pub host: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    pub handler: String,
    pub upstreams: Vec<Upstream>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub dial: String,
}

/// Client for the Caddy admin API.
#[derive(Debug, Clone)]
pub struct CaddyClient {
    client: Client,
    base_url: Url,
    server: String,
    listen: Vec<String>,
}

impl CaddyClient {
    pub fn new(config: &CaddyConfig) -> Result<Self> {
        validate_name("caddy.server", &config.server)?;
        let base_url = Url::parse(&config.admin_url).map_err(|e| Error::Config {
            message: format!("caddy.admin_url '{}' is not a valid URL: {e}", config.admin_url),
        })?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Other(anyhow::anyhow!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: ensure_slash(&base_url),
            server: config.server.clone(),
            listen: config.listen.clone(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Other(anyhow::anyhow!("Failed to construct admin API URL for '{path}': {e}")))
    }

    fn routes_url(&self) -> Result<Url> {
        self.url(&format!("config/apps/http/servers/{}/routes", self.server))
    }

    /// `GET /id/<id>`: 200 means present, 404 absent, anything else is an error.
    #[instrument(skip(self))]
    pub async fn route_exists(&self, id: &str) -> Result<bool> {
        let operation = format!("look up route {id}");
        let response = self
            .client
            .get(self.url(&format!("id/{id}"))?)
            .send()
            .await
            .map_err(|e| Error::fatal(&operation, e.to_string()))?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::fatal(operation, format!("unexpected status {status} - {body}")))
            }
        }
    }

    /// `PUT /id/<id>` replaces the route in place.
    #[instrument(skip_all, fields(id = %route.id))]
    pub async fn update_route(&self, route: &CaddyRoute) -> Result<()> {
        let operation = format!("update route {}", route.id);
        let response = self
            .client
            .put(self.url(&format!("id/{}", route.id))?)
            .json(route)
            .send()
            .await
            .map_err(|e| Error::fatal(&operation, e.to_string()))?;

        check_response(response).await.map_err(|body| Error::fatal(operation, body))
    }

    /// Append to the server's route list. Failures are transient: the usual cause is a server
    /// that does not exist yet.
    #[instrument(skip_all, fields(id = %route.id, server = %self.server))]
    pub async fn add_route(&self, route: &CaddyRoute) -> Result<()> {
        let operation = format!("add route {}", route.id);
        let response = self
            .client
            .post(self.routes_url()?)
            .json(route)
            .send()
            .await
            .map_err(|e| Error::transient(&operation, e.to_string()))?;

        check_response(response).await.map_err(|body| Error::transient(operation, body))
    }

    /// Create the HTTP app with an empty server by posting to `/config/`.
    #[instrument(skip(self), fields(server = %self.server))]
    pub async fn init_server(&self) -> Result<()> {
        let operation = format!("initialize server {}", self.server);
        let response = self
            .client
            .post(self.url("config/")?)
            .json(&self.bootstrap_config())
            .send()
            .await
            .map_err(|e| Error::fatal(&operation, e.to_string()))?;

        check_response(response).await.map_err(|body| Error::fatal(operation, body))
    }

    fn bootstrap_config(&self) -> serde_json::Value {
        let mut servers = serde_json::Map::new();
        servers.insert(
            self.server.clone(),
            serde_json::json!({
                "listen": self.listen,
                "routes": [],
            }),
        );
        serde_json::json!({ "apps": { "http": { "servers": servers } } })
    }
}

/// Anything below 300 is success; otherwise the status and body, for the error message.
async fn check_response(response: Response) -> std::result::Result<(), String> {
    let status = response.status();
    if status.as_u16() < 300 {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("API error: {status} - {}", body.trim()))
}

/// Makes sure a url has a trailing slash, so that `join` appends instead of replacing the last
/// path segment (an admin API behind a path prefix, e.g. `http://proxy/caddy`).
fn ensure_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        url.clone()
    } else {
        let mut new_url = url.clone();
        let mut path = new_url.path().to_string();
        path.push('/');
        new_url.set_path(&path);
        new_url
    }
}

struct CaddyRouteResource<'a> {
    client: &'a CaddyClient,
    route: CaddyRoute,
}

#[async_trait]
impl Reconcile for CaddyRouteResource<'_> {
    fn describe(&self) -> String {
        format!("caddy route {}", self.route.id)
    }

    async fn exists(&self) -> Result<bool> {
        self.client.route_exists(&self.route.id).await
    }

    async fn create(&self) -> Result<()> {
        self.client.add_route(&self.route).await
    }

    async fn update(&self) -> Result<()> {
        self.client.update_route(&self.route).await
    }

    fn supports_bootstrap(&self) -> bool {
        true
    }

    async fn bootstrap(&self) -> Result<()> {
        self.client.init_server().await
    }
}

/// Create or update the route so that `spec.host` is served by `spec.upstream`.
#[instrument(skip_all, fields(id = %spec.id, host = %spec.host))]
pub async fn ensure_route(client: &CaddyClient, spec: &RouteSpec) -> Result<Outcome> {
    spec.validate()?;
    let route = spec.to_caddy();
    debug!(dial = %route.handle[0].upstreams[0].dial, "Reconciling route");

    let outcome = reconcile(&CaddyRouteResource { client, route }).await?;
    info!(outcome = %outcome, "Route reconciled");
    Ok(outcome)
}
