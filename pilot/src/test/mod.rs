//! End-to-end provisioning scenarios.
//!
//! The whole pipeline runs against a recording command runner, an in-memory user directory, a
//! temporary directory standing in for `/home`, `/run/pilot` and `/run/user`, and a wiremock
//! server standing in for the Caddy admin API. The tenant is owned by the user running the tests
//! so that unit files can really be chowned.

use async_trait::async_trait;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::identity::TenantIdentity;
use crate::pipeline::{Pipeline, ProvisionRequest, Stage};
use crate::reconcile::Outcome;
use crate::test_utils::{RecordingRunner, StaticUserDirectory, current_identity, failed, identity, ok};
use crate::units::{generate_units, provisioning_port};

const ROUTE_PATH: &str = "/id/tenant-acme";
const ROUTES_PATH: &str = "/config/apps/http/servers/srv0/routes";

/// A host where `useradd` makes the account visible to later lookups.
struct Host {
    tmp: TempDir,
    runner: RecordingRunner,
    directory: Arc<StaticUserDirectory>,
    tenant: TenantIdentity,
}

impl Host {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let home = tmp.path().join("home/acme");
        fs::create_dir_all(&home).unwrap();

        let tenant = current_identity("acme", home);
        let bus_dir = tmp.path().join("run/user").join(tenant.uid.to_string());
        fs::create_dir_all(&bus_dir).unwrap();
        fs::write(bus_dir.join("bus"), "").unwrap();

        Self {
            tmp,
            runner: RecordingRunner::new(),
            directory: Arc::new(StaticUserDirectory::new([])),
            tenant,
        }
    }

    /// Host where the account already exists
    fn with_tenant() -> Self {
        let host = Self::new();
        host.directory.insert(host.tenant.clone());
        host
    }

    fn root(&self) -> &Path {
        self.tmp.path()
    }

    fn unit_dir(&self) -> PathBuf {
        self.tenant.home_dir.join(".config/systemd/user")
    }

    fn pipeline(&self, caddy: &MockServer) -> Pipeline {
        let mut config = Config::default();
        config.caddy.admin_url = caddy.uri();
        config.caddy.request_timeout = Duration::from_secs(5);
        config.systemd.socket_dir = self.root().join("run/pilot");

        let runner = UseraddRunner {
            inner: self.runner.clone(),
            directory: self.directory.clone(),
            tenant: self.tenant.clone(),
        };
        Pipeline::new(config, Arc::new(runner), self.directory.clone())
            .unwrap()
            .with_runtime_root(self.root().join("run/user"))
    }
}

struct UseraddRunner {
    inner: RecordingRunner,
    directory: Arc<StaticUserDirectory>,
    tenant: TenantIdentity,
}

#[async_trait]
impl CommandRunner for UseraddRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        let output = self.inner.run(command).await?;
        if command.program == "useradd" && output.success() {
            self.directory.insert(self.tenant.clone());
        }
        Ok(output)
    }
}

/// Postgres answering the privilege check; role and database are absent once.
fn empty_database(runner: &RecordingRunner) {
    runner
        .respond_once("WHERE rolname='acme'", ok(""))
        .respond_once("WHERE datname='acme'", ok(""))
        .respond("psql -tAc SELECT 1", ok("1\n"));
}

async fn fresh_caddy() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ROUTE_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ROUTES_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid traversal path at: config/apps"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/config/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    server
}

/// Caddy that must not be contacted at all
async fn untouched_caddy() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(wiremock::matchers::any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    server
}

#[test_log::test(tokio::test)]
async fn test_fresh_host_full_provisioning() {
    let host = Host::new();
    empty_database(&host.runner);
    let caddy = fresh_caddy().await;
    Mock::given(method("POST"))
        .and(path(ROUTES_PATH))
        .and(body_json(json!({
            "@id": "tenant-acme",
            "match": [{"host": ["acme.localhost"]}],
            "handle": [{
                "handler": "reverse_proxy",
                "upstreams": [{"dial": format!("unix/{}", host.root().join("run/pilot/acme.sock").display())}]
            }]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&caddy)
        .await;

    let report = host.pipeline(&caddy).provision(&ProvisionRequest::new("acme")).await.unwrap();

    assert_eq!(report.user, Some(Outcome::Created));
    assert_eq!(report.identity, host.tenant);
    assert_eq!(report.database.role, Outcome::Created);
    assert_eq!(report.database.database, Outcome::Created);
    assert_eq!(report.port, provisioning_port(host.tenant.uid, 10_000).unwrap());
    assert_eq!(report.route.host, "acme.localhost");
    assert_eq!(report.route_outcome, Outcome::CreatedAfterBootstrap);

    for file in ["rest-api.socket", "rest-api-proxy.service", "rest-api.service"] {
        assert!(report.unit_dir.join(file).is_file(), "{file} should be installed");
    }
    let proxy = fs::read_to_string(report.unit_dir.join("rest-api-proxy.service")).unwrap();
    assert!(proxy.contains(&format!("--exit-idle-time=300s 127.0.0.1:{}", report.port)));

    let calls = host.runner.calls();
    let programs: Vec<&str> = calls
        .iter()
        .map(|call| {
            let last = call.split(" -- env ").last().unwrap_or(call.as_str());
            last.split_whitespace()
                .find(|word| !word.contains('='))
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(
        programs,
        vec![
            "useradd",
            "loginctl",
            "systemctl",
            "sudo",
            "sudo",
            "sudo",
            "sudo",
            "sudo",
            "systemctl",
            "systemctl",
        ]
    );
    assert!(calls[8].ends_with("systemctl --user daemon-reload"));
    assert!(calls[9].ends_with("systemctl --user enable --now rest-api.socket"));
}

#[test_log::test(tokio::test)]
async fn test_second_run_converges_without_creating() {
    let host = Host::with_tenant();
    host.runner.respond("psql -tAc SELECT 1", ok("1\n"));

    let caddy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ROUTE_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&caddy)
        .await;
    Mock::given(method("PUT"))
        .and(path(ROUTE_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&caddy)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&caddy)
        .await;

    let report = host.pipeline(&caddy).provision(&ProvisionRequest::new("acme")).await.unwrap();

    assert_eq!(report.user, Some(Outcome::Existing));
    assert_eq!(report.database.role, Outcome::Existing);
    assert_eq!(report.database.database, Outcome::Existing);
    assert_eq!(report.route_outcome, Outcome::Existing);
    assert_eq!(host.runner.count("useradd"), 0);
    assert_eq!(host.runner.count("createuser"), 0);
    assert_eq!(host.runner.count("createdb"), 0);
}

#[test_log::test(tokio::test)]
async fn test_skip_user_requires_existing_account() {
    let host = Host::new();
    let caddy = untouched_caddy().await;

    let mut request = ProvisionRequest::new("acme");
    request.create_user = false;
    let err = host.pipeline(&caddy).provision(&request).await.unwrap_err();

    assert_eq!(err.stage, Stage::Identity);
    assert!(matches!(err.source, Error::NotFound { .. }));
    assert!(host.runner.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_database_failure_stops_pipeline() {
    let host = Host::with_tenant();
    host.runner
        .respond_once("WHERE rolname='acme'", ok(""))
        .respond("psql -tAc SELECT 1", ok("1\n"))
        .respond("createuser", failed(1, "createuser: error: role \"acme\" could not be created"));
    let caddy = untouched_caddy().await;

    let mut request = ProvisionRequest::new("acme");
    request.create_user = false;
    let err = host.pipeline(&caddy).provision(&request).await.unwrap_err();

    assert_eq!(err.stage, Stage::Database);
    assert!(err.to_string().starts_with("database stage failed: "), "{err}");
    assert!(err.to_string().contains("could not be created"), "{err}");
    assert!(!host.unit_dir().exists(), "units must not be installed after a failed stage");
    assert_eq!(host.runner.count("systemctl --user"), 0);
}

#[test_log::test(tokio::test)]
async fn test_invalid_name_is_rejected_up_front() {
    let host = Host::new();
    let caddy = untouched_caddy().await;

    let err = host
        .pipeline(&caddy)
        .provision(&ProvisionRequest::new("Acme Corp"))
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::User);
    assert!(matches!(err.source, Error::Validation { .. }));
    assert!(host.runner.calls().is_empty());
    assert_eq!(host.directory.lookups(), 0);
}

#[test_log::test(tokio::test)]
async fn test_custom_domain_and_tcp_upstream() {
    let host = Host::with_tenant();
    host.runner.respond("psql -tAc SELECT 1", ok("1\n"));

    let caddy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ROUTE_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&caddy)
        .await;
    Mock::given(method("POST"))
        .and(path(ROUTES_PATH))
        .and(body_json(json!({
            "@id": "tenant-acme",
            "match": [{"host": ["app.example.com"]}],
            "handle": [{"handler": "reverse_proxy", "upstreams": [{"dial": "localhost:8080"}]}]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&caddy)
        .await;

    let request = ProvisionRequest {
        domain: Some("app.example.com".to_string()),
        upstream: Some("localhost:8080".to_string()),
        idle_timeout: Some(Duration::from_secs(10)),
        create_user: false,
        ..ProvisionRequest::new("acme")
    };
    let report = host.pipeline(&caddy).provision(&request).await.unwrap();

    assert_eq!(report.route_outcome, Outcome::Created);
    let proxy = fs::read_to_string(host.unit_dir().join("rest-api-proxy.service")).unwrap();
    assert!(proxy.contains("--exit-idle-time=10s"), "{proxy}");
}

/// uid 1042 yields port 11042 in every unit that carries it.
#[test]
fn test_acme_uid_1042_units() {
    let units = generate_units(&Config::default().systemd, &identity("acme", 1042), Duration::from_secs(300)).unwrap();

    assert_eq!(units.port, 11042);
    assert!(units.proxy.contents.contains("127.0.0.1:11042"));
    assert!(units.service.contents.contains("Environment=PORT=11042"));
    assert!(units.socket.contents.contains("ListenStream=/run/pilot/acme.sock"));
}
