//! Purpose: End-to-end tests for the HTTP surface over a scripted interpreter.
//! Exports: None (integration test module).
//! Role: Validate status codes, async dispatch, parse errors and auth across real TCP.
//! Invariants: The router is served in-process on an ephemeral loopback port.
//! Invariants: Blocking `ureq` calls run on the blocking pool so the server keeps making progress.

use shieldexec::core::error::Error;
use shieldexec::core::value::Value;
use shieldexec::engine::CommandEngine;
use shieldexec::link::{InterpreterLink, LinkProvider};
use shieldexec::packages;
use shieldexec::rewrite::{MethodRewriter, MethodTable};
use shieldexec::serve::{AppState, router};
use shieldexec::workspace::DirWorkspaceStore;
use serde_json::Value as Json;
use std::io::Read;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Backend {
    calls: Mutex<Vec<String>>,
}

impl Backend {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

struct ScriptedProvider {
    backend: Arc<Backend>,
}

impl LinkProvider for ScriptedProvider {
    fn connect(&self, _profile: &str) -> Result<Box<dyn InterpreterLink>, Error> {
        Ok(Box::new(ScriptedLink {
            backend: Arc::clone(&self.backend),
        }))
    }
}

struct ScriptedLink {
    backend: Arc<Backend>,
}

impl InterpreterLink for ScriptedLink {
    fn execute(&mut self, call: &str) -> Result<Value, Error> {
        self.backend.calls.lock().expect("calls").push(call.to_string());
        match call {
            "base::local(base::ls(.DSTableEnv))" => {
                Ok(Value::Strings(vec!["datashield.PATIENT".to_string()]))
            }
            "base::ls()" => Ok(Value::Strings(vec!["D".to_string()])),
            _ if call == packages::PACKAGES_CALL => Ok(Value::Strings(vec![
                "base\t3.6.1\t3.6.1\t/usr/local/lib/R/library".to_string(),
                "desc\t1.2.0\t3.6.1\t/usr/local/lib/R/site-library".to_string(),
            ])),
            _ if call.starts_with("try(base::serialize(") => Ok(Value::Raw(Vec::new())),
            _ => Ok(Value::Null),
        }
    }

    fn write_file(&mut self, _name: &str, _bytes: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn read_file(&mut self, _name: &str) -> Result<Vec<u8>, Error> {
        Ok(b"workspace".to_vec())
    }
}

struct TestServer {
    base_url: String,
    backend: Arc<Backend>,
    task: tokio::task::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn start(token: Option<&str>, admin_token: Option<&str>) -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(Backend::default());
    let store = Arc::new(DirWorkspaceStore::new(dir.path().join("workspaces")).expect("store"));
    let engine = CommandEngine::new(
        Arc::new(ScriptedProvider {
            backend: Arc::clone(&backend),
        }),
        store,
    )
    .expect("engine");
    let state = AppState::new(
        Arc::new(engine),
        Arc::new(MethodRewriter::new(MethodTable::builtin())),
    )
    .with_token(token.map(str::to_string))
    .with_admin_token(admin_token.map(str::to_string));
    let app = router(Arc::new(state), 1024 * 1024);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    TestServer {
        base_url: format!("http://{addr}"),
        backend,
        task,
        _dir: dir,
    }
}

struct Reply {
    status: u16,
    location: Option<String>,
    content_type: String,
    body: Vec<u8>,
}

impl Reply {
    fn json(&self) -> Json {
        serde_json::from_slice(&self.body).expect("json body")
    }
}

async fn request(
    method: &str,
    url: String,
    headers: Vec<(&'static str, String)>,
    body: Option<Vec<u8>>,
) -> Reply {
    let method = method.to_string();
    tokio::task::spawn_blocking(move || {
        let mut req = ureq::request(&method, &url);
        for (name, value) in &headers {
            req = req.set(name, value);
        }
        let result = match body {
            Some(bytes) => req.send_bytes(&bytes),
            None => req.call(),
        };
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => panic!("transport error: {err}"),
        };
        let status = response.status();
        let location = response.header("Location").map(str::to_string);
        let content_type = response.content_type().to_string();
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .expect("read body");
        Reply {
            status,
            location,
            content_type,
            body,
        }
    })
    .await
    .expect("request task")
}

fn user(name: &str) -> Vec<(&'static str, String)> {
    vec![("X-User", name.to_string())]
}

#[tokio::test(flavor = "multi_thread")]
async fn healthz_reports_sessions() {
    let server = start(None, None).await;
    let reply = request("GET", format!("{}/healthz", server.base_url), vec![], None).await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["ok"], true);
    assert_eq!(reply.json()["sessions"], 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_sync_returns_raw_bytes() {
    let server = start(None, None).await;
    let reply = request(
        "POST",
        format!("{}/execute", server.base_url),
        user("henk"),
        Some(b"meanDS(D$age)".to_vec()),
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.content_type, "application/octet-stream");
    assert!(reply.body.is_empty());
    assert_eq!(
        server.backend.calls(),
        vec!["try(base::serialize({dsBase::meanDS(D$age)}, NULL))".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_async_defers_to_lastcommand() {
    let server = start(None, None).await;
    let missing = request("GET", format!("{}/lastcommand", server.base_url), user("henk"), None).await;
    assert_eq!(missing.status, 404);
    let missing = request("GET", format!("{}/lastresult", server.base_url), user("henk"), None).await;
    assert_eq!(missing.status, 404);

    let reply = request(
        "POST",
        format!("{}/execute?async=true", server.base_url),
        user("henk"),
        Some(b"meanDS(D$age)".to_vec()),
    )
    .await;
    assert_eq!(reply.status, 201);
    assert!(reply.body.is_empty());
    assert_eq!(
        reply.location.as_deref(),
        Some(format!("{}/lastcommand", server.base_url).as_str())
    );

    let result = request("GET", format!("{}/lastresult", server.base_url), user("henk"), None).await;
    assert_eq!(result.status, 200);
    assert_eq!(result.content_type, "application/octet-stream");

    let command = request("GET", format!("{}/lastcommand", server.base_url), user("henk"), None).await;
    assert_eq!(command.status, 200);
    let record = command.json();
    assert_eq!(record["kind"], "EVALUATE");
    assert_eq!(record["status"], "COMPLETED");
    assert_eq!(record["withResult"], true);

    let other = request("GET", format!("{}/lastcommand", server.base_url), user("ingrid"), None).await;
    assert_eq!(other.status, 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn parse_errors_never_reach_the_interpreter() {
    let server = start(None, None).await;
    let reply = request(
        "POST",
        format!("{}/execute", server.base_url),
        user("henk"),
        Some(b"meanDS(D$age".to_vec()),
    )
    .await;
    assert_eq!(reply.status, 400);
    let message = reply.json()["message"].as_str().expect("message").to_string();
    assert!(message.starts_with("Error parsing expression: "), "{message}");

    let reply = request(
        "POST",
        format!("{}/symbols/E", server.base_url),
        user("henk"),
        Some(b"unknownDS(D)".to_vec()),
    )
    .await;
    assert_eq!(reply.status, 400);
    assert!(server.backend.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn table_existence_and_subset_load() {
    let server = start(None, None).await;
    let found = request(
        "HEAD",
        format!("{}/tables/datashield.PATIENT", server.base_url),
        user("henk"),
        None,
    )
    .await;
    assert_eq!(found.status, 200);
    let missing = request("HEAD", format!("{}/tables/other", server.base_url), user("henk"), None).await;
    assert_eq!(missing.status, 404);

    let tables = request("GET", format!("{}/tables", server.base_url), user("henk"), None).await;
    assert_eq!(tables.json(), serde_json::json!(["datashield.PATIENT"]));

    let loaded = request(
        "POST",
        format!(
            "{}/symbols/D?table=datashield.PATIENT&variables=age",
            server.base_url
        ),
        user("henk"),
        None,
    )
    .await;
    assert_eq!(loaded.status, 200);
    let calls = server.backend.calls();
    let assigned = calls
        .iter()
        .position(|call| {
            call == "base::assign('D', value = {base::local(datashield.PATIENT[,c(\"age\")], envir = .DSTableEnv)})"
        })
        .expect("assign call");
    // Existence check and binding run back to back in one command.
    assert_eq!(calls[assigned - 1], "base::local(base::ls(.DSTableEnv))");

    let missing = request(
        "POST",
        format!("{}/symbols/D?table=nope", server.base_url),
        user("henk"),
        None,
    )
    .await;
    assert_eq!(missing.status, 404);

    let deferred = request(
        "POST",
        format!("{}/symbols/D?table=nope&async=true", server.base_url),
        user("henk"),
        None,
    )
    .await;
    assert_eq!(deferred.status, 201);
    let mut record = Json::Null;
    for _ in 0..200 {
        record = request("GET", format!("{}/lastcommand", server.base_url), user("henk"), None)
            .await
            .json();
        if record["status"] == "FAILED" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(record["status"], "FAILED");
    assert_eq!(record["kind"], "ASSIGN");
    assert_eq!(record["errorKind"], "NotFound");
    assert_eq!(record["message"], "table 'nope' not found");
}

#[tokio::test(flavor = "multi_thread")]
async fn packages_are_listed_as_json() {
    let server = start(None, None).await;
    let reply = request("GET", format!("{}/packages", server.base_url), user("henk"), None).await;
    assert_eq!(reply.status, 200);
    assert!(reply.content_type.starts_with("application/json"), "{}", reply.content_type);
    assert_eq!(
        reply.json(),
        serde_json::json!([
            {
                "name": "base",
                "version": "3.6.1",
                "built": "3.6.1",
                "libPath": "/usr/local/lib/R/library"
            },
            {
                "name": "desc",
                "version": "1.2.0",
                "built": "3.6.1",
                "libPath": "/usr/local/lib/R/site-library"
            }
        ])
    );

    let command = request("GET", format!("{}/lastcommand", server.base_url), user("henk"), None).await;
    assert_eq!(command.json()["kind"], "PACKAGES");
}

#[tokio::test(flavor = "multi_thread")]
async fn symbols_list_and_remove() {
    let server = start(None, None).await;
    let assigned = request(
        "POST",
        format!("{}/symbols/E?async=true", server.base_url),
        user("henk"),
        Some(b"asNumericDS(D$age)".to_vec()),
    )
    .await;
    assert_eq!(assigned.status, 201);

    let symbols = request("GET", format!("{}/symbols", server.base_url), user("henk"), None).await;
    assert_eq!(symbols.json(), serde_json::json!(["D"]));
    let removed = request("DELETE", format!("{}/symbols/D", server.base_url), user("henk"), None).await;
    assert_eq!(removed.status, 200);
    let calls = server.backend.calls();
    assert_eq!(calls[0], "base::assign('E', value = {dsBase::asNumericDS(D$age)})");
    assert_eq!(calls.last().map(String::as_str), Some("base::rm(D)"));
}

#[tokio::test(flavor = "multi_thread")]
async fn workspaces_save_list_load_and_remove() {
    let server = start(None, None).await;
    let saved = request("POST", format!("{}/workspaces/test", server.base_url), user("henk"), None).await;
    assert_eq!(saved.status, 201);

    let listed = request("GET", format!("{}/workspaces", server.base_url), user("henk"), None).await;
    assert_eq!(listed.json()[0]["name"], "test");
    assert_eq!(listed.json()[0]["size"], 9);

    let invalid = request(
        "POST",
        format!("{}/workspaces/bad.id", server.base_url),
        user("henk"),
        None,
    )
    .await;
    assert_eq!(invalid.status, 400);
    assert_eq!(
        invalid.json()["message"],
        "saveUserWorkspace.id: Please use only letters, numbers, dashes or underscores"
    );

    let loaded = request(
        "POST",
        format!("{}/load-workspace?id=test", server.base_url),
        user("henk"),
        None,
    )
    .await;
    assert_eq!(loaded.status, 200);

    let removed = request("DELETE", format!("{}/workspaces/test", server.base_url), user("henk"), None).await;
    assert_eq!(removed.status, 200);
    let gone = request("DELETE", format!("{}/workspaces/test", server.base_url), user("henk"), None).await;
    assert_eq!(gone.status, 404);
}

#[tokio::test(flavor = "multi_thread")]
async fn load_tables_requires_existing_workspaces() {
    let server = start(None, None).await;
    let saved = request("POST", format!("{}/workspaces/patient", server.base_url), user("DIABETES"), None).await;
    assert_eq!(saved.status, 201);

    let loaded = request(
        "POST",
        format!("{}/load-tables?workspace=DIABETES/patient", server.base_url),
        user("henk"),
        None,
    )
    .await;
    assert_eq!(loaded.status, 200);

    let missing = request(
        "POST",
        format!(
            "{}/load-tables?workspace=DIABETES/patient&workspace=LIFECYCLE/core",
            server.base_url
        ),
        user("henk"),
        None,
    )
    .await;
    assert_eq!(missing.status, 404);

    let malformed = request(
        "POST",
        format!("{}/load-tables?workspace=patient", server.base_url),
        user("henk"),
        None,
    )
    .await;
    assert_eq!(malformed.status, 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn bearer_and_admin_tokens_are_enforced() {
    let server = start(Some("secret"), Some("admin")).await;
    let denied = request("GET", format!("{}/tables", server.base_url), user("henk"), None).await;
    assert_eq!(denied.status, 401);

    let mut headers = user("henk");
    headers.push(("Authorization", "Bearer secret".to_string()));
    let allowed = request("GET", format!("{}/tables", server.base_url), headers.clone(), None).await;
    assert_eq!(allowed.status, 200);

    let forbidden = request(
        "POST",
        format!("{}/install-package?filename=hello_world_test.tar.gz", server.base_url),
        headers,
        Some(b"archive".to_vec()),
    )
    .await;
    assert_eq!(forbidden.status, 403);

    let mut admin = user("henk");
    admin.push(("Authorization", "Bearer admin".to_string()));
    let installed = request(
        "POST",
        format!("{}/install-package?filename=hello_world_test.tar.gz", server.base_url),
        admin,
        Some(b"archive".to_vec()),
    )
    .await;
    assert_eq!(installed.status, 204);
    assert!(
        server
            .backend
            .calls()
            .iter()
            .any(|call| call.starts_with("remotes::install_local('hello_world_test.tar.gz'"))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn logout_drops_the_session() {
    let server = start(None, None).await;
    let reply = request(
        "POST",
        format!("{}/execute", server.base_url),
        user("henk"),
        Some(b"meanDS(D$age)".to_vec()),
    )
    .await;
    assert_eq!(reply.status, 200);
    let out = request("POST", format!("{}/logout", server.base_url), user("henk"), None).await;
    assert_eq!(out.json()["closed"], true);
    let command = request("GET", format!("{}/lastcommand", server.base_url), user("henk"), None).await;
    assert_eq!(command.status, 404);
}
