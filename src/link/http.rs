//! Purpose: Interpreter link over a small HTTP protocol, one backend base URL per profile.
//! Exports: `HttpLinkProvider`, `HttpLink`.
//! Role: Concrete `LinkProvider` used by `shieldexec serve`.
//! Invariants: Each link owns one backend session, opened on connect and deleted on drop.
//! Invariants: Octet-stream responses decode as `Value::Raw`; JSON responses use the `{type, value}` envelope.
//! Invariants: Non-2xx answers are `Execution` errors, except 404/502/503 which mean the session is gone.
#![allow(clippy::result_large_err)]

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::{InterpreterLink, LinkProvider};
use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;

type LinkResult<T> = Result<T, Error>;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone)]
pub struct HttpLinkProvider {
    profiles: BTreeMap<String, Url>,
    agent: ureq::Agent,
}

impl HttpLinkProvider {
    pub fn new(profiles: BTreeMap<String, Url>) -> LinkResult<Self> {
        let mut normalized = BTreeMap::new();
        for (name, url) in profiles {
            normalized.insert(name, normalize_base_url(url)?);
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .build();
        Ok(Self {
            profiles: normalized,
            agent,
        })
    }

    pub fn profiles(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

impl LinkProvider for HttpLinkProvider {
    fn connect(&self, profile: &str) -> LinkResult<Box<dyn InterpreterLink>> {
        let Some(base_url) = self.profiles.get(profile) else {
            return Err(Error::new(ErrorKind::Unavailable)
                .with_message(format!("unknown profile '{profile}'"))
                .with_hint("Select one of the profiles configured with --profile."));
        };
        let url = join(base_url, "sessions")?;
        let response = self
            .agent
            .post(url.as_str())
            .set("Accept", "application/json")
            .call();
        let opened: OpenedSession = match response {
            Ok(resp) => read_json_response(resp)?,
            Err(ureq::Error::Status(code, resp)) => {
                return Err(Error::new(ErrorKind::Unavailable).with_message(format!(
                    "failed to open interpreter session ({code}): {}",
                    error_message(resp)
                )));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(Error::new(ErrorKind::Unavailable)
                    .with_message(format!("interpreter for profile '{profile}' is unreachable"))
                    .with_source(err));
            }
        };
        if !is_session_id(&opened.id) {
            return Err(Error::new(ErrorKind::Unavailable)
                .with_message(format!("backend returned an invalid session id '{}'", opened.id)));
        }
        let session_url = join(base_url, &format!("sessions/{}/", opened.id))?;
        tracing::debug!(profile, session = %opened.id, "opened interpreter session");
        Ok(Box::new(HttpLink {
            agent: self.agent.clone(),
            session_url,
        }))
    }
}

pub struct HttpLink {
    agent: ureq::Agent,
    session_url: Url,
}

impl HttpLink {
    fn url(&self, path: &str) -> LinkResult<Url> {
        join(&self.session_url, path)
    }
}

impl InterpreterLink for HttpLink {
    fn execute(&mut self, call: &str) -> LinkResult<Value> {
        let url = self.url("eval")?;
        let response = self
            .agent
            .post(url.as_str())
            .set("Content-Type", "text/plain")
            .set("Accept", "application/octet-stream, application/json")
            .send_string(call);
        match response {
            Ok(resp) => decode_value(resp),
            Err(err) => Err(map_request_error(err, "eval request failed")),
        }
    }

    fn write_file(&mut self, name: &str, bytes: &[u8]) -> LinkResult<()> {
        let url = self.url(&format!("files/{name}"))?;
        self.agent
            .put(url.as_str())
            .set("Content-Type", OCTET_STREAM)
            .send_bytes(bytes)
            .map(|_| ())
            .map_err(|err| map_request_error(err, "file upload failed"))
    }

    fn read_file(&mut self, name: &str) -> LinkResult<Vec<u8>> {
        let url = self.url(&format!("files/{name}"))?;
        let response = self
            .agent
            .get(url.as_str())
            .set("Accept", OCTET_STREAM)
            .call()
            .map_err(|err| map_request_error(err, "file download failed"))?;
        read_bytes(response)
    }
}

impl Drop for HttpLink {
    fn drop(&mut self) {
        if let Err(err) = self.agent.delete(self.session_url.as_str()).call() {
            tracing::debug!(url = %self.session_url, error = %err, "failed to close interpreter session");
        }
    }
}

#[derive(Deserialize)]
struct OpenedSession {
    id: String,
}

#[derive(Deserialize)]
struct ValueEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn decode_value(response: ureq::Response) -> LinkResult<Value> {
    if response.content_type() == OCTET_STREAM {
        return read_bytes(response).map(Value::Raw);
    }
    let envelope: ValueEnvelope = read_json_response(response)?;
    value_from_envelope(envelope)
}

fn value_from_envelope(envelope: ValueEnvelope) -> LinkResult<Value> {
    match envelope.kind.as_str() {
        "null" => Ok(Value::Null),
        "double" => envelope.value.as_f64().map(Value::Double).ok_or_else(|| {
            Error::new(ErrorKind::Unavailable).with_message("double value is not a number")
        }),
        "strings" => serde_json::from_value::<Vec<String>>(envelope.value)
            .map(Value::Strings)
            .map_err(|err| {
                Error::new(ErrorKind::Unavailable)
                    .with_message("strings value is not a list of strings")
                    .with_source(err)
            }),
        other => Err(Error::new(ErrorKind::Unavailable)
            .with_message(format!("unsupported value type '{other}'"))),
    }
}

fn map_request_error(err: ureq::Error, context: &str) -> Error {
    match err {
        ureq::Error::Status(code @ (404 | 502 | 503), resp) => Error::new(ErrorKind::Unavailable)
            .with_message(format!("{context} ({code}): {}", error_message(resp)))
            .with_hint("The interpreter session is gone; the next command reconnects."),
        ureq::Error::Status(_, resp) => {
            Error::new(ErrorKind::Execution).with_message(error_message(resp))
        }
        ureq::Error::Transport(err) => Error::new(ErrorKind::Unavailable)
            .with_message(context.to_string())
            .with_source(err),
    }
}

fn error_message(response: ureq::Response) -> String {
    let status = response.status();
    let body = response.into_string().unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => parsed.message,
        Err(_) if !body.trim().is_empty() => body.trim().to_string(),
        Err(_) => format!("backend error status {status}"),
    }
}

fn read_bytes(response: ureq::Response) -> LinkResult<Vec<u8>> {
    let mut bytes = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut bytes)
        .map_err(|err| {
            Error::new(ErrorKind::Unavailable)
                .with_message("failed to read response body")
                .with_source(err)
        })?;
    Ok(bytes)
}

fn read_json_response<R>(response: ureq::Response) -> LinkResult<R>
where
    R: serde::de::DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Unavailable)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Unavailable)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn normalize_base_url(mut url: Url) -> LinkResult<Url> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("profile url must use http or https: {url}")));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn join(base: &Url, path: &str) -> LinkResult<Url> {
    base.join(path).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to build url for '{path}'"))
            .with_source(err)
    })
}

fn is_session_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
