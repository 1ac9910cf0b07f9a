//! Purpose: Command records and the asynchronous handles that track them.
//! Exports: `CommandId`, `CommandKind`, `CommandStatus`, `CommandRecord`, `CommandHandle`, `ResultHandle`, `Outcome`.
//! Role: Data model shared by the engine (writer) and the HTTP layer (reader).
//! Invariants: Status only moves PENDING -> IN_PROGRESS -> COMPLETED | FAILED.
//! Invariants: Record mutation happens under the handle's mutex; readers get cloned snapshots.
//! Invariants: Outcomes are published once and can be read any number of times.
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use getrandom::fill as fill_random;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;

use crate::core::error::{Error, ErrorKind, Failure};
use crate::core::value::Value;

pub type Outcome = Result<Value, Failure>;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CommandId(String);

impl CommandId {
    pub fn generate() -> Result<Self, Error> {
        let mut bytes = [0u8; 16];
        fill_random(&mut bytes).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message(format!("failed to generate command id: {err}"))
        })?;
        Ok(Self(hex_encode(&bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Evaluate,
    Assign,
    SaveWorkspace,
    LoadWorkspace,
    LoadTables,
    RemoveWorkspace,
    Packages,
    InstallPackage,
}

impl CommandKind {
    /// Kinds whose outcome carries a value worth fetching through `/lastresult`.
    pub fn produces_value(self) -> bool {
        matches!(self, CommandKind::Evaluate | CommandKind::Packages)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}

#[derive(Clone, Debug)]
pub struct CommandRecord {
    pub id: CommandId,
    pub kind: CommandKind,
    pub expression: String,
    pub create_date: OffsetDateTime,
    pub start_date: Option<OffsetDateTime>,
    pub end_date: Option<OffsetDateTime>,
    pub status: CommandStatus,
    pub with_result: bool,
    pub failure: Option<Failure>,
}

impl CommandRecord {
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = json!({
            "id": self.id.as_str(),
            "kind": self.kind,
            "expression": self.expression,
            "createDate": format_timestamp(self.create_date),
            "startDate": self.start_date.and_then(format_timestamp),
            "endDate": self.end_date.and_then(format_timestamp),
            "status": self.status,
            "withResult": self.with_result,
        });
        if let (Some(failure), Some(map)) = (&self.failure, value.as_object_mut()) {
            map.insert("errorKind".to_string(), json!(failure.kind));
            map.insert("message".to_string(), json!(failure.message));
        }
        value
    }
}

fn format_timestamp(ts: OffsetDateTime) -> Option<String> {
    ts.format(&Rfc3339).ok()
}

struct CommandCell {
    record: Mutex<CommandRecord>,
    outcome: watch::Sender<Option<Outcome>>,
}

/// Shared handle to one submitted command; cloning shares the same command.
#[derive(Clone)]
pub struct CommandHandle {
    inner: Arc<CommandCell>,
}

impl fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.lock();
        f.debug_struct("CommandHandle")
            .field("id", &record.id)
            .field("kind", &record.kind)
            .field("status", &record.status)
            .finish()
    }
}

impl CommandHandle {
    pub fn new(kind: CommandKind, expression: impl Into<String>) -> Result<Self, Error> {
        let record = CommandRecord {
            id: CommandId::generate()?,
            kind,
            expression: expression.into(),
            create_date: OffsetDateTime::now_utc(),
            start_date: None,
            end_date: None,
            status: CommandStatus::Pending,
            with_result: kind.produces_value(),
            failure: None,
        };
        let (outcome, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(CommandCell {
                record: Mutex::new(record),
                outcome,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CommandRecord> {
        self.inner
            .record
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn id(&self) -> CommandId {
        self.lock().id.clone()
    }

    pub fn kind(&self) -> CommandKind {
        self.lock().kind
    }

    pub fn status(&self) -> CommandStatus {
        self.lock().status
    }

    pub fn record(&self) -> CommandRecord {
        self.lock().clone()
    }

    pub fn same_command(&self, other: &CommandHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn mark_in_progress(&self) {
        let mut record = self.lock();
        if record.status == CommandStatus::Pending {
            record.status = CommandStatus::InProgress;
            record.start_date = Some(OffsetDateTime::now_utc());
        }
    }

    /// Publishes the terminal outcome. Later calls are ignored.
    pub(crate) fn complete(&self, result: Result<Value, Error>) {
        let outcome = {
            let mut record = self.lock();
            if record.status.is_terminal() {
                return;
            }
            let now = OffsetDateTime::now_utc();
            if record.start_date.is_none() {
                record.start_date = Some(now);
            }
            record.end_date = Some(now);
            match result {
                Ok(value) => {
                    record.status = CommandStatus::Completed;
                    Ok(value)
                }
                Err(err) => {
                    let failure = Failure::from(&err);
                    record.status = CommandStatus::Failed;
                    record.failure = Some(failure.clone());
                    Err(failure)
                }
            }
        };
        self.inner.outcome.send_replace(Some(outcome));
    }

    pub fn try_outcome(&self) -> Option<Outcome> {
        self.inner.outcome.borrow().clone()
    }

    pub async fn wait(&self) -> Outcome {
        let mut rx = self.inner.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => match &*outcome {
                Some(outcome) => outcome.clone(),
                None => Err(closed_failure()),
            },
            Err(_) => Err(closed_failure()),
        }
    }

    /// Result view of this command, present only for value-producing kinds.
    pub fn result(&self) -> Option<ResultHandle> {
        if self.kind().produces_value() {
            Some(ResultHandle {
                command: self.clone(),
            })
        } else {
            None
        }
    }
}

fn closed_failure() -> Failure {
    Failure::new(ErrorKind::Internal, "command outcome channel closed")
}

/// Value view of a value-producing command.
#[derive(Clone, Debug)]
pub struct ResultHandle {
    command: CommandHandle,
}

impl ResultHandle {
    pub fn command_id(&self) -> CommandId {
        self.command.id()
    }

    pub fn try_value(&self) -> Option<Outcome> {
        self.command.try_outcome()
    }

    pub async fn value(&self) -> Outcome {
        self.command.wait().await
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(nibble_hex(byte >> 4));
        out.push(nibble_hex(byte & 0x0f));
    }
    out
}

fn nibble_hex(nibble: u8) -> char {
    match nibble {
        0..=9 => (b'0' + nibble) as char,
        _ => (b'a' + nibble - 10) as char,
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandHandle, CommandKind, CommandStatus};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::value::Value;

    #[test]
    fn ids_are_unique_hex() {
        let a = CommandHandle::new(CommandKind::Evaluate, "x").expect("a").id();
        let b = CommandHandle::new(CommandKind::Evaluate, "x").expect("b").id();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let handle = CommandHandle::new(CommandKind::Assign, "base::assign('D', 1)").expect("new");
        assert_eq!(handle.status(), CommandStatus::Pending);
        handle.mark_in_progress();
        assert_eq!(handle.status(), CommandStatus::InProgress);
        handle.complete(Err(Error::new(ErrorKind::Execution).with_message("boom")));
        assert_eq!(handle.status(), CommandStatus::Failed);

        handle.complete(Ok(Value::Null));
        handle.mark_in_progress();
        let record = handle.record();
        assert_eq!(record.status, CommandStatus::Failed);
        assert_eq!(record.failure.expect("failure").message, "boom");
        assert!(record.end_date.is_some());
    }

    #[test]
    fn record_json_uses_wire_names() {
        let handle = CommandHandle::new(CommandKind::Evaluate, "expression").expect("new");
        let json = handle.record().to_json();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["kind"], "EVALUATE");
        assert_eq!(json["withResult"], true);
        assert!(json["createDate"].is_string());
        assert!(json.get("message").is_none());
    }

    #[test]
    fn only_value_kinds_expose_results() {
        let eval = CommandHandle::new(CommandKind::Evaluate, "x").expect("eval");
        let assign = CommandHandle::new(CommandKind::Assign, "x").expect("assign");
        assert!(eval.result().is_some());
        assert!(assign.result().is_none());
    }

    #[tokio::test]
    async fn outcome_reads_are_repeatable() {
        let handle = CommandHandle::new(CommandKind::Evaluate, "x").expect("new");
        let result = handle.result().expect("result");
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        handle.complete(Ok(Value::Raw(vec![0, 1, 2])));
        assert_eq!(waiter.await.expect("join"), Ok(Value::Raw(vec![0, 1, 2])));
        assert_eq!(result.value().await, Ok(Value::Raw(vec![0, 1, 2])));
        assert_eq!(result.value().await, Ok(Value::Raw(vec![0, 1, 2])));
    }
}
