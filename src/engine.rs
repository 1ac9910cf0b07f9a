//! Purpose: Public command surface: submit work for a session and observe its last command.
//! Exports: `CommandEngine`.
//! Role: Validates requests, turns them into `Operation`s and routes them to the right worker.
//! Invariants: Submission only enqueues; nothing here blocks on an interpreter link.
//! Invariants: Invalid symbols and store paths are rejected before a command exists.
//! Invariants: Package installs share one process-wide worker and never become a session's last command.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::core::command::{CommandHandle, CommandRecord, ResultHandle};
use crate::core::error::{Error, ErrorKind};
use crate::core::validate::{validate_package_filename, validate_symbol};
use crate::link::LinkProvider;
use crate::ops::Operation;
use crate::session::{Job, LinkSlot, SessionKey, SessionRegistry, execute_job};
use crate::workspace::{WorkspaceInfo, WorkspaceStore, check_workspace_path};

struct InstallJob {
    profile: String,
    job: Job,
}

pub struct CommandEngine {
    registry: SessionRegistry,
    installs: Mutex<mpsc::Sender<InstallJob>>,
}

impl CommandEngine {
    pub fn new(provider: Arc<dyn LinkProvider>, store: Arc<dyn WorkspaceStore>) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel::<InstallJob>();
        let install_provider = Arc::clone(&provider);
        let install_store = Arc::clone(&store);
        thread::Builder::new()
            .name("package-install".to_string())
            .spawn(move || {
                for InstallJob { profile, job } in rx {
                    // Fresh link per install; dropping the slot closes it.
                    let mut slot = LinkSlot::new(Arc::clone(&install_provider), profile);
                    execute_job(&mut slot, install_store.as_ref(), job);
                }
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn install worker")
                    .with_source(err)
            })?;
        Ok(Self {
            registry: SessionRegistry::new(provider, store),
            installs: Mutex::new(tx),
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn submit(&self, key: &SessionKey, operation: Operation) -> Result<CommandHandle, Error> {
        self.registry.submit(key, operation)
    }

    pub fn evaluate(&self, key: &SessionKey, call: impl Into<String>) -> Result<CommandHandle, Error> {
        self.submit(key, Operation::Evaluate { call: call.into() })
    }

    pub fn assign(
        &self,
        key: &SessionKey,
        symbol: &str,
        call: impl Into<String>,
    ) -> Result<CommandHandle, Error> {
        validate_symbol("symbol", symbol)?;
        self.submit(
            key,
            Operation::Assign {
                symbol: symbol.to_string(),
                call: call.into(),
            },
        )
    }

    pub fn load_table(
        &self,
        key: &SessionKey,
        symbol: &str,
        table: &str,
        variables: Vec<String>,
    ) -> Result<CommandHandle, Error> {
        validate_symbol("symbol", symbol)?;
        validate_symbol("table", table)?;
        for variable in &variables {
            validate_symbol("variable", variable)?;
        }
        self.submit(
            key,
            Operation::LoadTable {
                symbol: symbol.to_string(),
                table: table.to_string(),
                variables,
            },
        )
    }

    /// Snapshot of the most recently submitted command, if this session has one.
    pub fn last_command(&self, key: &SessionKey) -> Option<CommandRecord> {
        self.registry
            .get(key)
            .and_then(|session| session.last_command())
            .map(|handle| handle.record())
    }

    /// Result of the last command, present only when that command produces a value.
    pub fn last_execution(&self, key: &SessionKey) -> Option<ResultHandle> {
        self.registry
            .get(key)
            .and_then(|session| session.last_command())
            .and_then(|handle| handle.result())
    }

    pub fn save_workspace(&self, key: &SessionKey, path: &str) -> Result<CommandHandle, Error> {
        check_workspace_path(path)?;
        self.submit(key, Operation::SaveWorkspace { path: path.to_string() })
    }

    pub fn load_user_workspace(&self, key: &SessionKey, path: &str) -> Result<CommandHandle, Error> {
        check_workspace_path(path)?;
        self.submit(key, Operation::LoadWorkspace { path: path.to_string() })
    }

    /// Loads each workspace into the session's table environment, in the given order.
    pub fn load_workspaces(&self, key: &SessionKey, paths: Vec<String>) -> Result<CommandHandle, Error> {
        if paths.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("no workspaces to load"));
        }
        for path in &paths {
            check_workspace_path(path)?;
        }
        self.submit(key, Operation::LoadTables { paths })
    }

    pub fn remove_workspace(&self, key: &SessionKey, path: &str) -> Result<CommandHandle, Error> {
        check_workspace_path(path)?;
        self.submit(key, Operation::RemoveWorkspace { path: path.to_string() })
    }

    pub fn list_workspaces(&self, key: &SessionKey) -> Result<Vec<WorkspaceInfo>, Error> {
        self.registry.store().list(&key.user)
    }

    pub fn get_packages(&self, key: &SessionKey) -> Result<CommandHandle, Error> {
        self.submit(key, Operation::Packages)
    }

    pub fn install_package(
        &self,
        key: &SessionKey,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<CommandHandle, Error> {
        validate_package_filename(filename)?;
        let operation = Operation::InstallPackage {
            filename: filename.to_string(),
            bytes,
        };
        let handle = CommandHandle::new(operation.kind(), operation.describe())?;
        let job = InstallJob {
            profile: key.profile.clone(),
            job: Job {
                handle: handle.clone(),
                operation,
            },
        };
        self.installs
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .send(job)
            .map_err(|_| Error::new(ErrorKind::Unavailable).with_message("install worker has stopped"))?;
        tracing::debug!(session = %key, command = %handle.id(), filename, "package install queued");
        Ok(handle)
    }

    /// Drops the session; its link closes once already queued commands have run.
    pub fn logout(&self, key: &SessionKey) -> bool {
        self.registry.remove(key)
    }

    pub fn evict_idle(&self, max_idle: Duration) -> Vec<SessionKey> {
        self.registry.evict_idle(max_idle)
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }
}
