//! Purpose: Own per-(user, profile) sessions, their worker threads and their interpreter links.
//! Exports: `SessionKey`, `Session`, `SessionRegistry`.
//! Role: Concurrency backbone of the engine: one dedicated worker thread per session.
//! Invariants: A key maps to at most one session, and a session has at most one link.
//! Invariants: The link lives inside the worker thread; nothing else can reach it.
//! Invariants: Jobs run strictly in the order `Session::submit` accepted them.
//! Invariants: The last-command pointer is swapped under the same lock that orders the queue.
//! Invariants: Registry submits and idle eviction serialize on the session map lock.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use time::OffsetDateTime;

use crate::core::command::CommandHandle;
use crate::core::error::{Error, ErrorKind};
use crate::core::validate::validate_identifier;
use crate::link::{InterpreterLink, LinkProvider};
use crate::ops::Operation;
use crate::workspace::WorkspaceStore;

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionKey {
    pub user: String,
    pub profile: String,
}

impl SessionKey {
    pub fn new(user: impl Into<String>, profile: impl Into<String>) -> Result<Self, Error> {
        let key = Self {
            user: user.into(),
            profile: profile.into(),
        };
        validate_identifier("user", &key.user)?;
        validate_identifier("profile", &key.profile)?;
        Ok(key)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.profile)
    }
}

/// Lazily connected link for one profile; `link_for` keeps returning the same instance.
pub(crate) struct LinkSlot {
    provider: Arc<dyn LinkProvider>,
    profile: String,
    link: Option<Box<dyn InterpreterLink>>,
}

impl LinkSlot {
    pub(crate) fn new(provider: Arc<dyn LinkProvider>, profile: impl Into<String>) -> Self {
        Self {
            provider,
            profile: profile.into(),
            link: None,
        }
    }

    pub(crate) fn link_for(&mut self) -> Result<&mut dyn InterpreterLink, Error> {
        if self.link.is_none() {
            let link = self.provider.connect(&self.profile).map_err(|err| {
                tracing::warn!(profile = %self.profile, error = %err, "failed to provision interpreter link");
                if err.kind() == ErrorKind::Unavailable {
                    err
                } else {
                    Error::new(ErrorKind::Unavailable)
                        .with_message(format!("session unavailable for profile '{}'", self.profile))
                        .with_source(err)
                }
            })?;
            self.link = Some(link);
        }
        match self.link.as_deref_mut() {
            Some(link) => {
                let link: &mut dyn InterpreterLink = link;
                Ok(link)
            }
            None => Err(Error::new(ErrorKind::Internal).with_message("link slot is empty")),
        }
    }

    /// Drops a link whose transport failed so the next command reconnects.
    fn reset(&mut self) {
        self.link = None;
    }
}

pub(crate) struct Job {
    pub(crate) handle: CommandHandle,
    pub(crate) operation: Operation,
}

/// Runs one job to a terminal state. Panics inside the operation become `Internal` failures.
pub(crate) fn execute_job(slot: &mut LinkSlot, store: &dyn WorkspaceStore, job: Job) {
    let Job { handle, operation } = job;
    handle.mark_in_progress();
    let kind = operation.kind();
    let started = Instant::now();
    tracing::debug!(command = %handle.id(), ?kind, "command started");
    let result = panic::catch_unwind(AssertUnwindSafe(|| operation.run(slot, store)))
        .unwrap_or_else(|_| {
            Err(Error::new(ErrorKind::Internal).with_message("command panicked during execution"))
        });
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => tracing::debug!(command = %handle.id(), ?kind, elapsed_ms, "command completed"),
        Err(err) => {
            if matches!(err.kind(), ErrorKind::Unavailable | ErrorKind::Internal) {
                slot.reset();
            }
            tracing::warn!(command = %handle.id(), ?kind, elapsed_ms, error = %err, "command failed");
        }
    }
    handle.complete(result);
}

pub struct Session {
    key: SessionKey,
    created_at: OffsetDateTime,
    last_activity: Mutex<Instant>,
    last_command: RwLock<Option<CommandHandle>>,
    queue: Mutex<mpsc::Sender<Job>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Session {
    fn start(
        key: SessionKey,
        provider: Arc<dyn LinkProvider>,
        store: Arc<dyn WorkspaceStore>,
    ) -> Result<Self, Error> {
        let (tx, rx) = mpsc::channel::<Job>();
        let mut slot = LinkSlot::new(provider, key.profile.clone());
        let worker_key = key.clone();
        thread::Builder::new()
            .name(format!("session-{}", key.user))
            .spawn(move || {
                for job in rx {
                    execute_job(&mut slot, store.as_ref(), job);
                }
                tracing::debug!(session = %worker_key, "session worker stopped");
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn session worker")
                    .with_source(err)
            })?;
        Ok(Self {
            key,
            created_at: OffsetDateTime::now_utc(),
            last_activity: Mutex::new(Instant::now()),
            last_command: RwLock::new(None),
            queue: Mutex::new(tx),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    fn queue(&self) -> MutexGuard<'_, mpsc::Sender<Job>> {
        self.queue.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Enqueues the operation and makes it the session's last command.
    pub(crate) fn submit(&self, operation: Operation) -> Result<CommandHandle, Error> {
        let handle = CommandHandle::new(operation.kind(), operation.describe())?;
        let queue = self.queue();
        queue
            .send(Job {
                handle: handle.clone(),
                operation,
            })
            .map_err(|_| {
                Error::new(ErrorKind::Unavailable)
                    .with_message(format!("session worker for {} has stopped", self.key))
            })?;
        {
            let mut last = self
                .last_command
                .write()
                .unwrap_or_else(|poison| poison.into_inner());
            *last = Some(handle.clone());
        }
        drop(queue);
        self.touch();
        Ok(handle)
    }

    pub fn last_command(&self) -> Option<CommandHandle> {
        self.last_command
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .elapsed()
    }

    /// True when nothing is queued or running and the session has been quiet for `max_idle`.
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        let busy = self
            .last_command()
            .is_some_and(|handle| !handle.status().is_terminal());
        !busy && self.idle_for() >= max_idle
    }
}

pub struct SessionRegistry {
    provider: Arc<dyn LinkProvider>,
    store: Arc<dyn WorkspaceStore>,
    sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(provider: Arc<dyn LinkProvider>, store: Arc<dyn WorkspaceStore>) -> Self {
        Self {
            provider,
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn provider(&self) -> Arc<dyn LinkProvider> {
        Arc::clone(&self.provider)
    }

    pub fn store(&self) -> Arc<dyn WorkspaceStore> {
        Arc::clone(&self.store)
    }

    /// Returns the session for `key`, starting it (and its worker) on first use.
    pub fn session(&self, key: &SessionKey) -> Result<Arc<Session>, Error> {
        let mut sessions = self.sessions();
        self.session_in(&mut sessions, key)
    }

    fn session_in(
        &self,
        sessions: &mut HashMap<SessionKey, Arc<Session>>,
        key: &SessionKey,
    ) -> Result<Arc<Session>, Error> {
        if let Some(session) = sessions.get(key) {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(Session::start(
            key.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.store),
        )?);
        sessions.insert(key.clone(), Arc::clone(&session));
        tracing::info!(session = %key, "session created");
        Ok(session)
    }

    /// Enqueues on the session for `key` while the map is locked, so an idle sweep
    /// cannot drop the session between lookup and enqueue.
    pub(crate) fn submit(&self, key: &SessionKey, operation: Operation) -> Result<CommandHandle, Error> {
        let mut sessions = self.sessions();
        let session = self.session_in(&mut sessions, key)?;
        session.submit(operation)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions().get(key).cloned()
    }

    /// Forgets the session; its worker drains queued jobs, then closes the link and exits.
    pub fn remove(&self, key: &SessionKey) -> bool {
        let removed = self.sessions().remove(key).is_some();
        if removed {
            tracing::info!(session = %key, "session closed");
        }
        removed
    }

    pub fn evict_idle(&self, max_idle: Duration) -> Vec<SessionKey> {
        let mut sessions = self.sessions();
        let idle: Vec<SessionKey> = sessions
            .iter()
            .filter(|(_, session)| session.is_idle(max_idle))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &idle {
            sessions.remove(key);
            tracing::info!(session = %key, "session evicted after idle timeout");
        }
        idle
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
