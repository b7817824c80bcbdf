//! The set of live instances and their persistence.
//!
//! Lock order is registry map first, then instance. Nothing that holds an
//! instance lock ever reaches back into the registry.

use crate::comments::Comment;
use crate::config::ServerConfig;
use crate::error::{Result, StorageError};
use crate::instance::{Events, Instance, InstanceHandle, PollStart};
use crate::protocol::{DocSnapshot, InstanceInfo, PersistedState, SubmitEvents, Versions};
use crate::seed;
use crate::storage::Storage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tandem_transform::Doc;
use tracing::{debug, info, warn};

/// Outcome of a long poll.
#[derive(Debug)]
pub enum PollResult {
    /// New steps, comment events or a changed user count.
    Events(Events),
    /// The poll timed out or the instance was stopped.
    KeepAlive,
    /// History before the requested version was discarded.
    Gone,
}

/// Owns every live [`Instance`], keyed by id.
pub struct Registry {
    config: ServerConfig,
    storage: Arc<dyn Storage>,
    instances: Mutex<HashMap<String, InstanceHandle>>,
    save_scheduled: AtomicBool,
}

impl Registry {
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            instances: Mutex::new(HashMap::new()),
            save_scheduled: AtomicBool::new(false),
        }
    }

    /// Build a registry and fill it from storage.
    ///
    /// With `fresh`, or when nothing usable is stored, the default documents
    /// are created instead.
    pub async fn load(config: ServerConfig, storage: Arc<dyn Storage>, fresh: bool) -> Arc<Self> {
        let registry = Arc::new(Self::new(config, storage));
        let stored = if fresh {
            None
        } else {
            match registry.storage.load().await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(error = %err, "could not load saved instances, starting fresh");
                    None
                }
            }
        };

        match stored {
            Some(state) => {
                info!(instances = state.len(), "restoring saved instances");
                for (id, saved) in state {
                    registry.create(&id, saved.doc, saved.comments);
                }
            }
            None => {
                for (id, doc) in seed::default_instances() {
                    registry.create(id, doc, Vec::new());
                }
                info!(instances = registry.len(), "populated default instances");
            }
        }
        registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.lock().contains_key(id)
    }

    /// Create (or replace) an instance, evicting the least recently used one
    /// when the registry is full.
    pub fn create(&self, id: &str, doc: Doc, comments: Vec<Comment>) -> InstanceHandle {
        let mut instances = self.instances.lock();
        self.insert_locked(&mut instances, id, doc, comments)
    }

    fn insert_locked(
        &self,
        instances: &mut HashMap<String, InstanceHandle>,
        id: &str,
        doc: Doc,
        comments: Vec<Comment>,
    ) -> InstanceHandle {
        if let Some(old) = instances.remove(id) {
            old.lock().stop();
        }
        if instances.len() >= self.config.max_instances.max(1) {
            let oldest = instances
                .iter()
                .min_by_key(|(_, handle)| handle.lock().last_active())
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                debug!(instance = %oldest, "evicting least recently used instance");
                if let Some(handle) = instances.remove(&oldest) {
                    handle.lock().stop();
                }
            }
        }

        let instance = Instance::new(id, doc, comments)
            .with_max_step_history(self.config.max_step_history);
        let handle = InstanceHandle::new(instance, self.config.user_collect_interval());
        instances.insert(id.to_string(), handle.clone());
        handle
    }

    /// Remove an instance, releasing its waiters.
    pub fn evict(&self, id: &str) -> bool {
        let removed = self.instances.lock().remove(id);
        match removed {
            Some(handle) => {
                handle.lock().stop();
                true
            }
            None => false,
        }
    }

    /// Stop every instance. Pending polls finish with a keepalive.
    pub fn stop_all(&self) {
        for handle in self.instances.lock().values() {
            handle.lock().stop();
        }
    }

    /// Look up an instance, creating it with the default text when unknown,
    /// and register `ip` as one of its users.
    pub fn get_instance(&self, id: &str, ip: &str) -> InstanceHandle {
        let handle = {
            let mut instances = self.instances.lock();
            match instances.get(id) {
                Some(handle) => handle.clone(),
                None => {
                    debug!(instance = %id, "creating instance on first access");
                    self.insert_locked(&mut instances, id, seed::default_doc(), Vec::new())
                }
            }
        };
        handle.register_user(ip);
        handle
    }

    pub fn instance_info(&self) -> Vec<InstanceInfo> {
        let instances = self.instances.lock();
        let mut info: Vec<InstanceInfo> = instances
            .iter()
            .map(|(id, handle)| InstanceInfo {
                id: id.clone(),
                users: handle.lock().user_count(),
            })
            .collect();
        info.sort_by(|a, b| a.id.cmp(&b.id));
        info
    }

    pub fn snapshot(&self, id: &str, ip: &str) -> DocSnapshot {
        self.get_instance(id, ip).lock().snapshot()
    }

    /// Submit steps and comment events. `Ok(None)` is a version conflict.
    pub fn add_events(
        self: &Arc<Self>,
        id: &str,
        ip: &str,
        submit: SubmitEvents,
    ) -> Result<Option<Versions>> {
        let handle = self.get_instance(id, ip);
        let result = handle.lock().add_events(
            submit.version,
            submit.steps,
            submit.comment,
            submit.client_id,
        )?;
        if result.is_some() {
            self.schedule_save();
        }
        Ok(result)
    }

    /// Return the events after the given versions, waiting up to the poll
    /// timeout when there are none yet.
    pub async fn poll_events(
        &self,
        id: &str,
        ip: &str,
        version: u64,
        comment_version: u64,
    ) -> Result<PollResult> {
        let handle = self.get_instance(id, ip);
        match handle.events_or_wait(version, comment_version, ip)? {
            PollStart::Ready(events) => Ok(PollResult::Events(events)),
            PollStart::Gone => Ok(PollResult::Gone),
            PollStart::Wait(mut waiter) => {
                let woken = matches!(
                    tokio::time::timeout(self.config.poll_timeout(), waiter.wait()).await,
                    Ok(true)
                );
                drop(waiter);
                if !woken {
                    return Ok(PollResult::KeepAlive);
                }
                Ok(match handle.get_events(version, comment_version)? {
                    Some(events) => PollResult::Events(events),
                    None => PollResult::Gone,
                })
            }
        }
    }

    /// Current state of every instance, read at call time.
    pub fn persisted_state(&self) -> PersistedState {
        self.instances
            .lock()
            .iter()
            .map(|(id, handle)| (id.clone(), handle.lock().persisted()))
            .collect()
    }

    /// Save immediately.
    pub async fn flush(&self) -> std::result::Result<(), StorageError> {
        let state = self.persisted_state();
        self.storage.save(&state).await
    }

    /// Arrange for a save after the save interval, unless one is pending.
    pub fn schedule_save(self: &Arc<Self>) {
        if self.save_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = Arc::downgrade(self);
        let delay = self.config.save_interval();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            registry.save_scheduled.store(false, Ordering::SeqCst);
            if let Err(err) = registry.flush().await {
                warn!(error = %err, "failed to save instances, retrying");
                registry.schedule_save();
            }
        });
    }
}
