//! Resume-key bookkeeping and durable suspension of waiting runs.
//!
//! A waiting run exists only as persisted [`RunState`] plus an entry in the
//! key index kept here. Keys are unique among waiting runs: reserving a key
//! that is already held fails with `ResumeKeyConflict`.
//!
//! A run taken out of `waiting` (by a resume or a cancel) is owned by its
//! taker until [`PauseController::release_claim`]. Other keys of an owned run
//! stay registered but cannot be claimed meanwhile.

use chrono::{DateTime, Utc};
use flowcore::{FlowError, ResumeKey, RunId, RunState, RunStatus, RunStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy)]
struct Registration {
    run_id: RunId,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct KeyIndex {
    keys: HashMap<ResumeKey, Registration>,
    claimed: HashSet<RunId>,
}

pub struct PauseController {
    store: Arc<dyn RunStore>,
    index: RwLock<KeyIndex>,
}

impl PauseController {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            index: RwLock::new(KeyIndex::default()),
        }
    }

    /// Claim `key` for `run_id` before the run suspends
    pub async fn reserve(
        &self,
        key: &ResumeKey,
        run_id: RunId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), FlowError> {
        let mut index = self.index.write().await;
        if let Some(existing) = index.keys.get(key) {
            tracing::warn!(
                "Resume key {} requested by run {} is held by run {}",
                key,
                run_id,
                existing.run_id
            );
            return Err(FlowError::ResumeKeyConflict { key: key.clone() });
        }
        index
            .keys
            .insert(key.clone(), Registration { run_id, expires_at });
        Ok(())
    }

    /// Drop every key held by `run_id`
    pub async fn release_run(&self, run_id: RunId) -> Vec<ResumeKey> {
        let mut index = self.index.write().await;
        let released: Vec<ResumeKey> = index
            .keys
            .iter()
            .filter(|(_, r)| r.run_id == run_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &released {
            index.keys.remove(key);
        }
        released
    }

    pub async fn lookup(&self, key: &ResumeKey) -> Option<RunId> {
        self.index.read().await.keys.get(key).map(|r| r.run_id)
    }

    /// Persist a run that just entered `waiting`
    pub async fn suspend(&self, state: &RunState) -> Result<(), FlowError> {
        debug_assert_eq!(state.status, RunStatus::Waiting);
        self.store.save_run_state(state).await?;
        tracing::info!(
            "Run {} suspended on {} resume key(s)",
            state.run_id,
            state.waiting.len()
        );
        Ok(())
    }

    /// Take ownership of the waiting run registered under `key`.
    ///
    /// The key is removed and the run marked as claimed in one step, so a
    /// second signal for any key of the same run fails with `RunNotWaiting`
    /// until the owner calls [`release_claim`](Self::release_claim). On
    /// failure the registration is restored.
    pub async fn claim(&self, key: &ResumeKey) -> Result<RunState, FlowError> {
        let registration = {
            let mut index = self.index.write().await;
            let registration = *index
                .keys
                .get(key)
                .ok_or_else(|| FlowError::ResumeKeyNotFound { key: key.clone() })?;
            if !index.claimed.insert(registration.run_id) {
                tracing::debug!(
                    "Run {} is already being continued, rejecting key {}",
                    registration.run_id,
                    key
                );
                return Err(FlowError::RunNotWaiting {
                    run_id: registration.run_id,
                });
            }
            index.keys.remove(key);
            registration
        };

        let loaded = self.store.load_run_state(registration.run_id).await;
        match loaded {
            Ok(state) if state.status == RunStatus::Waiting && state.wait_for(key).is_some() => {
                Ok(state)
            }
            Ok(state) => {
                let mut index = self.index.write().await;
                if !state.is_terminal() {
                    index.keys.insert(key.clone(), registration);
                }
                index.claimed.remove(&registration.run_id);
                tracing::warn!(
                    "Resume key {} points at run {} in status {}",
                    key,
                    state.run_id,
                    state.status
                );
                Err(FlowError::RunNotWaiting {
                    run_id: state.run_id,
                })
            }
            Err(e) => {
                let mut index = self.index.write().await;
                index.keys.insert(key.clone(), registration);
                index.claimed.remove(&registration.run_id);
                Err(e.into())
            }
        }
    }

    /// Take ownership of `run_id` without a key, e.g. to cancel it. Returns
    /// false when another caller already owns the run.
    pub async fn claim_run(&self, run_id: RunId) -> bool {
        self.index.write().await.claimed.insert(run_id)
    }

    /// Hand a claimed run back. Its remaining keys become claimable again.
    pub async fn release_claim(&self, run_id: RunId) {
        self.index.write().await.claimed.remove(&run_id);
    }

    /// Rebuild the key index from persisted waiting runs. Returns the number
    /// of keys registered.
    pub async fn recover(&self) -> Result<usize, FlowError> {
        let runs = self.store.list_waiting_runs().await?;
        let mut index = self.index.write().await;
        let mut restored = 0;
        for run in runs {
            for wait in &run.waiting {
                let registration = Registration {
                    run_id: run.run_id,
                    expires_at: wait.expires_at,
                };
                if let Some(previous) = index.keys.insert(wait.resume_key.clone(), registration) {
                    if previous.run_id != run.run_id {
                        tracing::warn!(
                            "Resume key {} claimed by both run {} and run {}",
                            wait.resume_key,
                            previous.run_id,
                            run.run_id
                        );
                    }
                }
                restored += 1;
            }
        }
        tracing::info!("Recovered {} resume key(s)", restored);
        Ok(restored)
    }

    /// Keys whose wait has an expiry at or before `now`, oldest first
    pub async fn expired(&self, now: DateTime<Utc>) -> Vec<ResumeKey> {
        let index = self.index.read().await;
        let mut due: Vec<(DateTime<Utc>, ResumeKey)> = index
            .keys
            .iter()
            .filter_map(|(key, r)| match r.expires_at {
                Some(at) if at <= now => Some((at, key.clone())),
                _ => None,
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, key)| key).collect()
    }
}
