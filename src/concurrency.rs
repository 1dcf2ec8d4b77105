//! Concurrency Gate (spec §4.E): layers blocking/timeout semantics and
//! holder-liveness monitoring on top of the State Store's permit counting.
//!
//! Each model gets its own `tokio::sync::Semaphore` sized to the model's
//! `max_concurrency`. Acquiring a permit here always keeps the State Store's
//! `active_permits` counter in lock-step, so `StateStoreHandle::snapshot` is
//! an accurate view of what the gate is holding. A small supervised watcher
//! actor, one per permit, releases it if the holder's liveness channel closes
//! without an explicit release -- mirroring the reference implementation's
//! pattern of giving every background responsibility its own supervised
//! actor rather than a bare `tokio::spawn`.

use crate::error::GeminiError;
use crate::state_store::StateStoreHandle;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::warn;

struct PermitInner {
    model: String,
    semaphore_permit: Mutex<Option<OwnedSemaphorePermit>>,
    released: AtomicBool,
    state_store: StateStoreHandle,
}

/// A held slot in a model's concurrency window. Cloning shares the same
/// underlying slot; `release` is idempotent across every clone.
#[derive(Clone)]
pub struct Permit {
    inner: Arc<PermitInner>,
}

impl Permit {
    fn new(model: String, semaphore_permit: OwnedSemaphorePermit, state_store: StateStoreHandle) -> Self {
        Self {
            inner: Arc::new(PermitInner {
                model,
                semaphore_permit: Mutex::new(Some(semaphore_permit)),
                released: AtomicBool::new(false),
                state_store,
            }),
        }
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    /// Releases the slot. Safe to call more than once or from more than one
    /// clone; only the first call has an effect.
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.semaphore_permit.lock().unwrap().take();
        self.inner.state_store.release(self.inner.model.clone()).await;
    }
}

struct HolderWatcherArgs {
    permit: Permit,
    liveness: oneshot::Receiver<()>,
}

/// Waits for a holder's liveness channel to close (either an explicit signal
/// or the sender dropping) and releases the paired permit. Runs its wait
/// inside its own actor lifecycle rather than a detached task, so a stuck
/// watcher is visible to ractor's supervision the same way any other actor
/// failure would be.
struct HolderWatcher;

#[ractor::async_trait]
impl Actor for HolderWatcher {
    type Msg = ();
    type State = ();
    type Arguments = HolderWatcherArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let HolderWatcherArgs { permit, liveness } = args;
        // Resolves whether the holder explicitly signals or simply drops the
        // sender; either way the holder is done with the slot.
        let _ = liveness.await;
        permit.release().await;
        myself.stop(None);
        Ok(())
    }
}

/// Per-model semaphore registry plus the State Store bookkeeping they stay
/// in sync with.
pub struct ConcurrencyGate {
    state_store: StateStoreHandle,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyGate {
    pub fn new(state_store: StateStoreHandle) -> Self {
        Self {
            state_store,
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore_for(&self, model: &str, max_concurrency: u32) -> Arc<Semaphore> {
        let mut semaphores = self.semaphores.lock().unwrap();
        semaphores
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(max_concurrency as usize)))
            .clone()
    }

    /// Blocks (up to `timeout`, if given) until a slot is free, then hands
    /// back a `Permit` and spawns its liveness watcher.
    pub async fn acquire(
        &self,
        model: &str,
        max_concurrency: u32,
        liveness: oneshot::Receiver<()>,
        timeout: Option<Duration>,
    ) -> Result<Permit, GeminiError> {
        let semaphore = self.semaphore_for(model, max_concurrency);
        let acquire_fut = semaphore.acquire_owned();

        let semaphore_permit = match timeout {
            Some(duration) => tokio::time::timeout(duration, acquire_fut)
                .await
                .map_err(|_| GeminiError::Timeout)?
                .map_err(|_| GeminiError::InvalidState {
                    message: "concurrency semaphore closed".to_string(),
                })?,
            None => acquire_fut.await.map_err(|_| GeminiError::InvalidState {
                message: "concurrency semaphore closed".to_string(),
            })?,
        };

        self.state_store.acquire(model, max_concurrency).await.ok();
        let permit = Permit::new(model.to_string(), semaphore_permit, self.state_store.clone());

        if let Err(e) = Actor::spawn(
            None,
            HolderWatcher,
            HolderWatcherArgs {
                permit: permit.clone(),
                liveness,
            },
        )
        .await
        {
            warn!(error = %e, model, "failed to start holder watcher; releasing permit immediately");
            permit.release().await;
            return Err(GeminiError::InvalidState {
                message: format!("failed to start holder watcher: {e}"),
            });
        }

        Ok(permit)
    }

    /// Non-blocking variant: fails fast with `OverCapacity` instead of
    /// waiting for a slot to free up.
    pub async fn try_acquire(
        &self,
        model: &str,
        max_concurrency: u32,
        liveness: oneshot::Receiver<()>,
    ) -> Result<Permit, GeminiError> {
        let semaphore = self.semaphore_for(model, max_concurrency);
        let semaphore_permit =
            semaphore
                .try_acquire_owned()
                .map_err(|_| GeminiError::OverCapacity {
                    model: model.to_string(),
                })?;

        self.state_store.acquire(model, max_concurrency).await.ok();
        let permit = Permit::new(model.to_string(), semaphore_permit, self.state_store.clone());

        if let Err(e) = Actor::spawn(
            None,
            HolderWatcher,
            HolderWatcherArgs {
                permit: permit.clone(),
                liveness,
            },
        )
        .await
        {
            permit.release().await;
            return Err(GeminiError::InvalidState {
                message: format!("failed to start holder watcher: {e}"),
            });
        }

        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_fails_over_capacity() {
        let state_store = StateStoreHandle::spawn().await.unwrap();
        let gate = ConcurrencyGate::new(state_store);
        let (_tx1, rx1) = oneshot::channel();
        let (_tx2, rx2) = oneshot::channel();

        let permit = gate.try_acquire("gemini-2.5-flash", 1, rx1).await.unwrap();
        let err = gate.try_acquire("gemini-2.5-flash", 1, rx2).await.unwrap_err();
        assert!(matches!(err, GeminiError::OverCapacity { .. }));

        permit.release().await;
    }

    #[tokio::test]
    async fn dropping_liveness_sender_releases_permit() {
        let state_store = StateStoreHandle::spawn().await.unwrap();
        let gate = ConcurrencyGate::new(state_store);
        let (tx, rx) = oneshot::channel();

        let _permit = gate.try_acquire("gemini-2.5-pro", 1, rx).await.unwrap();
        drop(tx);

        // Give the watcher actor a moment to observe the closed channel and
        // release the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_tx2, rx2) = oneshot::channel();
        let permit = gate.try_acquire("gemini-2.5-pro", 1, rx2).await.unwrap();
        permit.release().await;
    }
}
