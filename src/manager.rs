//! Container lifecycle manager: one sandbox per user.
//!
//! The user → sandbox map lives in process memory only. Allocation for a
//! given user is serialized by a per-user lock held from the map lookup until
//! the new entry is inserted, so concurrent requests from one user never
//! create two sandboxes. The map lock itself is never held across a backend
//! call, and every backend call made under a user lock has a deadline.
//!
//! Sandboxes this manager is tearing down are tracked while the delete runs,
//! so an allocation racing a release gets a fresh sandbox instead of a stale
//! mapping error.
//!
//! Known gaps: a crash (or a dropped request future) between a successful
//! backend create and the map insert leaves an unreferenced sandbox behind,
//! and a restart forgets every mapping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::backend::{ConnectionInfo, SandboxBackend, SandboxSpec};
use crate::config::{Config, SandboxTemplate};
use crate::error::{AllocatorError, BackendError};

/// Prefix of every sandbox name this service creates.
pub const SANDBOX_NAME_PREFIX: &str = "user-container-";

pub fn new_sandbox_id() -> String {
    format!("{}{}", SANDBOX_NAME_PREFIX, uuid::Uuid::new_v4())
}

pub struct ContainerManager {
    backend: Arc<dyn SandboxBackend>,
    template: SandboxTemplate,
    create_timeout: Duration,
    describe_timeout: Duration,
    reallocate_stale: bool,
    /// user id → sandbox id
    assignments: RwLock<HashMap<String, String>>,
    /// Per-user allocation locks. An entry exists only while someone holds
    /// or waits on it.
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// sandbox id → number of releases in flight for it
    releasing: Mutex<HashMap<String, usize>>,
}

impl ContainerManager {
    pub fn new(backend: Arc<dyn SandboxBackend>, config: &Config) -> Self {
        Self {
            backend,
            template: config.template.clone(),
            create_timeout: config.create_timeout,
            describe_timeout: config.request_timeout,
            reallocate_stale: config.reallocate_stale,
            assignments: RwLock::new(HashMap::new()),
            user_locks: Mutex::new(HashMap::new()),
            releasing: Mutex::new(HashMap::new()),
        }
    }

    /// Return the user's sandbox, creating one if they have none.
    pub async fn allocate(&self, user_id: &str) -> Result<ConnectionInfo, AllocatorError> {
        if user_id.is_empty() {
            return Err(AllocatorError::InvalidUserId);
        }

        let lock = self.user_lock(user_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.allocate_locked(user_id).await
        };
        self.forget_user_lock(user_id, lock).await;
        result
    }

    /// Tear the sandbox down and drop every mapping that points at it.
    ///
    /// The mapping cleanup runs even when the backend delete fails, so a
    /// failed release never leaves a user pinned to a dead sandbox. The
    /// backend error is still returned.
    pub async fn release(&self, sandbox_id: &str) -> Result<(), AllocatorError> {
        info!(sandbox_id = %sandbox_id, "releasing sandbox");

        self.mark_releasing(sandbox_id).await;
        let deleted = self.backend.delete(sandbox_id).await;
        let removed = self.unassign_sandbox(sandbox_id).await;
        self.unmark_releasing(sandbox_id).await;

        match deleted {
            Ok(()) => {
                info!(sandbox_id = %sandbox_id, removed, "sandbox released");
                Ok(())
            }
            Err(source) => {
                warn!(
                    sandbox_id = %sandbox_id,
                    removed,
                    error = %source,
                    "backend delete failed; mappings removed anyway, sandbox needs reconciliation"
                );
                Err(AllocatorError::Release {
                    sandbox_id: sandbox_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Snapshot of all current (user id, sandbox id) pairs, sorted by user.
    pub async fn assignments(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .assignments
            .read()
            .await
            .iter()
            .map(|(user, sandbox)| (user.clone(), sandbox.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    async fn allocate_locked(&self, user_id: &str) -> Result<ConnectionInfo, AllocatorError> {
        let existing = self.assignments.read().await.get(user_id).cloned();

        if let Some(sandbox_id) = existing {
            if self.is_releasing(&sandbox_id).await {
                self.unassign_user(user_id, &sandbox_id).await;
                info!(
                    user_id = %user_id,
                    sandbox_id = %sandbox_id,
                    "mapped sandbox is being released; allocating a new one"
                );
                return self.create_for(user_id).await;
            }

            let described =
                tokio::time::timeout(self.describe_timeout, self.backend.describe(&sandbox_id))
                    .await
                    .unwrap_or(Err(BackendError::Timeout));

            match described {
                Ok(info) => {
                    info!(user_id = %user_id, sandbox_id = %sandbox_id, "reusing existing sandbox");
                    return Ok(info);
                }
                Err(BackendError::NotFound(_)) => {
                    self.unassign_user(user_id, &sandbox_id).await;
                    if self.is_releasing(&sandbox_id).await {
                        info!(
                            user_id = %user_id,
                            sandbox_id = %sandbox_id,
                            "mapped sandbox was released during describe; allocating a new one"
                        );
                    } else {
                        warn!(
                            user_id = %user_id,
                            sandbox_id = %sandbox_id,
                            reallocate = self.reallocate_stale,
                            "mapped sandbox no longer exists at backend; stale mapping evicted"
                        );
                        if !self.reallocate_stale {
                            return Err(AllocatorError::InconsistentState {
                                user_id: user_id.to_string(),
                                sandbox_id,
                            });
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.create_for(user_id).await
    }

    async fn create_for(&self, user_id: &str) -> Result<ConnectionInfo, AllocatorError> {
        let spec = SandboxSpec {
            name: new_sandbox_id(),
            template: self.template.clone(),
        };
        info!(user_id = %user_id, sandbox_id = %spec.name, "creating sandbox for user");

        let created = tokio::time::timeout(self.create_timeout, self.backend.create(&spec)).await;
        let info = match created {
            Ok(Ok(info)) => info,
            Ok(Err(BackendError::Timeout)) | Err(_) => {
                warn!(
                    user_id = %user_id,
                    sandbox_id = %spec.name,
                    "sandbox create timed out; it may exist without a mapping"
                );
                return Err(AllocatorError::CreateOutcomeUnknown {
                    sandbox_id: spec.name,
                });
            }
            Ok(Err(e)) => return Err(e.into()),
        };

        self.assignments
            .write()
            .await
            .insert(user_id.to_string(), spec.name);
        Ok(info)
    }

    /// Remove the user's entry, but only if it still names `sandbox_id`.
    async fn unassign_user(&self, user_id: &str, sandbox_id: &str) {
        let mut assignments = self.assignments.write().await;
        if assignments.get(user_id).map(String::as_str) == Some(sandbox_id) {
            assignments.remove(user_id);
        }
    }

    async fn unassign_sandbox(&self, sandbox_id: &str) -> usize {
        let mut assignments = self.assignments.write().await;
        let before = assignments.len();
        assignments.retain(|_, mapped| mapped != sandbox_id);
        before - assignments.len()
    }

    async fn mark_releasing(&self, sandbox_id: &str) {
        *self
            .releasing
            .lock()
            .await
            .entry(sandbox_id.to_string())
            .or_insert(0) += 1;
    }

    async fn unmark_releasing(&self, sandbox_id: &str) {
        let mut releasing = self.releasing.lock().await;
        if let Some(count) = releasing.get_mut(sandbox_id) {
            *count -= 1;
            if *count == 0 {
                releasing.remove(sandbox_id);
            }
        }
    }

    async fn is_releasing(&self, sandbox_id: &str) -> bool {
        self.releasing.lock().await.contains_key(sandbox_id)
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .lock()
            .await
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn forget_user_lock(&self, user_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.user_locks.lock().await;
        // Held by the registry and by us only: no one else is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Endpoint, MemoryBackend};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Memory backend with call counting and failure injection.
    struct ScriptedBackend {
        inner: MemoryBackend,
        creates: AtomicUsize,
        create_delay: Duration,
        /// Applied after the sandbox is already gone at the backend.
        delete_delay: Duration,
        fail_create: AtomicBool,
        create_times_out: AtomicBool,
        fail_describe: AtomicBool,
        hang_describe: AtomicBool,
        fail_delete: AtomicBool,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(create_delay: Duration) -> Self {
            Self {
                inner: MemoryBackend::new(Config::default().endpoint),
                creates: AtomicUsize::new(0),
                create_delay,
                delete_delay: Duration::ZERO,
                fail_create: AtomicBool::new(false),
                create_times_out: AtomicBool::new(false),
                fail_describe: AtomicBool::new(false),
                hang_describe: AtomicBool::new(false),
                fail_delete: AtomicBool::new(false),
            }
        }

        fn creates(&self) -> usize {
            self.creates.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SandboxBackend for ScriptedBackend {
        async fn create(&self, spec: &SandboxSpec) -> Result<ConnectionInfo, BackendError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(BackendError::Provision("quota exceeded".into()));
            }
            if self.create_times_out.load(Ordering::SeqCst) {
                return Err(BackendError::Timeout);
            }
            self.inner.create(spec).await
        }

        async fn describe(&self, sandbox_id: &str) -> Result<ConnectionInfo, BackendError> {
            if self.hang_describe.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail_describe.load(Ordering::SeqCst) {
                return Err(BackendError::Backend("connection reset".into()));
            }
            self.inner.describe(sandbox_id).await
        }

        async fn delete(&self, sandbox_id: &str) -> Result<(), BackendError> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(BackendError::Backend("backend unreachable".into()));
            }
            self.inner.delete(sandbox_id).await?;
            if !self.delete_delay.is_zero() {
                tokio::time::sleep(self.delete_delay).await;
            }
            Ok(())
        }
    }

    fn manager_with(backend: Arc<ScriptedBackend>, config: Config) -> ContainerManager {
        ContainerManager::new(backend, &config)
    }

    fn manager(backend: Arc<ScriptedBackend>) -> ContainerManager {
        manager_with(backend, Config::default())
    }

    #[test]
    fn sandbox_ids_are_prefixed_and_unique() {
        let a = new_sandbox_id();
        let b = new_sandbox_id();
        assert!(a.starts_with(SANDBOX_NAME_PREFIX));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn empty_user_id_is_rejected() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());

        let err = manager.allocate("").await.unwrap_err();
        assert!(matches!(err, AllocatorError::InvalidUserId));
        assert_eq!(backend.creates(), 0);
    }

    #[tokio::test]
    async fn repeated_allocate_reuses_sandbox() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());

        let first = manager.allocate("alice").await.unwrap();
        let second = manager.allocate("alice").await.unwrap();

        assert_eq!(first, second);
        assert!(matches!(first.endpoint, Endpoint::Address(_)));
        assert_eq!(backend.creates(), 1);
    }

    #[tokio::test]
    async fn distinct_users_get_distinct_sandboxes() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());

        let alice = manager.allocate("alice").await.unwrap();
        let bob = manager.allocate("bob").await.unwrap();

        assert_ne!(alice.sandbox_id, bob.sandbox_id);
        assert_eq!(
            manager.assignments().await,
            vec![
                ("alice".to_string(), alice.sandbox_id),
                ("bob".to_string(), bob.sandbox_id),
            ]
        );
    }

    #[tokio::test]
    async fn release_then_allocate_creates_new_sandbox() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());

        let s1 = manager.allocate("alice").await.unwrap();
        let again = manager.allocate("alice").await.unwrap();
        assert_eq!(again, s1);
        assert_eq!(backend.creates(), 1);

        manager.release(&s1.sandbox_id).await.unwrap();
        assert!(manager.assignments().await.is_empty());

        let s2 = manager.allocate("alice").await.unwrap();
        assert_ne!(s2.sandbox_id, s1.sandbox_id);
        assert_eq!(backend.creates(), 2);
    }

    #[tokio::test]
    async fn failed_create_adds_no_mapping() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_create.store(true, Ordering::SeqCst);
        let manager = manager(backend.clone());

        let err = manager.allocate("alice").await.unwrap_err();
        assert!(matches!(
            err,
            AllocatorError::Provisioning(BackendError::Provision(_))
        ));
        assert!(manager.assignments().await.is_empty());
    }

    #[tokio::test]
    async fn release_removes_every_entry_for_sandbox() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());

        let shared = manager.allocate("alice").await.unwrap();
        let other = manager.allocate("carol").await.unwrap();
        manager
            .assignments
            .write()
            .await
            .insert("bob".into(), shared.sandbox_id.clone());

        manager.release(&shared.sandbox_id).await.unwrap();

        assert_eq!(
            manager.assignments().await,
            vec![("carol".to_string(), other.sandbox_id)]
        );
    }

    #[tokio::test]
    async fn failed_delete_still_clears_mapping() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());

        let info = manager.allocate("alice").await.unwrap();
        backend.fail_delete.store(true, Ordering::SeqCst);

        let err = manager.release(&info.sandbox_id).await.unwrap_err();
        match err {
            AllocatorError::Release { sandbox_id, .. } => assert_eq!(sandbox_id, info.sandbox_id),
            other => panic!("expected release error, got {other:?}"),
        }
        assert!(manager.assignments().await.is_empty());
    }

    #[tokio::test]
    async fn release_of_unknown_sandbox_is_error() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend);

        let err = manager.release("user-container-missing").await.unwrap_err();
        assert!(matches!(
            err,
            AllocatorError::Release {
                source: BackendError::NotFound(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stale_mapping_is_reported_then_evicted() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());

        let first = manager.allocate("alice").await.unwrap();
        // Deleted behind the manager's back.
        backend.inner.delete(&first.sandbox_id).await.unwrap();

        let err = manager.allocate("alice").await.unwrap_err();
        match err {
            AllocatorError::InconsistentState { user_id, sandbox_id } => {
                assert_eq!(user_id, "alice");
                assert_eq!(sandbox_id, first.sandbox_id);
            }
            other => panic!("expected inconsistent state, got {other:?}"),
        }
        assert!(manager.assignments().await.is_empty());

        let second = manager.allocate("alice").await.unwrap();
        assert_ne!(second.sandbox_id, first.sandbox_id);
    }

    #[tokio::test]
    async fn stale_mapping_reallocates_when_enabled() {
        let backend = Arc::new(ScriptedBackend::new());
        let config = Config {
            reallocate_stale: true,
            ..Config::default()
        };
        let manager = manager_with(backend.clone(), config);

        let first = manager.allocate("alice").await.unwrap();
        backend.inner.delete(&first.sandbox_id).await.unwrap();

        let second = manager.allocate("alice").await.unwrap();
        assert_ne!(second.sandbox_id, first.sandbox_id);
        assert_eq!(
            manager.assignments().await,
            vec![("alice".to_string(), second.sandbox_id)]
        );
    }

    #[tokio::test]
    async fn describe_failure_keeps_mapping() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend.clone());

        let info = manager.allocate("alice").await.unwrap();
        backend.fail_describe.store(true, Ordering::SeqCst);

        let err = manager.allocate("alice").await.unwrap_err();
        assert!(matches!(
            err,
            AllocatorError::Provisioning(BackendError::Backend(_))
        ));
        assert_eq!(
            manager.assignments().await,
            vec![("alice".to_string(), info.sandbox_id)]
        );
    }

    #[tokio::test]
    async fn create_timeout_is_unknown_outcome() {
        let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_secs(5)));
        let config = Config {
            create_timeout: Duration::from_millis(50),
            ..Config::default()
        };
        let manager = manager_with(backend, config);

        let err = manager.allocate("alice").await.unwrap_err();
        match err {
            AllocatorError::CreateOutcomeUnknown { sandbox_id } => {
                assert!(sandbox_id.starts_with(SANDBOX_NAME_PREFIX));
            }
            other => panic!("expected unknown outcome, got {other:?}"),
        }
        assert!(manager.assignments().await.is_empty());
    }

    #[tokio::test]
    async fn backend_timeout_on_create_is_unknown_outcome() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.create_times_out.store(true, Ordering::SeqCst);
        let manager = manager(backend.clone());

        let err = manager.allocate("alice").await.unwrap_err();
        match err {
            AllocatorError::CreateOutcomeUnknown { sandbox_id } => {
                assert!(sandbox_id.starts_with(SANDBOX_NAME_PREFIX));
            }
            other => panic!("expected unknown outcome, got {other:?}"),
        }
        assert_eq!(backend.creates(), 1);
        assert!(manager.assignments().await.is_empty());
    }

    #[tokio::test]
    async fn hung_describe_times_out_and_frees_user() {
        let backend = Arc::new(ScriptedBackend::new());
        let config = Config {
            request_timeout: Duration::from_millis(50),
            ..Config::default()
        };
        let manager = manager_with(backend.clone(), config);

        let info = manager.allocate("alice").await.unwrap();
        backend.hang_describe.store(true, Ordering::SeqCst);

        for _ in 0..2 {
            let err = tokio::time::timeout(Duration::from_secs(2), manager.allocate("alice"))
                .await
                .expect("allocate stayed blocked on describe")
                .unwrap_err();
            assert!(matches!(
                err,
                AllocatorError::Provisioning(BackendError::Timeout)
            ));
        }
        assert_eq!(
            manager.assignments().await,
            vec![("alice".to_string(), info.sandbox_id)]
        );
        assert!(manager.user_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn allocate_during_slow_release_creates_new_sandbox() {
        let backend = Arc::new(ScriptedBackend {
            delete_delay: Duration::from_millis(300),
            ..ScriptedBackend::new()
        });
        let manager = Arc::new(manager(backend.clone()));

        let s1 = manager.allocate("alice").await.unwrap();
        let releasing = {
            let manager = manager.clone();
            let sandbox_id = s1.sandbox_id.clone();
            tokio::spawn(async move { manager.release(&sandbox_id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let s2 = manager.allocate("alice").await.unwrap();
        assert_ne!(s2.sandbox_id, s1.sandbox_id);
        assert_eq!(backend.creates(), 2);

        releasing.await.unwrap().unwrap();
        assert_eq!(
            manager.assignments().await,
            vec![("alice".to_string(), s2.sandbox_id)]
        );
        assert!(manager.releasing.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocations_create_one_sandbox() {
        let backend = Arc::new(ScriptedBackend::with_delay(Duration::from_millis(20)));
        let manager = Arc::new(manager(backend.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.allocate("bob").await })
            })
            .collect();
        let results = futures_util::future::join_all(handles).await;

        let ids: Vec<String> = results
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().sandbox_id)
            .collect();
        assert!(ids.iter().all(|id| id == &ids[0]));
        assert_eq!(backend.creates(), 1);
        assert_eq!(
            manager.assignments().await,
            vec![("bob".to_string(), ids[0].clone())]
        );
    }

    #[tokio::test]
    async fn user_locks_are_dropped_after_allocation() {
        let backend = Arc::new(ScriptedBackend::new());
        let manager = manager(backend);

        manager.allocate("alice").await.unwrap();
        manager.allocate("bob").await.unwrap();

        assert!(manager.user_locks.lock().await.is_empty());
    }
}
