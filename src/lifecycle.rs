//! Aggregate lifecycle: `Created -> Initializing -> Initialized`.
//!
//! Before-initialize tasks are collected while the aggregate is `Created`.
//! [`Lifecycle::initialize`] closes registration, runs every task
//! concurrently, waits for all of them to settle, and transitions exactly
//! once, to `Initialized` or `Failed`. The outcome is published on a
//! single-assignment signal that [`Lifecycle::until_initialized`] awaits.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::error::{AggError, BoxError};
use crate::reactive::{Computed, ReadonlyState, State, lock};

type Task = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// Outcome published once initialization settles.
type Outcome = Option<Result<(), String>>;

/// Where an aggregate is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// Accepting before-initialize tasks.
    Created,
    /// Tasks are running.
    Initializing,
    /// Every task succeeded. Terminal.
    Initialized,
    /// A task failed; carries its message. Terminal.
    Failed(String),
}

struct Pending {
    open: bool,
    tasks: Vec<Task>,
}

struct LifecycleInner {
    agg: String,
    state: State<LifecycleState>,
    pending: Mutex<Pending>,
    signal: watch::Sender<Outcome>,
}

/// Shared handle to one aggregate's lifecycle.
///
/// `Clone` is cheap and shares the same lifecycle.
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<LifecycleInner>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("agg", &self.inner.agg)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl Lifecycle {
    /// A lifecycle in the `Created` state for the aggregate named `agg`.
    pub fn new(agg: impl Into<String>) -> Self {
        let (signal, _) = watch::channel(None);
        Self {
            inner: Arc::new(LifecycleInner {
                agg: agg.into(),
                state: State::new(LifecycleState::Created),
                pending: Mutex::new(Pending {
                    open: true,
                    tasks: Vec::new(),
                }),
                signal,
            }),
        }
    }

    /// Name of the owning aggregate.
    pub fn agg_name(&self) -> &str {
        &self.inner.agg
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ReadonlyState<LifecycleState> {
        self.inner.state.readonly()
    }

    /// Register a task that must finish before the aggregate initializes.
    ///
    /// # Errors
    ///
    /// Returns [`AggError::AlreadyInitialized`] once initialization has
    /// started.
    pub fn on_before_initialize(
        &self,
        task: impl Future<Output = Result<(), BoxError>> + Send + 'static,
    ) -> Result<(), AggError> {
        let mut pending = lock(&self.inner.pending);
        if !pending.open {
            return Err(AggError::AlreadyInitialized);
        }
        pending.tasks.push(Box::pin(task));
        Ok(())
    }

    /// `false` until every before-initialize task has succeeded.
    pub fn is_initialized(&self) -> Computed<bool> {
        Computed::map(&self.inner.state.readonly(), |s| {
            *s == LifecycleState::Initialized
        })
    }

    /// Resolves once initialization settles.
    ///
    /// # Errors
    ///
    /// Returns [`AggError::InitializationFailed`], naming the aggregate and
    /// the first task error, every time it is awaited after a failure.
    pub fn until_initialized(&self) -> impl Future<Output = Result<(), AggError>> + Send + 'static {
        let mut rx = self.inner.signal.subscribe();
        let agg = self.inner.agg.clone();
        async move {
            let outcome = rx
                .wait_for(Option::is_some)
                .await
                .map(|outcome| (*outcome).clone())
                .ok()
                .flatten();
            match outcome {
                Some(Ok(())) => Ok(()),
                Some(Err(message)) => Err(AggError::InitializationFailed { agg, message }),
                None => Err(AggError::InitializationFailed {
                    agg,
                    message: "aggregate dropped before initialization".to_owned(),
                }),
            }
        }
    }

    /// Run every registered task and transition out of `Created`.
    ///
    /// Only the first call runs the tasks; later calls wait for the same
    /// outcome.
    ///
    /// # Errors
    ///
    /// See [`until_initialized`](Self::until_initialized).
    pub async fn initialize(&self) -> Result<(), AggError> {
        let tasks = {
            let mut pending = lock(&self.inner.pending);
            if !pending.open {
                None
            } else {
                pending.open = false;
                Some(std::mem::take(&mut pending.tasks))
            }
        };
        let Some(tasks) = tasks else {
            return self.until_initialized().await;
        };

        self.inner.state.set(LifecycleState::Initializing);
        tracing::debug!(agg = %self.inner.agg, tasks = tasks.len(), "initializing");

        let mut set = JoinSet::new();
        for task in tasks {
            set.spawn(task);
        }
        let mut failure: Option<String> = None;
        while let Some(joined) = set.join_next().await {
            let outcome = match joined {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(format!("before-initialize task did not complete: {e}")),
            };
            if let Err(message) = outcome {
                failure.get_or_insert(message);
            }
        }

        match failure {
            None => {
                self.inner.state.set(LifecycleState::Initialized);
                self.inner.signal.send_replace(Some(Ok(())));
                tracing::info!(agg = %self.inner.agg, "initialized");
                Ok(())
            }
            Some(message) => {
                tracing::warn!(agg = %self.inner.agg, error = %message, "initialization failed");
                self.inner
                    .state
                    .set(LifecycleState::Failed(message.clone()));
                self.inner.signal.send_replace(Some(Err(message.clone())));
                Err(AggError::InitializationFailed {
                    agg: self.inner.agg.clone(),
                    message,
                })
            }
        }
    }

    /// Spawn [`initialize`](Self::initialize) on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AggError::NoRuntime`] outside a runtime.
    pub(crate) fn schedule(&self) -> Result<(), AggError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| AggError::NoRuntime)?;
        let lifecycle = self.clone();
        handle.spawn(async move {
            // The outcome is observed through `until_initialized`.
            let _ = lifecycle.initialize().await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::EffectScope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn initializes_without_tasks() {
        let lifecycle = Lifecycle::new("cart");
        assert!(!lifecycle.is_initialized().get());

        lifecycle.initialize().await.expect("initialize should succeed");

        assert!(lifecycle.is_initialized().get());
        assert_eq!(lifecycle.state().get(), LifecycleState::Initialized);
        lifecycle.until_initialized().await.expect("until should resolve");
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_run_concurrently_and_all_settle_first() {
        let lifecycle = Lifecycle::new("cart");
        let finished = Arc::new(AtomicUsize::new(0));
        for delay in [30u64, 50] {
            let finished = Arc::clone(&finished);
            lifecycle
                .on_before_initialize(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        let started = tokio::time::Instant::now();
        lifecycle.initialize().await.unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() < Duration::from_millis(80));
    }

    #[tokio::test]
    async fn failing_task_fails_initialization() {
        let lifecycle = Lifecycle::new("cart");
        lifecycle
            .on_before_initialize(async { Err("inventory offline".into()) })
            .unwrap();
        lifecycle.on_before_initialize(async { Ok(()) }).unwrap();

        let err = lifecycle.initialize().await.unwrap_err();
        assert!(err.to_string().contains("inventory offline"));
        assert!(!lifecycle.is_initialized().get());

        for _ in 0..2 {
            let err = lifecycle.until_initialized().await.unwrap_err();
            assert!(
                matches!(&err, AggError::InitializationFailed { agg, .. } if agg == "cart"),
                "expected InitializationFailed, got: {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn registering_after_initialization_is_rejected() {
        let lifecycle = Lifecycle::new("cart");
        lifecycle.initialize().await.unwrap();

        let err = lifecycle.on_before_initialize(async { Ok(()) }).unwrap_err();
        assert_eq!(err.to_string(), "Agg already initialized");
    }

    #[tokio::test]
    async fn second_initialize_waits_for_the_first_outcome() {
        let lifecycle = Lifecycle::new("cart");
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        lifecycle
            .on_before_initialize(async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let (a, b) = tokio::join!(lifecycle.initialize(), lifecycle.initialize());
        a.unwrap();
        b.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scheduled_initialization_runs_on_the_runtime() {
        let lifecycle = Lifecycle::new("cart");
        let scope = EffectScope::new();
        let flips = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&flips);
        lifecycle.is_initialized().watch(&scope, move |now, _| {
            assert!(*now);
            f.fetch_add(1, Ordering::SeqCst);
        });

        lifecycle.schedule().unwrap();
        assert!(!lifecycle.is_initialized().get());
        lifecycle.until_initialized().await.unwrap();

        assert_eq!(flips.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_requires_a_runtime() {
        let lifecycle = Lifecycle::new("cart");
        assert!(matches!(lifecycle.schedule(), Err(AggError::NoRuntime)));
    }
}
