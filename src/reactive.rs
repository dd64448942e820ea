//! Minimal reactive substrate: mutable cells, read-only views, derived
//! values, deep watchers, and effect scopes that cancel them.
//!
//! Watchers run synchronously inside `set`, after the write lock is
//! released, so a watcher may read or write any cell (including the one
//! that triggered it).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

/// Values storable in a reactive cell.
///
/// Change detection compares whole values, so nested data is watched
/// deeply.
pub trait Reactive: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> Reactive for T {}

type Cleanup = Box<dyn FnOnce() + Send>;
type WatchFn<T> = dyn Fn(&T, &T, &mut OnCleanup) + Send + Sync;

/// Registers a closure that runs before the watcher's next invocation,
/// or when the watcher stops.
#[derive(Default)]
pub struct OnCleanup {
    cleanup: Option<Cleanup>,
}

impl OnCleanup {
    /// Set the cleanup for the current run. A second call replaces the first.
    pub fn on_cleanup(&mut self, f: impl FnOnce() + Send + 'static) {
        self.cleanup = Some(Box::new(f));
    }
}

struct Watcher<T> {
    id: u64,
    active: AtomicBool,
    callback: Box<WatchFn<T>>,
    cleanup: Mutex<Option<Cleanup>>,
}

impl<T> Watcher<T> {
    fn run(&self, new: &T, old: &T) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        let previous = lock(&self.cleanup).take();
        if let Some(previous) = previous {
            previous();
        }
        let mut on_cleanup = OnCleanup::default();
        (self.callback)(new, old, &mut on_cleanup);
        if let Some(next) = on_cleanup.cleanup {
            *lock(&self.cleanup) = Some(next);
        }
    }

    fn deactivate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let pending = lock(&self.cleanup).take();
        if let Some(pending) = pending {
            pending();
        }
    }
}

struct Cell<T> {
    value: RwLock<T>,
    watchers: Mutex<Vec<Arc<Watcher<T>>>>,
    next_id: AtomicU64,
}

impl<T: Reactive> Cell<T> {
    fn notify(&self, new: &T, old: &T) {
        // Snapshot so watchers can subscribe or stop while being notified.
        let watchers: Vec<_> = lock(&self.watchers).clone();
        for watcher in watchers {
            watcher.run(new, old);
        }
    }

    fn remove(&self, id: u64) {
        lock(&self.watchers).retain(|w| w.id != id);
    }
}

fn subscribe<T: Reactive>(
    cell: &Arc<Cell<T>>,
    scope: &EffectScope,
    callback: Box<WatchFn<T>>,
) -> WatchHandle {
    let watcher = Arc::new(Watcher {
        id: cell.next_id.fetch_add(1, Ordering::Relaxed),
        active: AtomicBool::new(true),
        callback,
        cleanup: Mutex::new(None),
    });
    let effect = scope.reserve();
    let handle = {
        let watcher = Arc::clone(&watcher);
        let cell: Weak<Cell<T>> = Arc::downgrade(cell);
        let scope = Arc::downgrade(&scope.inner);
        WatchHandle {
            stop: Arc::new(move || {
                watcher.deactivate();
                if let Some(cell) = cell.upgrade() {
                    cell.remove(watcher.id);
                }
                if let Some(scope) = scope.upgrade() {
                    scope.untrack(effect);
                }
            }),
        }
    };
    if !scope.is_active() {
        watcher.active.store(false, Ordering::Release);
        return handle;
    }
    lock(&cell.watchers).push(watcher);
    let stop = handle.clone();
    scope.track_as(effect, move || stop.stop());
    handle
}

/// A mutable reactive cell.
///
/// Held by aggregate internals; callers outside the aggregate only ever
/// see the [`ReadonlyState`] view.
pub struct State<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Reactive + fmt::Debug> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("State").field(&*read(&self.cell.value)).finish()
    }
}

impl<T: Reactive> State<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(Cell {
                value: RwLock::new(value),
                watchers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// A clone of the current value.
    pub fn get(&self) -> T {
        read(&self.cell.value).clone()
    }

    /// Borrow the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&read(&self.cell.value))
    }

    /// Replace the value, notifying watchers if it changed.
    pub fn set(&self, value: T) {
        let old = {
            let mut guard = self.cell.value.write().unwrap_or_else(PoisonError::into_inner);
            if *guard == value {
                return;
            }
            std::mem::replace(&mut *guard, value)
        };
        let new = self.get();
        self.cell.notify(&new, &old);
    }

    /// Modify a copy of the value and store it back.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut next = self.get();
        f(&mut next);
        self.set(next);
    }

    /// A read-only view sharing this cell.
    pub fn readonly(&self) -> ReadonlyState<T> {
        ReadonlyState {
            cell: Arc::clone(&self.cell),
        }
    }

    /// Watch the value inside `scope`. See [`ReadonlyState::watch`].
    pub fn watch(
        &self,
        scope: &EffectScope,
        f: impl Fn(&T, &T) + Send + Sync + 'static,
    ) -> WatchHandle {
        subscribe(&self.cell, scope, Box::new(move |new, old, _| f(new, old)))
    }
}

/// A read-only view of a reactive cell.
///
/// There is no way to write through this view:
///
/// ```compile_fail
/// use aggsync::State;
///
/// let state = State::new(1);
/// let view = state.readonly();
/// view.set(2);
/// ```
pub struct ReadonlyState<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for ReadonlyState<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Reactive + fmt::Debug> fmt::Debug for ReadonlyState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadonlyState")
            .field(&*read(&self.cell.value))
            .finish()
    }
}

impl<T: Reactive> ReadonlyState<T> {
    /// A clone of the current value.
    pub fn get(&self) -> T {
        read(&self.cell.value).clone()
    }

    /// Borrow the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&read(&self.cell.value))
    }

    /// Call `f(new, old)` after every change, until `scope` stops or the
    /// returned handle is stopped.
    pub fn watch(
        &self,
        scope: &EffectScope,
        f: impl Fn(&T, &T) + Send + Sync + 'static,
    ) -> WatchHandle {
        subscribe(&self.cell, scope, Box::new(move |new, old, _| f(new, old)))
    }

    /// Like [`watch`](Self::watch), but the callback may register a cleanup
    /// that runs before its next invocation and when the watcher stops.
    pub fn watch_with_cleanup(
        &self,
        scope: &EffectScope,
        f: impl Fn(&T, &T, &mut OnCleanup) + Send + Sync + 'static,
    ) -> WatchHandle {
        subscribe(&self.cell, scope, Box::new(f))
    }

    /// Whether both views share the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

type ComputedWatch<T> =
    dyn Fn(&EffectScope, Arc<dyn Fn(&T, &T) + Send + Sync>) -> WatchHandle + Send + Sync;

/// A value derived from a source cell, recomputed on every read.
pub struct Computed<T> {
    compute: Arc<dyn Fn() -> T + Send + Sync>,
    watch: Arc<ComputedWatch<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            compute: Arc::clone(&self.compute),
            watch: Arc::clone(&self.watch),
        }
    }
}

impl<T: Reactive> Computed<T> {
    /// Derive a value from `source` through `f`.
    pub fn map<S: Reactive>(
        source: &ReadonlyState<S>,
        f: impl Fn(&S) -> T + Send + Sync + 'static,
    ) -> Self {
        let f = Arc::new(f);
        let compute = {
            let source = source.clone();
            let f = Arc::clone(&f);
            Arc::new(move || source.with(|s| f(s)))
        };
        let watch = {
            let source = source.clone();
            Arc::new(
                move |scope: &EffectScope, cb: Arc<dyn Fn(&T, &T) + Send + Sync>| {
                    let f = Arc::clone(&f);
                    source.watch(scope, move |new, old| {
                        let (new, old) = (f(new), f(old));
                        if new != old {
                            cb(&new, &old);
                        }
                    })
                },
            )
        };
        Self { compute, watch }
    }

    /// The current derived value.
    pub fn get(&self) -> T {
        (self.compute)()
    }

    /// Call `f(new, old)` whenever the derived value changes.
    pub fn watch(
        &self,
        scope: &EffectScope,
        f: impl Fn(&T, &T) + Send + Sync + 'static,
    ) -> WatchHandle {
        (self.watch)(scope, Arc::new(f))
    }
}

/// Stops a single watcher. Stopping twice is a no-op.
#[derive(Clone)]
pub struct WatchHandle {
    stop: Arc<dyn Fn() + Send + Sync>,
}

impl WatchHandle {
    /// Detach the watcher and run its pending cleanup.
    pub fn stop(&self) {
        (self.stop)();
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WatchHandle")
    }
}

struct ScopeInner {
    active: AtomicBool,
    next_effect: AtomicU64,
    effects: Mutex<Vec<(u64, Cleanup)>>,
}

impl ScopeInner {
    fn untrack(&self, effect: u64) {
        let removed = {
            let mut effects = lock(&self.effects);
            effects
                .iter()
                .position(|(id, _)| *id == effect)
                .map(|at| effects.remove(at))
        };
        drop(removed);
    }
}

/// Tracks watchers and dispose callbacks so they can be cancelled together.
///
/// `Clone` shares the same scope.
#[derive(Clone)]
pub struct EffectScope {
    inner: Arc<ScopeInner>,
}

impl Default for EffectScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EffectScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectScope")
            .field("active", &self.is_active())
            .finish()
    }
}

impl EffectScope {
    /// Create an active scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                active: AtomicBool::new(true),
                next_effect: AtomicU64::new(0),
                effects: Mutex::new(Vec::new()),
            }),
        }
    }

    /// `false` once [`stop`](Self::stop) has run.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Run `f` when the scope stops. If it already stopped, `f` runs now.
    pub fn on_dispose(&self, f: impl FnOnce() + Send + 'static) {
        let effect = self.reserve();
        self.track_as(effect, f);
    }

    fn reserve(&self) -> u64 {
        self.inner.next_effect.fetch_add(1, Ordering::Relaxed)
    }

    fn track_as(&self, effect: u64, f: impl FnOnce() + Send + 'static) {
        if !self.is_active() {
            f();
            return;
        }
        lock(&self.inner.effects).push((effect, Box::new(f)));
    }

    /// Stop every watcher created in this scope and run dispose callbacks
    /// in registration order. Idempotent.
    pub fn stop(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let effects = std::mem::take(&mut *lock(&self.inner.effects));
        for (_, effect) in effects {
            effect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn set_notifies_only_on_change() {
        let scope = EffectScope::new();
        let state = State::new(1);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        state.watch(&scope, move |new, old| lock(&seen).push((*new, *old)));

        state.set(1);
        state.set(2);
        state.update(|v| *v += 3);

        assert_eq!(*lock(&calls), vec![(2, 1), (5, 2)]);
    }

    #[test]
    fn nested_values_are_compared_deeply() {
        let scope = EffectScope::new();
        let state = State::new(vec![vec![1, 2], vec![3]]);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        state.watch(&scope, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        state.set(vec![vec![1, 2], vec![3]]);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        state.update(|v| v[1].push(4));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn readonly_view_tracks_writes() {
        let state = State::new(String::from("a"));
        let view = state.readonly();
        state.set("b".into());
        assert_eq!(view.get(), "b");
        assert_eq!(view.with(|s| s.len()), 1);
        assert!(view.ptr_eq(&state.readonly()));
    }

    #[test]
    fn stopping_scope_detaches_watchers_and_runs_dispose() {
        let scope = EffectScope::new();
        let state = State::new(0);
        let count = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicBool::new(false));

        let c = Arc::clone(&count);
        state.watch(&scope, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let d = Arc::clone(&disposed);
        scope.on_dispose(move || d.store(true, Ordering::SeqCst));

        state.set(1);
        scope.stop();
        scope.stop();
        state.set(2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(disposed.load(Ordering::SeqCst));
        assert!(!scope.is_active());
    }

    #[test]
    fn stopped_watchers_release_their_scope_entry() {
        let scope = EffectScope::new();
        let state = State::new(0);
        for _ in 0..100 {
            state.watch(&scope, |_, _| {}).stop();
        }
        assert!(lock(&scope.inner.effects).is_empty());

        let kept = Arc::new(AtomicUsize::new(0));
        let k = Arc::clone(&kept);
        state.watch(&scope, move |_, _| {
            k.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(lock(&scope.inner.effects).len(), 1);
        state.set(1);
        scope.stop();
        state.set(2);
        assert_eq!(kept.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn watch_on_stopped_scope_never_fires() {
        let scope = EffectScope::new();
        scope.stop();
        let state = State::new(0);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        state.watch(&scope, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        state.set(1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handle_stop_is_independent_of_scope() {
        let scope = EffectScope::new();
        let state = State::new(0);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = state.watch(&scope, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        handle.stop();
        handle.stop();
        state.set(1);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(scope.is_active());
    }

    #[test]
    fn cleanup_runs_before_rerun_and_on_stop() {
        let scope = EffectScope::new();
        let state = State::new(0);
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let l = Arc::clone(&log);
        state
            .readonly()
            .watch_with_cleanup(&scope, move |new, _, cleanup| {
                lock(&l).push(format!("run {new}"));
                let l = Arc::clone(&l);
                let n = *new;
                cleanup.on_cleanup(move || lock(&l).push(format!("cleanup {n}")));
            });

        state.set(1);
        state.set(2);
        scope.stop();

        assert_eq!(
            *lock(&log),
            vec!["run 1", "cleanup 1", "run 2", "cleanup 2"]
        );
    }

    #[test]
    fn watcher_may_write_the_cell_it_watches() {
        let scope = EffectScope::new();
        let state = State::new(0);
        let inner = state.clone();
        state.watch(&scope, move |new, _| {
            if *new < 3 {
                inner.set(new + 1);
            }
        });
        state.set(1);
        assert_eq!(state.get(), 3);
    }

    #[test]
    fn computed_recomputes_and_watches_derived_changes() {
        let scope = EffectScope::new();
        let state = State::new(1);
        let parity = Computed::map(&state.readonly(), |v| v % 2 == 0);
        let flips = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&flips);
        parity.watch(&scope, move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!parity.get());
        state.set(3);
        assert_eq!(flips.load(Ordering::SeqCst), 0);
        state.set(4);
        assert!(parity.get());
        assert_eq!(flips.load(Ordering::SeqCst), 1);
    }
}
