//! Aggregate trait and the setup context its initializer runs in.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{AggError, BoxError};
use crate::event::{BroadcastEvent, EventControl, LocalControl, SharedControl};
use crate::lifecycle::Lifecycle;
use crate::reactive::{Computed, EffectScope, Reactive, ReadonlyState, State, WatchHandle};
use crate::request::{RequestControl, RequestEvent, RequestOptions};

/// A domain aggregate: reactive states, events, and the commands that
/// mutate them.
///
/// The implementing type holds the handles its initializer declared. The
/// states themselves live in reactive cells owned by the aggregate and are
/// only ever exposed read-only.
///
/// # Associated Types
///
/// - `Command`: the closed set of commands. Use adjacently tagged serde
///   (`#[serde(tag = "type", content = "data")]`) so commands can be
///   mirrored to peer realms by name.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`setup`](Aggregate::setup) declares every state and event up front.
///   It runs once per aggregate instance and must not block.
/// - [`handle`](Aggregate::handle) is the only way state changes. Peer
///   realms replay the same command through the same method, so it must
///   depend on nothing but the command and the aggregate's own state.
pub trait Aggregate: Sized + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "cart"). Used in logs and errors.
    const NAME: &'static str;

    /// The set of commands this aggregate can handle.
    type Command: Serialize + DeserializeOwned + Send + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Declare states and events and build the aggregate.
    ///
    /// # Errors
    ///
    /// Any error aborts construction; no partial aggregate is created.
    fn setup(ctx: &mut SetupContext) -> Result<Self, AggError>;

    /// Apply a command to the aggregate's states.
    fn handle(&self, cmd: Self::Command) -> Result<(), Self::Error>;

    /// Custom teardown, run first when a multi-instance aggregate is
    /// destroyed.
    fn teardown(&self) {}
}

/// Values storable in a declared state: reactive and serializable, so the
/// state can be snapshotted and restored from peer realms.
pub trait StateValue: Reactive + Serialize + DeserializeOwned {}

impl<T: Reactive + Serialize + DeserializeOwned> StateValue for T {}

/// Type-erased access to one declared state.
pub(crate) trait StateControl: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn to_json(&self) -> serde_json::Result<Value>;

    fn restore(&self, value: Value) -> serde_json::Result<()>;

    /// Call `f` with the JSON form of every new value.
    fn watch_json(&self, scope: &EffectScope, f: Box<dyn Fn(Value) + Send + Sync>) -> WatchHandle;
}

struct StateSlot<T> {
    name: String,
    state: State<T>,
}

impl<T: StateValue> StateControl for StateSlot<T> {
    fn as_any(&self) -> &dyn Any {
        &self.state
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        self.state.with(|value| serde_json::to_value(value))
    }

    fn restore(&self, value: Value) -> serde_json::Result<()> {
        self.state.set(serde_json::from_value(value)?);
        Ok(())
    }

    fn watch_json(&self, scope: &EffectScope, f: Box<dyn Fn(Value) + Send + Sync>) -> WatchHandle {
        let name = self.name.clone();
        self.state
            .watch(scope, move |new, _| match serde_json::to_value(new) {
                Ok(value) => f(value),
                Err(e) => tracing::warn!(state = %name, error = %e, "state is not serializable"),
            })
    }
}

/// A declared event: the typed handle (for downcasting) plus its erased
/// control surface.
pub(crate) struct DeclaredEvent {
    pub(crate) handle: Box<dyn Any + Send + Sync>,
    pub(crate) control: Box<dyn EventControl>,
}

/// Everything an initializer declared, keyed by name.
#[derive(Default)]
pub(crate) struct Declarations {
    pub(crate) states: BTreeMap<String, Box<dyn StateControl>>,
    pub(crate) events: BTreeMap<String, DeclaredEvent>,
}

impl Declarations {
    pub(crate) fn state<T: StateValue>(&self, name: &str) -> Option<State<T>> {
        self.states
            .get(name)?
            .as_any()
            .downcast_ref::<State<T>>()
            .cloned()
    }

    pub(crate) fn event<H: Clone + 'static>(&self, name: &str) -> Option<H> {
        self.events.get(name)?.handle.downcast_ref::<H>().cloned()
    }
}

/// The context an aggregate's [`setup`](Aggregate::setup) runs in.
///
/// Declares states and events, registers lifecycle hooks, and gives access
/// to the aggregate's effect scope. Declaring an existing name with the
/// same type returns the existing handle.
pub struct SetupContext {
    agg: &'static str,
    instance_id: Option<String>,
    lifecycle: Lifecycle,
    scope: EffectScope,
    pub(crate) decls: Declarations,
}

impl std::fmt::Debug for SetupContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupContext")
            .field("agg", &self.agg)
            .field("instance_id", &self.instance_id)
            .field("states", &self.decls.states.keys().collect::<Vec<_>>())
            .field("events", &self.decls.events.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SetupContext {
    pub(crate) fn new(agg: &'static str, instance_id: Option<String>) -> Self {
        Self {
            agg,
            instance_id,
            lifecycle: Lifecycle::new(agg),
            scope: EffectScope::new(),
            decls: Declarations::default(),
        }
    }

    pub(crate) fn into_parts(self) -> (Lifecycle, EffectScope, Declarations) {
        (self.lifecycle, self.scope, self.decls)
    }

    fn mismatch(&self, name: &str) -> AggError {
        AggError::TypeMismatch {
            agg: self.agg.to_owned(),
            name: name.to_owned(),
        }
    }

    /// Declare a state cell named `name` holding `initial`.
    ///
    /// # Errors
    ///
    /// Returns [`AggError::TypeMismatch`] if `name` is already declared
    /// with a different value type.
    pub fn state<T: StateValue>(&mut self, name: &str, initial: T) -> Result<State<T>, AggError> {
        if let Some(existing) = self.decls.states.get(name) {
            return existing
                .as_any()
                .downcast_ref::<State<T>>()
                .cloned()
                .ok_or_else(|| self.mismatch(name));
        }
        let state = State::new(initial);
        self.decls.states.insert(
            name.to_owned(),
            Box::new(StateSlot {
                name: name.to_owned(),
                state: state.clone(),
            }),
        );
        Ok(state)
    }

    fn declare_event<H: Clone + Send + Sync + 'static>(
        &mut self,
        name: &str,
        make: impl FnOnce() -> (H, Box<dyn EventControl>),
    ) -> Result<H, AggError> {
        if let Some(existing) = self.decls.events.get(name) {
            return existing
                .handle
                .downcast_ref::<H>()
                .cloned()
                .ok_or_else(|| self.mismatch(name));
        }
        let (handle, control) = make();
        self.decls.events.insert(
            name.to_owned(),
            DeclaredEvent {
                handle: Box::new(handle.clone()),
                control,
            },
        );
        Ok(handle)
    }

    /// Declare a broadcast event that shared aggregates mirror to peer
    /// realms.
    ///
    /// # Errors
    ///
    /// Returns [`AggError::TypeMismatch`] if `name` is already declared
    /// with a different type.
    pub fn broadcast_event<T>(&mut self, name: &str) -> Result<BroadcastEvent<T>, AggError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.declare_event(name, || {
            let event = BroadcastEvent::new(name);
            (event.clone(), Box::new(SharedControl(event)) as Box<dyn EventControl>)
        })
    }

    /// Declare a broadcast event that never leaves this realm.
    ///
    /// # Errors
    ///
    /// See [`broadcast_event`](Self::broadcast_event).
    pub fn local_event<T: Send + Sync + 'static>(
        &mut self,
        name: &str,
    ) -> Result<BroadcastEvent<T>, AggError> {
        self.declare_event(name, || {
            let event = BroadcastEvent::new(name);
            (event.clone(), Box::new(LocalControl(event)) as Box<dyn EventControl>)
        })
    }

    /// Declare a request/reply event. Request events are always local.
    ///
    /// `options` is only used when `name` is new.
    ///
    /// # Errors
    ///
    /// See [`broadcast_event`](Self::broadcast_event).
    pub fn request_event<Q, R>(
        &mut self,
        name: &str,
        options: RequestOptions<R>,
    ) -> Result<RequestEvent<Q, R>, AggError>
    where
        Q: Send + Sync + 'static,
        R: Send + 'static,
    {
        self.declare_event(name, || {
            let event = RequestEvent::new(name, options);
            (event.clone(), Box::new(RequestControl(event)) as Box<dyn EventControl>)
        })
    }

    /// Register a task that must finish before the aggregate initializes.
    ///
    /// # Errors
    ///
    /// Returns [`AggError::AlreadyInitialized`] once initialization started.
    pub fn on_before_initialize(
        &self,
        task: impl Future<Output = Result<(), BoxError>> + Send + 'static,
    ) -> Result<(), AggError> {
        self.lifecycle.on_before_initialize(task)
    }

    /// Run `f` when the aggregate's effect scope stops.
    pub fn on_scope_dispose(&self, f: impl FnOnce() + Send + 'static) {
        self.scope.on_dispose(f);
    }

    /// The aggregate's effect scope.
    pub fn scope(&self) -> &EffectScope {
        &self.scope
    }

    /// Watch `source` for the aggregate's lifetime.
    pub fn watch<T: Reactive>(
        &self,
        source: &ReadonlyState<T>,
        f: impl Fn(&T, &T) + Send + Sync + 'static,
    ) -> WatchHandle {
        source.watch(&self.scope, f)
    }

    /// See [`Lifecycle::is_initialized`].
    pub fn is_initialized(&self) -> Computed<bool> {
        self.lifecycle.is_initialized()
    }

    /// See [`Lifecycle::until_initialized`].
    pub fn until_initialized(&self) -> impl Future<Output = Result<(), AggError>> + Send + 'static {
        self.lifecycle.until_initialized()
    }

    /// The aggregate's lifecycle.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Entity identity of a multi-instance aggregate; `None` for singletons.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Name of the aggregate being set up.
    pub fn agg_name(&self) -> &'static str {
        self.agg
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::{Counter, CounterCommand, CounterError};
    use super::*;

    fn setup_counter() -> (Counter, SetupContext) {
        let mut ctx = SetupContext::new(Counter::NAME, None);
        let counter = Counter::setup(&mut ctx).unwrap();
        (counter, ctx)
    }

    #[test]
    fn handle_increment() {
        let (counter, _ctx) = setup_counter();
        counter.handle(CounterCommand::Increment).unwrap();
        assert_eq!(counter.value.get(), 1);
    }

    #[test]
    fn handle_decrement_at_zero_is_rejected() {
        let (counter, _ctx) = setup_counter();
        let result = counter.handle(CounterCommand::Decrement);
        assert!(matches!(result, Err(CounterError::AlreadyZero)));
        assert_eq!(counter.value.get(), 0);
    }

    #[test]
    fn handle_publishes_changes() {
        let (counter, _ctx) = setup_counter();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = std::sync::Arc::clone(&seen);
        counter
            .changed
            .listen(move |p| crate::reactive::lock(&s).push(*p.data));

        counter.handle(CounterCommand::Add(5)).unwrap();
        counter.handle(CounterCommand::Decrement).unwrap();

        assert_eq!(*crate::reactive::lock(&seen), vec![5, 4]);
    }

    #[test]
    fn redeclaring_a_state_returns_the_same_cell() {
        let (counter, mut ctx) = setup_counter();
        let again = ctx.state("value", 99u64).unwrap();
        again.set(7);
        assert_eq!(counter.value.get(), 7);
        assert!(
            ctx.decls
                .state::<u64>("value")
                .unwrap()
                .readonly()
                .ptr_eq(&counter.value.readonly())
        );
    }

    #[test]
    fn redeclaring_with_another_type_fails() {
        let (_counter, mut ctx) = setup_counter();

        let err = ctx.state("value", String::new()).unwrap_err();
        assert!(matches!(&err, AggError::TypeMismatch { name, .. } if name == "value"));

        let err = ctx.local_event::<String>("changed").unwrap_err();
        assert!(matches!(err, AggError::TypeMismatch { .. }));

        let err = ctx
            .request_event::<u64, u64>("changed", RequestOptions::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, AggError::TypeMismatch { .. }));
    }

    #[test]
    fn redeclaring_an_event_returns_the_same_event() {
        let (counter, mut ctx) = setup_counter();
        let again = ctx.local_event::<u64>("changed").unwrap();
        again.publish(3);
        assert_eq!(counter.changed.current_version().as_str(), "1");
    }

    #[test]
    fn state_snapshot_and_restore_round_trip_through_json() {
        let (counter, ctx) = setup_counter();
        let slot = &ctx.decls.states["value"];

        counter.value.set(12);
        assert_eq!(slot.to_json().unwrap(), serde_json::json!(12));

        slot.restore(serde_json::json!(40)).unwrap();
        assert_eq!(counter.value.get(), 40);
        assert!(slot.restore(serde_json::json!("forty")).is_err());
    }

    #[test]
    fn watchers_registered_in_setup_stop_with_the_scope() {
        let (counter, ctx) = setup_counter();
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let h = std::sync::Arc::clone(&hits);
        ctx.watch(&counter.value.readonly(), move |_, _| {
            h.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        counter.handle(CounterCommand::Increment).unwrap();
        ctx.scope().stop();
        counter.handle(CounterCommand::Increment).unwrap();

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn context_exposes_identity_and_lifecycle() {
        let ctx = SetupContext::new("cart", Some("cart-7".into()));
        assert_eq!(ctx.instance_id(), Some("cart-7"));
        assert_eq!(ctx.agg_name(), "cart");
        assert!(!ctx.is_initialized().get());
        assert_eq!(ctx.lifecycle().agg_name(), "cart");
    }
}
