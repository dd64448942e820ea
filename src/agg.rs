//! Built aggregates and their builder.
//!
//! [`Agg`] wraps a user [`Aggregate`] behind a read-only surface: states
//! are exposed as [`ReadonlyState`], events as listen-only views, and the
//! only way to change anything is [`Agg::execute`]. The builder wires the
//! lifecycle, the state snapshot record, optional plugin registration, and
//! optional cross-realm synchronization.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::{Aggregate, Declarations, SetupContext, StateValue};
use crate::channel::ChannelHub;
use crate::command::{decode_command, encode_command};
use crate::error::{AggError, ExecuteError, SyncError};
use crate::event::{BroadcastEvent, BroadcastListener};
use crate::lifecycle::Lifecycle;
use crate::plugin::PluginRegistry;
use crate::reactive::{Computed, EffectScope, ReadonlyState};
use crate::request::{RequestEvent, RequestListener};
use crate::snapshot::{SnapshotRecord, StateSnapshot};
use crate::sync::{self, Replica, SyncConfig, SyncLink};
use crate::version::Version;

/// Name of the event every multi-instance aggregate publishes on destroy.
pub const DESTROYED_EVENT: &str = "destroyed";

/// A constructed aggregate.
///
/// `Clone` is cheap: all clones share the same aggregate.
pub struct Agg<A: Aggregate> {
    inner: Arc<AggInner<A>>,
}

struct AggInner<A: Aggregate> {
    aggregate: A,
    instance_id: Option<String>,
    physical_id: Uuid,
    lifecycle: Lifecycle,
    scope: EffectScope,
    decls: Declarations,
    record: SnapshotRecord,
    destroyed: AtomicBool,
    destroyed_event: Option<BroadcastEvent<()>>,
    link: Option<Arc<SyncLink>>,
}

impl<A: Aggregate> Clone for Agg<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Aggregate> fmt::Debug for Agg<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agg")
            .field("name", &A::NAME)
            .field("instance_id", &self.inner.instance_id)
            .field("physical_id", &self.inner.physical_id)
            .field("lifecycle", &self.inner.lifecycle.state().get())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Builder for [`Agg`].
///
/// # Examples
///
/// ```no_run
/// # use aggsync::{Agg, Aggregate, ChannelHub, SyncConfig};
/// # fn build<Cart: Aggregate>(hub: &ChannelHub) -> Result<(), aggsync::AggError> {
/// let cart = Agg::<Cart>::builder()
///     .instance("cart-7")
///     .shared(hub, "carts")
///     .sync_config(SyncConfig::default())
///     .build()?;
/// # let _ = cart;
/// # Ok(())
/// # }
/// ```
pub struct AggBuilder<A> {
    instance_id: Option<String>,
    shared: Option<(ChannelHub, String)>,
    config: SyncConfig,
    plugins: Option<PluginRegistry>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A> fmt::Debug for AggBuilder<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggBuilder")
            .field("instance_id", &self.instance_id)
            .field("channel", &self.shared.as_ref().map(|(_, name)| name))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<A: Aggregate> AggBuilder<A> {
    fn new() -> Self {
        Self {
            instance_id: None,
            shared: None,
            config: SyncConfig::default(),
            plugins: None,
            _aggregate: PhantomData,
        }
    }

    /// Build a multi-instance aggregate for the entity `id`.
    ///
    /// Multi-instance aggregates can be destroyed and always carry a
    /// `destroyed` event.
    pub fn instance(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    /// Synchronize with every aggregate built on `channel` of `hub`.
    pub fn shared(mut self, hub: &ChannelHub, channel: impl Into<String>) -> Self {
        self.shared = Some((hub.clone(), channel.into()));
        self
    }

    /// Override the default [`SyncConfig`].
    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Register the aggregate with `registry` before initialization starts.
    pub fn plugins(mut self, registry: &PluginRegistry) -> Self {
        self.plugins = Some(registry.clone());
        self
    }

    /// Run the aggregate's setup and schedule its initialization.
    ///
    /// Must be called inside a tokio runtime. Initialization (and, for
    /// shared aggregates, the startup state request) runs on a spawned
    /// task, so the returned aggregate is not yet initialized.
    ///
    /// # Errors
    ///
    /// * [`AggError::NoRuntime`] -- called outside a tokio runtime.
    /// * Any error returned by [`Aggregate::setup`]; no aggregate is built.
    /// * [`AggError::TypeMismatch`] -- a multi-instance aggregate declared
    ///   `destroyed` with a non-`()` payload.
    /// * [`AggError::Plugin`] -- registration with the plugin registry failed.
    pub fn build(self) -> Result<Agg<A>, AggError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| AggError::NoRuntime)?;

        let mut ctx = SetupContext::new(A::NAME, self.instance_id.clone());
        let aggregate = A::setup(&mut ctx)?;
        let destroyed_event = match self.instance_id {
            Some(_) => Some(ctx.local_event::<()>(DESTROYED_EVENT)?),
            None => None,
        };
        let (lifecycle, scope, decls) = ctx.into_parts();

        // Keep the snapshot record current for the aggregate's lifetime.
        let record = SnapshotRecord::new(StateSnapshot::capture(&decls, Version::default()));
        for (name, slot) in &decls.states {
            let record = record.clone();
            let name = name.clone();
            slot.watch_json(&scope, Box::new(move |value| record.record(&name, value)));
        }

        let physical_id = Uuid::new_v4();
        let shared = self.shared.map(|(hub, channel)| {
            let port = hub.port(&channel);
            let inbox = port.subscribe();
            let link = Arc::new(SyncLink::new(port, self.instance_id.clone(), physical_id));
            for (name, declared) in &decls.events {
                if self.instance_id.is_some() && name == DESTROYED_EVENT {
                    continue;
                }
                if let Some(event) = declared.control.shared() {
                    let link = Arc::clone(&link);
                    let name = name.clone();
                    event.set_relay(Some(Arc::new(move |data: Value| {
                        link.post_event(&name, data)
                    })));
                }
            }
            (link, inbox)
        });

        let inner = Arc::new(AggInner {
            aggregate,
            instance_id: self.instance_id,
            physical_id,
            lifecycle,
            scope,
            decls,
            record,
            destroyed: AtomicBool::new(false),
            destroyed_event,
            link: shared.as_ref().map(|(link, _)| Arc::clone(link)),
        });
        let agg = Agg { inner };

        if let Some(registry) = &self.plugins {
            registry.register_agg(&agg)?;
        }

        if let Some((link, inbox)) = shared {
            let weak = Arc::downgrade(&agg.inner);
            let replica: Weak<dyn Replica> = weak;
            sync::spawn(&handle, replica, link, inbox, self.config);
        }
        agg.inner.lifecycle.schedule()?;

        tracing::debug!(
            agg = A::NAME,
            instance_id = agg.inner.instance_id.as_deref(),
            %physical_id,
            shared = agg.inner.link.is_some(),
            "aggregate built"
        );
        Ok(agg)
    }
}

impl<A: Aggregate> Agg<A> {
    /// Start building an aggregate.
    pub fn builder() -> AggBuilder<A> {
        AggBuilder::new()
    }

    /// Build a local singleton aggregate with default settings.
    ///
    /// # Errors
    ///
    /// See [`AggBuilder::build`].
    pub fn new() -> Result<Self, AggError> {
        Self::builder().build()
    }

    /// Execute a command.
    ///
    /// For shared aggregates, a successful command is announced to peer
    /// realms, which replay it through [`Aggregate::handle`] without
    /// announcing it again. Events published while the command runs are
    /// not relayed separately; peers reproduce them by replaying the
    /// command.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] -- the aggregate rejected the command.
    /// * [`ExecuteError::Destroyed`] -- the aggregate was destroyed.
    pub fn execute(&self, cmd: A::Command) -> Result<(), ExecuteError<A::Error>> {
        let span = tracing::info_span!("execute", agg = A::NAME);
        let _enter = span.enter();

        if self.is_destroyed() {
            return Err(ExecuteError::Destroyed { agg: A::NAME });
        }

        let wire = match &self.inner.link {
            Some(_) => match encode_command(&cmd) {
                Ok(wire) => Some(wire),
                Err(e) => {
                    tracing::warn!(error = %e, "command cannot be encoded; it will not be synchronized");
                    None
                }
            },
            None => None,
        };

        sync::muted(self.inner.physical_id, || self.inner.aggregate.handle(cmd))
            .map_err(ExecuteError::Domain)?;

        if let (Some(link), Some((name, args))) = (&self.inner.link, wire) {
            link.post_command(name, args);
        }
        Ok(())
    }

    /// Read-only view of the state named `name`, if declared with type `T`.
    pub fn state<T: StateValue>(&self, name: &str) -> Option<ReadonlyState<T>> {
        self.inner.decls.state::<T>(name).map(|s| s.readonly())
    }

    /// Listen-only view of the broadcast event named `name`.
    pub fn event<T: Send + Sync + 'static>(&self, name: &str) -> Option<BroadcastListener<T>> {
        self.inner
            .decls
            .event::<BroadcastEvent<T>>(name)
            .map(|e| e.listener())
    }

    /// Reply-only view of the request event named `name`.
    pub fn request_event<Q, R>(&self, name: &str) -> Option<RequestListener<Q, R>>
    where
        Q: Send + Sync + 'static,
        R: Send + 'static,
    {
        self.inner
            .decls
            .event::<RequestEvent<Q, R>>(name)
            .map(|e| e.listener())
    }

    /// Names of every declared state, sorted.
    pub fn state_names(&self) -> Vec<String> {
        self.inner.decls.states.keys().cloned().collect()
    }

    /// Names of every declared event, sorted.
    pub fn event_names(&self) -> Vec<String> {
        self.inner.decls.events.keys().cloned().collect()
    }

    /// A plain copy of every state and the current snapshot version.
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.record.current()
    }

    /// See [`Lifecycle::is_initialized`].
    pub fn is_initialized(&self) -> Computed<bool> {
        self.inner.lifecycle.is_initialized()
    }

    /// See [`Lifecycle::until_initialized`].
    pub fn until_initialized(&self) -> impl Future<Output = Result<(), AggError>> + Send + 'static {
        self.inner.lifecycle.until_initialized()
    }

    /// The aggregate's lifecycle.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    /// The effect scope that owns every watcher created during setup.
    pub fn scope(&self) -> &EffectScope {
        &self.inner.scope
    }

    /// Entity identity of a multi-instance aggregate.
    pub fn instance_id(&self) -> Option<&str> {
        self.inner.instance_id.as_deref()
    }

    /// Identity of this physical instance. Unique per build.
    pub fn physical_id(&self) -> Uuid {
        self.inner.physical_id
    }

    /// Name of the sync channel, if shared.
    pub fn channel(&self) -> Option<&str> {
        self.inner.link.as_ref().map(|link| link.channel())
    }

    /// The `destroyed` event of a multi-instance aggregate.
    pub fn destroyed(&self) -> Option<BroadcastListener<()>> {
        self.inner.destroyed_event.as_ref().map(|e| e.listener())
    }

    /// `true` once [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Tear down a multi-instance aggregate. Idempotent.
    ///
    /// Runs [`Aggregate::teardown`], publishes `destroyed`, detaches every
    /// listener of every event, stops the effect scope, and stops
    /// synchronization. Afterwards [`execute`](Self::execute) fails with
    /// [`ExecuteError::Destroyed`].
    ///
    /// # Errors
    ///
    /// Returns [`AggError::NotMultiInstance`] for singleton aggregates.
    pub fn destroy(&self) -> Result<(), AggError> {
        if self.inner.destroyed_event.is_none() {
            return Err(AggError::NotMultiInstance {
                agg: A::NAME.to_owned(),
            });
        }
        self.inner.teardown_local();
        Ok(())
    }
}

impl<A: Aggregate> AggInner<A> {
    fn teardown_local(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.aggregate.teardown();
        if let Some(event) = &self.destroyed_event {
            // Siblings sharing the entity identity must not see this.
            event.publish_local(());
        }
        for declared in self.decls.events.values() {
            declared.control.clear_listeners();
        }
        self.scope.stop();
        if let Some(link) = &self.link {
            link.post_destroy();
            link.stop();
        }
        tracing::info!(
            agg = A::NAME,
            instance_id = self.instance_id.as_deref(),
            physical_id = %self.physical_id,
            "aggregate destroyed"
        );
    }
}

impl<A: Aggregate> Drop for AggInner<A> {
    fn drop(&mut self) {
        if let Some(link) = &self.link {
            link.stop();
        }
    }
}

impl<A: Aggregate> Replica for AggInner<A> {
    fn agg_name(&self) -> &'static str {
        A::NAME
    }

    fn apply_command(&self, name: &str, args: Value) -> Result<(), SyncError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Ok(());
        }
        let cmd = decode_command::<A::Command>(name, args)?;
        if let Err(e) = sync::muted(self.physical_id, || self.aggregate.handle(cmd)) {
            tracing::warn!(agg = A::NAME, command = name, error = %e, "peer command rejected locally");
        }
        Ok(())
    }

    fn replay_event(&self, name: &str, data: Value) {
        let Some(declared) = self.decls.events.get(name) else {
            tracing::debug!(agg = A::NAME, event = name, "ignoring peer event with unknown name");
            return;
        };
        let Some(event) = declared.control.shared() else {
            tracing::debug!(agg = A::NAME, event = name, "ignoring peer event for a local event");
            return;
        };
        if self.instance_id.is_some() && name == DESTROYED_EVENT {
            tracing::debug!(agg = A::NAME, "ignoring peer `destroyed` event");
            return;
        }
        if let Err(e) = sync::muted(self.physical_id, || event.replay(data)) {
            tracing::warn!(agg = A::NAME, event = name, error = %e, "peer event payload rejected");
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        self.record.current()
    }

    fn restore(&self, snapshot: StateSnapshot) {
        let applied = sync::muted(self.physical_id, || snapshot.apply_to(A::NAME, &self.decls));
        self.record.set_version(snapshot.version);
        tracing::debug!(agg = A::NAME, applied, "peer state applied");
    }

    fn destroy_from_peer(&self) {
        self.teardown_local();
    }
}
