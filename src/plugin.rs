//! Plugin registry: cross-cutting mount/unmount logic for aggregates.
//!
//! Aggregates join a [`PluginRegistry`] before they initialize. Setup
//! plugins mount once, as part of each aggregate's initialization, and can
//! never be removed. Hot-swap plugins mount immediately on every registered
//! aggregate and can be replaced or unregistered at any time. Both kinds
//! mount lazily on aggregates registered after them.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::agg::Agg;
use crate::aggregate::Aggregate;
use crate::error::{BoxError, PluginError};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::reactive::{EffectScope, lock};
use crate::snapshot::StateSnapshot;

/// The view of an aggregate that plugins receive.
pub trait AggHandle: Send + Sync {
    /// Aggregate type name.
    fn name(&self) -> &'static str;
    /// Entity identity of a multi-instance aggregate.
    fn instance_id(&self) -> Option<&str>;
    /// Identity of this physical instance.
    fn physical_id(&self) -> Uuid;
    /// The aggregate's lifecycle.
    fn lifecycle(&self) -> &Lifecycle;
    /// The aggregate's effect scope; watchers created in it stop on destroy.
    fn scope(&self) -> &EffectScope;
    /// Names of every declared state.
    fn state_names(&self) -> Vec<String>;
    /// Names of every declared event.
    fn event_names(&self) -> Vec<String>;
    /// A plain copy of every state.
    fn snapshot(&self) -> StateSnapshot;
    /// `true` once the aggregate was destroyed.
    fn is_destroyed(&self) -> bool;
}

impl<A: Aggregate> AggHandle for Agg<A> {
    fn name(&self) -> &'static str {
        A::NAME
    }

    fn instance_id(&self) -> Option<&str> {
        Agg::instance_id(self)
    }

    fn physical_id(&self) -> Uuid {
        Agg::physical_id(self)
    }

    fn lifecycle(&self) -> &Lifecycle {
        Agg::lifecycle(self)
    }

    fn scope(&self) -> &EffectScope {
        Agg::scope(self)
    }

    fn state_names(&self) -> Vec<String> {
        Agg::state_names(self)
    }

    fn event_names(&self) -> Vec<String> {
        Agg::event_names(self)
    }

    fn snapshot(&self) -> StateSnapshot {
        Agg::snapshot(self)
    }

    fn is_destroyed(&self) -> bool {
        Agg::is_destroyed(self)
    }
}

type MountFn = Arc<dyn Fn(&dyn AggHandle) -> Result<(), BoxError> + Send + Sync>;
type UnmountFn = Arc<dyn Fn(&dyn AggHandle) + Send + Sync>;

#[derive(Clone)]
enum PluginKind {
    Setup { mount: MountFn },
    HotSwap { mount: MountFn, unmount: UnmountFn },
}

/// A named plugin.
#[derive(Clone)]
pub struct Plugin {
    name: String,
    kind: PluginKind,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("setup", &self.is_setup())
            .finish()
    }
}

impl Plugin {
    /// A plugin that mounts during each aggregate's initialization.
    ///
    /// An error from `mount` fails that aggregate's initialization.
    pub fn setup(
        name: impl Into<String>,
        mount: impl Fn(&dyn AggHandle) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PluginKind::Setup {
                mount: Arc::new(mount),
            },
        }
    }

    /// A plugin that can be mounted and unmounted at any time.
    pub fn hot_swap(
        name: impl Into<String>,
        mount: impl Fn(&dyn AggHandle) -> Result<(), BoxError> + Send + Sync + 'static,
        unmount: impl Fn(&dyn AggHandle) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            kind: PluginKind::HotSwap {
                mount: Arc::new(mount),
                unmount: Arc::new(unmount),
            },
        }
    }

    /// The plugin's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` for setup plugins.
    pub fn is_setup(&self) -> bool {
        matches!(self.kind, PluginKind::Setup { .. })
    }

    fn mount_fn(&self) -> &MountFn {
        match &self.kind {
            PluginKind::Setup { mount } | PluginKind::HotSwap { mount, .. } => mount,
        }
    }
}

struct Entry {
    agg: Arc<dyn AggHandle>,
    mounted: HashSet<String>,
}

#[derive(Default)]
struct RegistryState {
    aggs: Vec<Entry>,
    plugins: Vec<Plugin>,
}

impl RegistryState {
    fn prune(&mut self) {
        self.aggs.retain(|entry| !entry.agg.is_destroyed());
    }
}

/// Registry of aggregates and the plugins mounted on them.
///
/// `Clone` is cheap and shares the same registry.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("PluginRegistry")
            .field("aggs", &state.aggs.len())
            .field(
                "plugins",
                &state.plugins.iter().map(Plugin::name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an aggregate. Plugins mount on it when it initializes.
    ///
    /// # Errors
    ///
    /// * [`PluginError::AlreadyRegistered`] -- this aggregate instance is
    ///   already registered.
    /// * [`PluginError::RegisterAfterInitialized`] -- initialization
    ///   already started.
    pub fn register_agg<A: Aggregate>(&self, agg: &Agg<A>) -> Result<(), PluginError> {
        let physical_id = agg.physical_id();
        let mut state = lock(&self.state);
        state.prune();
        if state
            .aggs
            .iter()
            .any(|entry| entry.agg.physical_id() == physical_id)
        {
            return Err(PluginError::AlreadyRegistered {
                agg: A::NAME.to_owned(),
            });
        }
        if agg.lifecycle().state().get() != LifecycleState::Created {
            return Err(PluginError::RegisterAfterInitialized);
        }
        let registry = self.clone();
        agg.lifecycle()
            .on_before_initialize(async move { registry.mount_pending(physical_id) })
            .map_err(|_| PluginError::RegisterAfterInitialized)?;
        state.aggs.push(Entry {
            agg: Arc::new(agg.clone()),
            mounted: HashSet::new(),
        });
        tracing::debug!(agg = A::NAME, %physical_id, "aggregate registered with plugins");
        Ok(())
    }

    /// Mount every plugin not yet mounted on the aggregate `physical_id`.
    fn mount_pending(&self, physical_id: Uuid) -> Result<(), BoxError> {
        let (agg, plugins) = {
            let mut state = lock(&self.state);
            let RegistryState { aggs, plugins } = &mut *state;
            let Some(entry) = aggs
                .iter_mut()
                .find(|entry| entry.agg.physical_id() == physical_id)
            else {
                return Ok(());
            };
            let pending: Vec<Plugin> = plugins
                .iter()
                .filter(|plugin| entry.mounted.insert(plugin.name.clone()))
                .cloned()
                .collect();
            (Arc::clone(&entry.agg), pending)
        };
        for plugin in plugins {
            tracing::debug!(agg = agg.name(), plugin = %plugin.name, "mounting plugin");
            (plugin.mount_fn())(&*agg)?;
        }
        Ok(())
    }

    /// Register a plugin.
    ///
    /// A hot-swap plugin mounts immediately on every registered aggregate.
    /// Registering a hot-swap plugin under a name already in use unmounts
    /// and replaces the previous one.
    ///
    /// # Errors
    ///
    /// * [`PluginError::DuplicateSetupPlugin`] -- a setup plugin already
    ///   uses this name.
    pub fn register_plugin(&self, plugin: Plugin) -> Result<(), PluginError> {
        let mut replaced = None;
        let mut mount_on = Vec::new();
        {
            let mut state = lock(&self.state);
            state.prune();
            if let Some(pos) = state.plugins.iter().position(|p| p.name == plugin.name) {
                if state.plugins[pos].is_setup() || plugin.is_setup() {
                    return Err(PluginError::DuplicateSetupPlugin { name: plugin.name });
                }
                let old = state.plugins.remove(pos);
                let aggs: Vec<_> = state
                    .aggs
                    .iter()
                    .filter(|entry| entry.mounted.contains(&old.name))
                    .map(|entry| Arc::clone(&entry.agg))
                    .collect();
                replaced = Some((old, aggs));
            }
            if !plugin.is_setup() {
                for entry in &mut state.aggs {
                    entry.mounted.insert(plugin.name.clone());
                    mount_on.push(Arc::clone(&entry.agg));
                }
            }
            state.plugins.push(plugin.clone());
        }

        if let Some((old, aggs)) = replaced
            && let PluginKind::HotSwap { unmount, .. } = &old.kind
        {
            for agg in &aggs {
                unmount(&**agg);
            }
        }
        for agg in &mount_on {
            if let Err(e) = (plugin.mount_fn())(&**agg) {
                tracing::warn!(agg = agg.name(), plugin = %plugin.name, error = %e, "plugin failed to mount");
            }
        }
        tracing::debug!(plugin = %plugin.name, mounted = mount_on.len(), "plugin registered");
        Ok(())
    }

    /// Unregister a hot-swap plugin, unmounting it everywhere.
    ///
    /// # Errors
    ///
    /// * [`PluginError::SetupPluginImmutable`] -- setup plugins cannot be
    ///   unregistered.
    /// * [`PluginError::UnknownPlugin`] -- no plugin uses this name.
    pub fn unregister_plugin(&self, name: &str) -> Result<(), PluginError> {
        let (plugin, aggs) = {
            let mut state = lock(&self.state);
            state.prune();
            let Some(pos) = state.plugins.iter().position(|p| p.name == name) else {
                return Err(PluginError::UnknownPlugin {
                    name: name.to_owned(),
                });
            };
            if state.plugins[pos].is_setup() {
                return Err(PluginError::SetupPluginImmutable {
                    name: name.to_owned(),
                });
            }
            let plugin = state.plugins.remove(pos);
            let aggs: Vec<_> = state
                .aggs
                .iter_mut()
                .filter_map(|entry| entry.mounted.remove(name).then(|| Arc::clone(&entry.agg)))
                .collect();
            (plugin, aggs)
        };
        if let PluginKind::HotSwap { unmount, .. } = &plugin.kind {
            for agg in &aggs {
                unmount(&**agg);
            }
        }
        tracing::debug!(plugin = name, unmounted = aggs.len(), "plugin unregistered");
        Ok(())
    }

    /// Names of registered plugins, in registration order.
    pub fn plugin_names(&self) -> Vec<String> {
        lock(&self.state)
            .plugins
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    /// Number of registered, not yet destroyed aggregates.
    pub fn agg_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.prune();
        state.aggs.len()
    }
}
