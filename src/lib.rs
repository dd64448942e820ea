//! Reactive domain aggregates with lifecycle hooks, broadcast and
//! request/reply events, and cross-realm state synchronization.

mod agg;
pub use agg::{Agg, AggBuilder, DESTROYED_EVENT};
mod aggregate;
pub use aggregate::{Aggregate, SetupContext, StateValue};
mod channel;
mod command;
mod error;
mod event;
mod lifecycle;
mod plugin;
mod reactive;
mod request;
mod snapshot;
mod sync;
mod version;

pub use channel::{ChannelHub, ChannelPort, DEFAULT_CHANNEL_CAPACITY, Inbox};
pub use command::{decode_command, encode_command};
pub use error::{
    AggError, BoxError, ExecuteError, ListenError, ParseVersionError, PluginError, RequestError,
    SyncError,
};
pub use event::{BroadcastEvent, BroadcastListener, EventPayload, HISTORY_LEN, Listener, Subscription};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use plugin::{AggHandle, Plugin, PluginRegistry};
pub use reactive::{
    Computed, EffectScope, OnCleanup, Reactive, ReadonlyState, State, WatchHandle,
};
pub use request::{ReplyListener, RequestEvent, RequestListener, RequestOptions};
pub use snapshot::StateSnapshot;
pub use sync::{SyncConfig, SyncMessage};
pub use version::{Version, increment};
