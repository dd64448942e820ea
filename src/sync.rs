//! Cross-realm synchronization of shared aggregates.
//!
//! This module provides [`SyncConfig`] for tuning the startup state
//! request, the [`SyncMessage`] wire format, and the receive loop that
//! applies peers' commands, events, and state snapshots to a local
//! aggregate.
//!
//! Isolation: a multi-instance aggregate stamps every message with its
//! entity identity and ignores messages stamped with any other identity.
//! Singleton messages carry no identity.

use std::cell::RefCell;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::channel::{ChannelPort, Inbox};
use crate::error::SyncError;
use crate::reactive::lock;
use crate::snapshot::StateSnapshot;
use crate::version::Version;

/// Configuration for a shared aggregate's synchronization.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use aggsync::SyncConfig;
///
/// let config = SyncConfig {
///     state_request_window: Duration::from_secs(1),
/// };
/// assert_eq!(SyncConfig::default().state_request_window, Duration::from_millis(250));
/// # let _ = config;
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long after construction a `state-response` is still accepted.
    ///
    /// Only the first response inside the window is applied; later ones,
    /// and any response after the window closes, are ignored.
    ///
    /// Default: 250 milliseconds.
    pub state_request_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_request_window: Duration::from_millis(250),
        }
    }
}

/// A message on a sync channel.
///
/// Serialized as JSON with a kebab-case `type` tag and camelCase fields,
/// e.g. `{"type":"state-request","instanceId":"cart-7"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncMessage {
    /// A peer executed a command locally.
    Command {
        /// Command variant name.
        command_name: String,
        /// Command arguments; `null` for fieldless commands.
        #[serde(default)]
        args: Value,
        /// Fresh per-sender version.
        version: Version,
        /// Entity identity of a multi-instance sender.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
    },
    /// A newly constructed peer asks for the current state.
    StateRequest {
        /// Entity identity of a multi-instance sender.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
    },
    /// A peer's answer to a state request.
    StateResponse {
        /// Entity identity of a multi-instance sender.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        /// JSON form of every state, keyed by name.
        state: std::collections::BTreeMap<String, Value>,
        /// The sender's snapshot version.
        version: Version,
    },
    /// A peer published a shared broadcast event.
    EventBroadcast {
        /// Declared event name.
        event_name: String,
        /// Event payload.
        data: Value,
        /// Entity identity of a multi-instance sender.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
    },
    /// Tear down one physical instance.
    ///
    /// Every realm posts this for itself when it is destroyed, and peers
    /// ignore it because the physical id is not theirs. A realm tears down
    /// only when the physical id names it, so a supervisor holding a port
    /// on the channel can destroy one specific instance without touching
    /// its siblings.
    Destroy {
        /// Entity identity of a multi-instance sender.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        /// Identity of the destroyed physical instance.
        physical_id: Uuid,
    },
}

impl SyncMessage {
    /// The entity identity the message is scoped to.
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            SyncMessage::Command { instance_id, .. }
            | SyncMessage::StateRequest { instance_id }
            | SyncMessage::StateResponse { instance_id, .. }
            | SyncMessage::EventBroadcast { instance_id, .. }
            | SyncMessage::Destroy { instance_id, .. } => instance_id.as_deref(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SyncMessage::Command { .. } => "command",
            SyncMessage::StateRequest { .. } => "state-request",
            SyncMessage::StateResponse { .. } => "state-response",
            SyncMessage::EventBroadcast { .. } => "event-broadcast",
            SyncMessage::Destroy { .. } => "destroy",
        }
    }
}

thread_local! {
    static MUTED: RefCell<Vec<Uuid>> = const { RefCell::new(Vec::new()) };
}

/// Whether outbound posts of the physical instance `physical_id` are
/// suppressed on this thread.
///
/// Posts are suppressed while one of the instance's commands runs and
/// while peer traffic is applied to it: peers reproduce everything a
/// command does by replaying the command itself, so only the outermost
/// operation is announced. Other aggregates touched from inside (say, a
/// listener executing a command elsewhere) still announce their own work.
pub(crate) fn relay_muted(physical_id: Uuid) -> bool {
    MUTED.with(|muted| muted.borrow().contains(&physical_id))
}

/// Run `f` with the outbound posts of `physical_id` suppressed on this
/// thread.
pub(crate) fn muted<R>(physical_id: Uuid, f: impl FnOnce() -> R) -> R {
    struct Unmute(Uuid);
    impl Drop for Unmute {
        fn drop(&mut self) {
            MUTED.with(|muted| {
                let mut muted = muted.borrow_mut();
                if let Some(at) = muted.iter().rposition(|id| *id == self.0) {
                    muted.remove(at);
                }
            });
        }
    }
    MUTED.with(|muted| muted.borrow_mut().push(physical_id));
    let _unmute = Unmute(physical_id);
    f()
}

/// The local side a receive loop applies peer traffic to.
pub(crate) trait Replica: Send + Sync + 'static {
    fn agg_name(&self) -> &'static str;

    /// Run a peer's command through the unwrapped handler.
    fn apply_command(&self, name: &str, args: Value) -> Result<(), SyncError>;

    /// Publish a peer's event to local listeners only.
    fn replay_event(&self, name: &str, data: Value);

    fn snapshot(&self) -> StateSnapshot;

    /// Overwrite local states with a peer's snapshot.
    fn restore(&self, snapshot: StateSnapshot);

    /// Tear down in response to a destroy message aimed at this instance.
    fn destroy_from_peer(&self);
}

/// Outbound half of one aggregate's synchronization.
pub(crate) struct SyncLink {
    port: ChannelPort,
    instance_id: Option<String>,
    physical_id: Uuid,
    version: Mutex<Version>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncLink {
    pub(crate) fn new(port: ChannelPort, instance_id: Option<String>, physical_id: Uuid) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            port,
            instance_id,
            physical_id,
            version: Mutex::new(Version::default()),
            shutdown_tx,
        }
    }

    pub(crate) fn channel(&self) -> &str {
        self.port.name()
    }

    fn post(&self, message: &SyncMessage) {
        if self.is_stopped() {
            return;
        }
        match self.port.post(message) {
            Ok(()) => tracing::debug!(
                channel = self.port.name(),
                kind = message.kind(),
                "sync message posted"
            ),
            Err(e) => tracing::warn!(
                channel = self.port.name(),
                kind = message.kind(),
                error = %e,
                "sync message not posted"
            ),
        }
    }

    pub(crate) fn post_command(&self, command_name: String, args: Value) {
        if relay_muted(self.physical_id) {
            return;
        }
        let version = lock(&self.version).bump();
        self.post(&SyncMessage::Command {
            command_name,
            args,
            version,
            instance_id: self.instance_id.clone(),
        });
    }

    pub(crate) fn post_event(&self, event_name: &str, data: Value) {
        if relay_muted(self.physical_id) {
            tracing::trace!(event = event_name, "event published inside a command; not relayed");
            return;
        }
        self.post(&SyncMessage::EventBroadcast {
            event_name: event_name.to_owned(),
            data,
            instance_id: self.instance_id.clone(),
        });
    }

    /// Announce this instance's teardown. Siblings never act on it.
    pub(crate) fn post_destroy(&self) {
        self.post(&SyncMessage::Destroy {
            instance_id: self.instance_id.clone(),
            physical_id: self.physical_id,
        });
    }

    fn post_state_request(&self) {
        self.post(&SyncMessage::StateRequest {
            instance_id: self.instance_id.clone(),
        });
    }

    /// Signal the receive loop to stop. Safe to call more than once.
    pub(crate) fn stop(&self) {
        // Stores the flag even when the receive loop has already exited.
        self.shutdown_tx.send_replace(true);
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Spawn the receive loop for `replica` on the current runtime.
///
/// The loop first posts a `state-request`, then applies peer traffic until
/// the link stops, the replica is dropped, or the channel closes. The inbox
/// must be subscribed before this is called so that no answer is missed.
pub(crate) fn spawn(
    handle: &tokio::runtime::Handle,
    replica: Weak<dyn Replica>,
    link: Arc<SyncLink>,
    inbox: Inbox,
    config: SyncConfig,
) {
    handle.spawn(run_sync_loop(replica, link, inbox, config));
}

/// Whether a startup `state-response` may still be applied.
struct PendingStateRequest {
    deadline: Instant,
    answered: bool,
}

impl PendingStateRequest {
    fn accept(&mut self) -> bool {
        if self.answered || Instant::now() > self.deadline {
            return false;
        }
        self.answered = true;
        true
    }
}

async fn run_sync_loop(
    replica: Weak<dyn Replica>,
    link: Arc<SyncLink>,
    mut inbox: Inbox,
    config: SyncConfig,
) {
    let mut shutdown_rx = link.shutdown_tx.subscribe();
    if *shutdown_rx.borrow() {
        return;
    }

    let mut pending = PendingStateRequest {
        deadline: Instant::now() + config.state_request_window,
        answered: false,
    };
    link.post_state_request();

    loop {
        let text = tokio::select! {
            text = inbox.recv() => text,
            _ = shutdown_rx.changed() => break,
        };
        let Some(text) = text else {
            tracing::debug!(channel = link.port.name(), "sync channel closed");
            break;
        };
        let message = match serde_json::from_str::<SyncMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    channel = link.port.name(),
                    error = %e,
                    "ignoring malformed sync message"
                );
                continue;
            }
        };
        if message.instance_id() != link.instance_id.as_deref() {
            tracing::trace!(
                channel = link.port.name(),
                kind = message.kind(),
                "ignoring message for another instance"
            );
            continue;
        }
        let Some(replica) = replica.upgrade() else {
            break;
        };
        if !handle_message(&*replica, &link, &mut pending, message) {
            break;
        }
    }
    tracing::debug!(channel = link.port.name(), "sync loop stopped");
}

/// Apply one message. Returns `false` when the loop should stop.
fn handle_message(
    replica: &dyn Replica,
    link: &SyncLink,
    pending: &mut PendingStateRequest,
    message: SyncMessage,
) -> bool {
    let agg = replica.agg_name();
    match message {
        SyncMessage::Command {
            command_name, args, ..
        } => {
            tracing::debug!(agg, command = %command_name, "applying peer command");
            if let Err(e) = replica.apply_command(&command_name, args) {
                tracing::warn!(agg, command = %command_name, error = %e, "peer command not applied");
            }
        }
        SyncMessage::StateRequest { .. } => {
            let snapshot = replica.snapshot();
            tracing::debug!(agg, version = %snapshot.version, "answering state request");
            link.post(&SyncMessage::StateResponse {
                instance_id: link.instance_id.clone(),
                state: snapshot.states,
                version: snapshot.version,
            });
        }
        SyncMessage::StateResponse { state, version, .. } => {
            if pending.accept() {
                tracing::debug!(agg, %version, "applying peer state");
                replica.restore(StateSnapshot {
                    states: state,
                    version,
                });
            } else {
                tracing::debug!(agg, %version, "ignoring late state response");
            }
        }
        SyncMessage::EventBroadcast {
            event_name, data, ..
        } => {
            tracing::debug!(agg, event = %event_name, "replaying peer event");
            replica.replay_event(&event_name, data);
        }
        SyncMessage::Destroy { physical_id, .. } => {
            if physical_id == link.physical_id {
                tracing::debug!(agg, %physical_id, "destroy aimed at this instance");
                replica.destroy_from_peer();
                return false;
            }
        }
    }
    true
}
