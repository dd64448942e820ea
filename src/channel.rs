//! In-process named broadcast channels that connect realms.
//!
//! A [`ChannelHub`] owns one `tokio::sync::broadcast` channel per name.
//! Each realm opens a [`ChannelPort`] with its own origin id, posts JSON
//! text through it, and reads peers' posts from an [`Inbox`]. A realm never
//! receives its own posts. The hub is an explicit value: two hubs never
//! see each other's traffic even when channel names collide.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use crate::error::SyncError;
use crate::reactive::lock;

/// Default number of undelivered posts a channel buffers per receiver.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Envelope {
    origin: Uuid,
    text: Arc<str>,
}

/// Registry of named broadcast channels.
///
/// `Clone` is cheap and shares the same channels.
#[derive(Clone)]
pub struct ChannelHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Envelope>>>>,
    capacity: usize,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChannelHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = lock(&self.channels).keys().cloned().collect();
        names.sort();
        f.debug_struct("ChannelHub")
            .field("channels", &names)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl ChannelHub {
    /// A hub whose channels buffer [`DEFAULT_CHANNEL_CAPACITY`] posts.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// A hub whose channels buffer `capacity` posts per receiver. Receivers
    /// that fall further behind skip the oldest posts.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be positive");
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Open a port on the channel named `name`, creating the channel on
    /// first use. Every port gets a fresh origin id.
    pub fn port(&self, name: &str) -> ChannelPort {
        let sender = lock(&self.channels)
            .entry(name.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        ChannelPort {
            name: Arc::from(name),
            origin: Uuid::new_v4(),
            sender,
        }
    }
}

/// One realm's connection to a named channel.
///
/// `Clone` shares the origin id, so clones never see each other's posts.
#[derive(Clone)]
pub struct ChannelPort {
    name: Arc<str>,
    origin: Uuid,
    sender: broadcast::Sender<Envelope>,
}

impl fmt::Debug for ChannelPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPort")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .finish()
    }
}

impl ChannelPort {
    /// The channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This port's origin id.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Post raw text to every other port on the channel.
    ///
    /// Posting with no listening peers is not an error.
    pub fn post_text(&self, text: impl Into<Arc<str>>) {
        let envelope = Envelope {
            origin: self.origin,
            text: text.into(),
        };
        // `send` only fails when nobody is subscribed.
        let _ = self.sender.send(envelope);
    }

    /// Encode `message` as JSON and post it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Encode`] if `message` cannot be serialized.
    pub fn post<M: Serialize>(&self, message: &M) -> Result<(), SyncError> {
        let text = serde_json::to_string(message)?;
        self.post_text(text);
        Ok(())
    }

    /// Start receiving peers' posts. Only posts made after this call are
    /// delivered.
    pub fn subscribe(&self) -> Inbox {
        Inbox {
            name: Arc::clone(&self.name),
            origin: self.origin,
            stream: BroadcastStream::new(self.sender.subscribe()),
        }
    }
}

/// Receives the posts of every other port on a channel, in post order.
pub struct Inbox {
    name: Arc<str>,
    origin: Uuid,
    stream: BroadcastStream<Envelope>,
}

impl fmt::Debug for Inbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl Inbox {
    /// The next post from a peer, or `None` once the channel is gone.
    ///
    /// Posts this inbox was too slow to receive are skipped with a warning.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(envelope) if envelope.origin == self.origin => continue,
                Ok(envelope) => return Some(envelope.text),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %self.name, skipped, "inbox lagged; skipping ahead");
                }
            }
        }
        None
    }
}
