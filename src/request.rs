//! Request events: multicast request/reply with FIFO draining.
//!
//! `publish_request` enqueues an entry immediately and returns a future
//! that settles once every listener registered at drain time has replied
//! to it, once a listener error terminates it, or once its timeout fires.
//!
//! Draining is deferred to the runtime: publishing or registering a
//! listener schedules at most one drain task, which processes queued
//! entries strictly in publish order. Listeners registered back to back
//! therefore all see the oldest entry before any of them sees the next.
//! With no listeners registered, entries stay queued.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{BoxError, ListenError, RequestError};
use crate::event::{EventControl, EventPayload, Subscription};
use crate::reactive::lock;
use crate::version::Version;

/// A reply listener: returns a reply, or an error to signal failure.
pub type ReplyListener<Q, R> = Arc<dyn Fn(&EventPayload<Q>) -> Result<R, BoxError> + Send + Sync>;

type ErrorHook = Arc<dyn Fn(&(dyn std::error::Error + Send + Sync)) + Send + Sync>;

/// Configuration for a [`RequestEvent`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use aggsync::RequestOptions;
///
/// let options = RequestOptions::new(|reply: bool| println!("confirmed: {reply}"))
///     .on_error(|e| eprintln!("listener failed: {e}"))
///     .max_listener_count(2)
///     .terminate_on_error(true)
///     .timeout(Duration::from_secs(5));
/// # let _ = options;
/// ```
pub struct RequestOptions<R> {
    on_reply: Arc<dyn Fn(R) + Send + Sync>,
    on_error: Option<ErrorHook>,
    max_listener_count: Option<usize>,
    terminate_on_error: bool,
    timeout: Option<Duration>,
}

impl<R> RequestOptions<R> {
    /// Options with `on_reply` called once per successful listener reply.
    pub fn new(on_reply: impl Fn(R) + Send + Sync + 'static) -> Self {
        Self {
            on_reply: Arc::new(on_reply),
            on_error: None,
            max_listener_count: None,
            terminate_on_error: false,
            timeout: None,
        }
    }

    /// Called with every listener error.
    pub fn on_error(
        mut self,
        f: impl Fn(&(dyn std::error::Error + Send + Sync)) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Reject listener registrations beyond `max`.
    pub fn max_listener_count(mut self, max: usize) -> Self {
        self.max_listener_count = Some(max);
        self
    }

    /// Abort an entry at its first listener error and reject its future.
    pub fn terminate_on_error(mut self, terminate: bool) -> Self {
        self.terminate_on_error = terminate;
        self
    }

    /// Reject a publish that has not drained within `timeout` of the call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<R> fmt::Debug for RequestOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("max_listener_count", &self.max_listener_count)
            .field("terminate_on_error", &self.terminate_on_error)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

struct Entry<Q> {
    id: u64,
    payload: EventPayload<Q>,
    done: oneshot::Sender<Result<(), RequestError>>,
}

struct Queue<Q, R> {
    version: Version,
    entries: VecDeque<Entry<Q>>,
    listeners: Vec<(u64, ReplyListener<Q, R>)>,
    next_entry: u64,
    next_listener: u64,
    drain_scheduled: bool,
}

struct RequestInner<Q, R> {
    name: String,
    options: RequestOptions<R>,
    queue: Mutex<Queue<Q, R>>,
}

/// A request/reply event. Every listener replies to every entry.
///
/// `Clone` shares the same event.
pub struct RequestEvent<Q, R> {
    inner: Arc<RequestInner<Q, R>>,
}

impl<Q, R> Clone for RequestEvent<Q, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q, R> fmt::Debug for RequestEvent<Q, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEvent")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl<Q, R> RequestEvent<Q, R>
where
    Q: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Create a request event named `name`.
    pub fn new(name: impl Into<String>, options: RequestOptions<R>) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                name: name.into(),
                options,
                queue: Mutex::new(Queue {
                    version: Version::default(),
                    entries: VecDeque::new(),
                    listeners: Vec::new(),
                    next_entry: 0,
                    next_listener: 0,
                    drain_scheduled: false,
                }),
            }),
        }
    }

    /// The event's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue `data` for every listener.
    ///
    /// The entry is queued (and its timeout clock started) when this is
    /// called, not when the returned future is first polled.
    ///
    /// # Errors
    ///
    /// The future resolves to:
    /// * [`RequestError::Timeout`] -- the configured timeout elapsed first.
    /// * [`RequestError::Terminated`] -- a listener failed and the event
    ///   terminates on error.
    /// * [`RequestError::Cancelled`] -- the queue was cleared.
    pub fn publish_request(
        &self,
        data: Q,
    ) -> impl Future<Output = Result<(), RequestError>> + Send + 'static {
        let (done, rx) = oneshot::channel();
        let id = {
            let mut queue = lock(&self.inner.queue);
            let id = queue.next_entry;
            queue.next_entry += 1;
            let payload = EventPayload {
                data: Arc::new(data),
                version: queue.version.bump(),
            };
            queue.entries.push_back(Entry { id, payload, done });
            id
        };
        self.schedule_drain();

        let name = self.inner.name.clone();
        let deadline = self
            .inner
            .options
            .timeout
            .map(|after| (tokio::time::Instant::now() + after, after));
        let weak: Weak<RequestInner<Q, R>> = Arc::downgrade(&self.inner);

        async move {
            let received = match deadline {
                None => rx.await,
                Some((at, after)) => match tokio::time::timeout_at(at, rx).await {
                    Ok(received) => received,
                    Err(_) => {
                        if let Some(inner) = weak.upgrade() {
                            lock(&inner.queue).entries.retain(|e| e.id != id);
                        }
                        tracing::debug!(event = %name, ?after, "request timed out");
                        return Err(RequestError::Timeout { event: name, after });
                    }
                },
            };
            received.unwrap_or(Err(RequestError::Cancelled { event: name }))
        }
    }

    /// Register a reply listener.
    ///
    /// Duplicate registrations of the same listener are kept; each one
    /// replies separately. Queued entries are drained on the next
    /// scheduler turn.
    ///
    /// # Errors
    ///
    /// Returns [`ListenError::MaxListeners`] when the configured cap is
    /// already reached.
    pub fn listen_and_reply(
        &self,
        f: impl Fn(&EventPayload<Q>) -> Result<R, BoxError> + Send + Sync + 'static,
    ) -> Result<Subscription, ListenError> {
        self.listen_and_reply_shared(Arc::new(f))
    }

    /// Register a shared reply listener. See [`listen_and_reply`](Self::listen_and_reply).
    pub fn listen_and_reply_shared(
        &self,
        listener: ReplyListener<Q, R>,
    ) -> Result<Subscription, ListenError> {
        let id = {
            let mut queue = lock(&self.inner.queue);
            if let Some(max) = self.inner.options.max_listener_count
                && queue.listeners.len() >= max
            {
                return Err(ListenError::MaxListeners {
                    event: self.inner.name.clone(),
                    max,
                });
            }
            let id = queue.next_listener;
            queue.next_listener += 1;
            queue.listeners.push((id, listener));
            id
        };
        self.schedule_drain();

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.queue).listeners.retain(|(i, _)| *i != id);
            }
        }))
    }

    /// Version of the most recent publish (`0` before the first).
    pub fn current_version(&self) -> Version {
        lock(&self.inner.queue).version.clone()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.inner.queue).listeners.len()
    }

    /// Number of entries waiting for a drain.
    pub fn pending(&self) -> usize {
        lock(&self.inner.queue).entries.len()
    }

    /// Detach every listener and cancel every queued entry.
    pub fn clear(&self) {
        let dropped = {
            let mut queue = lock(&self.inner.queue);
            queue.listeners.clear();
            std::mem::take(&mut queue.entries)
        };
        // Dropping the senders resolves the futures as `Cancelled`.
        drop(dropped);
    }

    /// The restricted view handed to callers outside the aggregate.
    pub fn listener(&self) -> RequestListener<Q, R> {
        RequestListener {
            event: self.clone(),
        }
    }

    fn schedule_drain(&self) {
        {
            let mut queue = lock(&self.inner.queue);
            if queue.drain_scheduled || queue.entries.is_empty() || queue.listeners.is_empty() {
                return;
            }
            queue.drain_scheduled = true;
        }
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { drain(&inner) });
            }
            Err(_) => drain(&inner),
        }
    }
}

/// Clears `drain_scheduled` if a drain unwinds, so later publishes can
/// schedule a fresh one.
struct DrainGuard<'a, Q, R>(&'a Mutex<Queue<Q, R>>);

impl<Q, R> Drop for DrainGuard<'_, Q, R> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(self.0).drain_scheduled = false;
        }
    }
}

fn drain<Q, R>(inner: &RequestInner<Q, R>) {
    let _guard = DrainGuard(&inner.queue);
    loop {
        let (entry, listeners) = {
            let mut queue = lock(&inner.queue);
            if queue.listeners.is_empty() {
                queue.drain_scheduled = false;
                return;
            }
            let Some(entry) = queue.entries.pop_front() else {
                queue.drain_scheduled = false;
                return;
            };
            let listeners: Vec<ReplyListener<Q, R>> =
                queue.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (entry, listeners)
        };
        let result = reply_all(inner, &entry.payload, &listeners);
        // The caller may have stopped waiting.
        let _ = entry.done.send(result);
    }
}

fn reply_all<Q, R>(
    inner: &RequestInner<Q, R>,
    payload: &EventPayload<Q>,
    listeners: &[ReplyListener<Q, R>],
) -> Result<(), RequestError> {
    let options = &inner.options;
    for listener in listeners {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(payload)))
            .unwrap_or_else(|panic| Err(panic_message(panic.as_ref()).into()));
        match outcome {
            Ok(reply) => (options.on_reply)(reply),
            Err(err) => {
                tracing::debug!(
                    event = %inner.name,
                    version = %payload.version,
                    error = %err,
                    "request listener failed"
                );
                if let Some(on_error) = &options.on_error {
                    on_error(err.as_ref());
                }
                if options.terminate_on_error {
                    return Err(RequestError::Terminated {
                        event: inner.name.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause");
    format!("listener panicked: {detail}")
}

/// Reply-only view of a [`RequestEvent`].
pub struct RequestListener<Q, R> {
    event: RequestEvent<Q, R>,
}

impl<Q, R> Clone for RequestListener<Q, R> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
        }
    }
}

impl<Q, R> fmt::Debug for RequestListener<Q, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestListener")
            .field(&self.event.inner.name)
            .finish()
    }
}

impl<Q, R> RequestListener<Q, R>
where
    Q: Send + Sync + 'static,
    R: Send + 'static,
{
    /// See [`RequestEvent::listen_and_reply`].
    pub fn listen_and_reply(
        &self,
        f: impl Fn(&EventPayload<Q>) -> Result<R, BoxError> + Send + Sync + 'static,
    ) -> Result<Subscription, ListenError> {
        self.event.listen_and_reply(f)
    }

    /// See [`RequestEvent::current_version`].
    pub fn current_version(&self) -> Version {
        self.event.current_version()
    }
}

pub(crate) struct RequestControl<Q, R>(pub(crate) RequestEvent<Q, R>);

impl<Q, R> EventControl for RequestControl<Q, R>
where
    Q: Send + Sync + 'static,
    R: Send + 'static,
{
    fn clear_listeners(&self) {
        self.0.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collecting<R: Send + 'static>() -> (RequestOptions<R>, Arc<Mutex<Vec<R>>>) {
        let replies = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&replies);
        (RequestOptions::new(move |reply| lock(&r).push(reply)), replies)
    }

    #[tokio::test]
    async fn backlog_drains_fifo_across_all_listeners() {
        let (options, replies) = collecting::<String>();
        let event = RequestEvent::<String, String>::new("greet", options);

        let andy = event.publish_request("Andy".into());
        let bob = event.publish_request("Bob".into());
        assert_eq!(event.pending(), 2);

        for tag in ["first", "second"] {
            event
                .listen_and_reply(move |p| Ok(format!("{tag} saw {}", p.data)))
                .unwrap();
        }

        andy.await.unwrap();
        bob.await.unwrap();

        assert_eq!(
            *lock(&replies),
            vec![
                "first saw Andy",
                "second saw Andy",
                "first saw Bob",
                "second saw Bob"
            ]
        );
        assert_eq!(event.pending(), 0);
    }

    #[tokio::test]
    async fn publish_with_listeners_resolves_after_every_reply() {
        let (options, replies) = collecting::<u32>();
        let event = RequestEvent::<u32, u32>::new("double", options);
        event.listen_and_reply(|p| Ok(*p.data * 2)).unwrap();
        event.listen_and_reply(|p| Ok(*p.data * 3)).unwrap();

        event.publish_request(5).await.unwrap();

        assert_eq!(*lock(&replies), vec![10, 15]);
        assert_eq!(event.current_version().as_str(), "1");
    }

    #[tokio::test]
    async fn duplicate_listener_replies_twice() {
        let (options, replies) = collecting::<u32>();
        let event = RequestEvent::<u32, u32>::new("echo", options);
        let listener: ReplyListener<u32, u32> = Arc::new(|p| Ok(*p.data));
        event.listen_and_reply_shared(Arc::clone(&listener)).unwrap();
        event.listen_and_reply_shared(listener).unwrap();

        event.publish_request(7).await.unwrap();

        assert_eq!(*lock(&replies), vec![7, 7]);
    }

    #[tokio::test]
    async fn terminate_on_error_skips_remaining_listeners() {
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let second_ran = Arc::new(AtomicUsize::new(0));
        let (options, replies) = collecting::<u32>();
        let options = options
            .terminate_on_error(true)
            .on_error(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            });
        let event = RequestEvent::<u32, u32>::new("check", options);

        event
            .listen_and_reply(|_| Err("rejected".into()))
            .unwrap();
        let s = Arc::clone(&second_ran);
        event
            .listen_and_reply(move |p| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(*p.data)
            })
            .unwrap();

        let result = event.publish_request(1).await;

        assert!(
            matches!(&result, Err(RequestError::Terminated { message, .. }) if message == "rejected"),
            "expected Terminated, got: {result:?}"
        );
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);
        assert!(lock(&replies).is_empty());
        assert_eq!(event.pending(), 0);
    }

    #[tokio::test]
    async fn errors_without_termination_still_resolve() {
        let errors = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let (options, replies) = collecting::<u32>();
        let event = RequestEvent::<u32, u32>::new(
            "check",
            options.on_error(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            }),
        );
        event
            .listen_and_reply(|_| Err("rejected".into()))
            .unwrap();
        event.listen_and_reply(|p| Ok(*p.data + 1)).unwrap();

        event.publish_request(1).await.unwrap();

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(*lock(&replies), vec![2]);
    }

    #[tokio::test]
    async fn max_listener_count_rejects_extra_registrations() {
        let (options, _) = collecting::<()>();
        let event = RequestEvent::<(), ()>::new("solo", options.max_listener_count(1));
        let sub = event.listen_and_reply(|_| Ok(())).unwrap();

        let err = event.listen_and_reply(|_| Ok(())).unwrap_err();
        assert_eq!(err.to_string(), "event `solo` accepts at most 1 listeners");

        sub.unsubscribe();
        assert!(event.listen_and_reply(|_| Ok(())).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_only_the_expired_publish() {
        let (options, replies) = collecting::<String>();
        let event = RequestEvent::<String, String>::new(
            "slow",
            options.timeout(Duration::from_millis(100)),
        );

        let first = tokio::spawn(event.publish_request("first".into()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = tokio::spawn(event.publish_request("second".into()));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let first = first.await.unwrap();
        assert!(
            matches!(first, Err(RequestError::Timeout { .. })),
            "expected Timeout, got: {first:?}"
        );
        assert_eq!(event.pending(), 1);

        event.listen_and_reply(|p| Ok(p.data.to_uppercase())).unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(*lock(&replies), vec!["SECOND"]);
    }

    #[tokio::test]
    async fn clear_cancels_queued_entries() {
        let (options, _) = collecting::<()>();
        let event = RequestEvent::<(), ()>::new("idle", options);
        let pending = event.publish_request(());
        event.clear();

        let result = pending.await;
        assert!(matches!(result, Err(RequestError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn unsubscribed_listener_stops_replying() {
        let (options, replies) = collecting::<u32>();
        let event = RequestEvent::<u32, u32>::new("echo", options);
        let sub = event.listen_and_reply(|p| Ok(*p.data)).unwrap();
        event.publish_request(1).await.unwrap();

        sub.unsubscribe();
        event.listen_and_reply(|p| Ok(*p.data * 10)).unwrap();
        event.publish_request(2).await.unwrap();

        assert_eq!(*lock(&replies), vec![1, 20]);
        assert_eq!(event.listener().current_version().as_str(), "2");
    }
    #[tokio::test]
    async fn panicking_listener_fails_its_entry_without_wedging_the_queue() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        let replies = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&replies);
        let options = RequestOptions::new(move |reply: u32| lock(&r).push(reply))
            .on_error(move |err| lock(&e).push(err.to_string()))
            .terminate_on_error(true);
        let event = RequestEvent::<u32, u32>::new("fragile", options);

        let bad = event
            .listen_and_reply(|_| -> Result<u32, BoxError> { panic!("boom") })
            .unwrap();
        let first = event.publish_request(1).await;
        assert!(matches!(first, Err(RequestError::Terminated { .. })));
        assert_eq!(*lock(&errors), vec!["listener panicked: boom"]);

        bad.unsubscribe();
        event.listen_and_reply(|p| Ok(*p.data * 2)).unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), event.publish_request(2)).await;
        assert!(matches!(second, Ok(Ok(()))));
        assert_eq!(*lock(&replies), vec![4]);
        assert_eq!(event.pending(), 0);
    }
}
