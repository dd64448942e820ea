//! Crate-level error types for aggregate lifecycle, events, plugins, and sync.

use std::time::Duration;

/// Boxed error returned by user-supplied listeners, tasks, and setup code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g., "insufficient funds").
///
/// # Type Parameters
///
/// * `E` - Domain error type, must implement `Error + Send + Sync + 'static`
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    ///
    /// Wraps the domain-specific error returned from the aggregate's
    /// command handler, forwarding its `Display` and `Error` impls.
    #[error(transparent)]
    Domain(E),

    /// The aggregate instance was destroyed.
    ///
    /// A destroyed multi-instance aggregate no longer accepts commands;
    /// its listeners and watchers have already been detached.
    #[error("aggregate `{agg}` has been destroyed")]
    Destroyed {
        /// Aggregate type name.
        agg: &'static str,
    },
}

/// Error raised by aggregate construction and lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum AggError {
    /// A before-initialize task was registered after the aggregate left
    /// the `Created` state.
    #[error("Agg already initialized")]
    AlreadyInitialized,

    /// A before-initialize task failed, so the aggregate never reached
    /// the `Initialized` state.
    #[error("aggregate `{agg}` failed to initialize: {message}")]
    InitializationFailed {
        /// Aggregate type name.
        agg: String,
        /// Message of the original task error.
        message: String,
    },

    /// A state or event name was declared twice with different types.
    #[error("`{name}` is already declared on aggregate `{agg}` with a different type")]
    TypeMismatch {
        /// Aggregate type name.
        agg: String,
        /// The conflicting state or event name.
        name: String,
    },

    /// `destroy` was called on a singleton aggregate.
    #[error("aggregate `{agg}` is not multi-instance and cannot be destroyed")]
    NotMultiInstance {
        /// Aggregate type name.
        agg: String,
    },

    /// Construction happened outside a tokio runtime, so deferred
    /// initialization could not be scheduled.
    #[error("aggregate construction requires a running tokio runtime")]
    NoRuntime,

    /// The user initializer failed.
    #[error("aggregate setup failed: {0}")]
    Setup(#[source] BoxError),

    /// Registering the aggregate with a plugin registry failed.
    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Error returned when registering a listener fails.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    /// The event's `max_listener_count` is already reached.
    #[error("event `{event}` accepts at most {max} listeners")]
    MaxListeners {
        /// Event name.
        event: String,
        /// Configured cap.
        max: usize,
    },
}

/// Error returned from a `publish_request` future.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The configured timeout elapsed before every listener replied.
    #[error("request on event `{event}` timed out after {after:?}")]
    Timeout {
        /// Event name.
        event: String,
        /// Configured timeout.
        after: Duration,
    },

    /// A listener failed and the event terminates on error.
    #[error("request on event `{event}` terminated by listener error: {message}")]
    Terminated {
        /// Event name.
        event: String,
        /// Message of the listener error.
        message: String,
    },

    /// The pending request was discarded (event cleared or aggregate destroyed).
    #[error("request on event `{event}` was cancelled")]
    Cancelled {
        /// Event name.
        event: String,
    },
}

/// Error raised by misuse of the plugin registry.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The aggregate already left the `Created` state.
    #[error("Agg must register before initialized")]
    RegisterAfterInitialized,

    /// The aggregate instance is already registered.
    #[error("aggregate `{agg}` is already registered")]
    AlreadyRegistered {
        /// Aggregate type name.
        agg: String,
    },

    /// A setup plugin with this name is already registered.
    #[error("setup plugin `{name}` is already registered")]
    DuplicateSetupPlugin {
        /// Plugin name.
        name: String,
    },

    /// Setup plugins cannot be unregistered once mounted.
    #[error("setup plugin `{name}` cannot be unregistered")]
    SetupPluginImmutable {
        /// Plugin name.
        name: String,
    },

    /// No plugin with this name is registered.
    #[error("plugin `{name}` is not registered")]
    UnknownPlugin {
        /// Plugin name.
        name: String,
    },
}

/// Error raised while encoding or decoding sync traffic.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// JSON encoding or decoding failed.
    #[error("sync message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// A command did not serialize to an adjacently tagged object.
    #[error("malformed command: {0}")]
    MalformedCommand(String),
}

/// Error returned when a string is not a non-negative decimal integer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version `{0}`: expected a non-negative decimal integer")]
pub struct ParseVersionError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal domain error for testing `ExecuteError<E>`.
    #[derive(Debug, thiserror::Error)]
    #[error("test domain error")]
    struct TestDomainError;

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        assert_eq!(err.to_string(), "test domain error");
    }

    #[test]
    fn execute_error_destroyed_names_aggregate() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Destroyed { agg: "counter" };
        assert_eq!(err.to_string(), "aggregate `counter` has been destroyed");
    }

    #[test]
    fn lifecycle_messages_match_contract() {
        assert_eq!(AggError::AlreadyInitialized.to_string(), "Agg already initialized");
        assert_eq!(
            PluginError::RegisterAfterInitialized.to_string(),
            "Agg must register before initialized"
        );
    }

    #[test]
    fn initialization_failure_carries_name_and_message() {
        let err = AggError::InitializationFailed {
            agg: "cart".into(),
            message: "db offline".into(),
        };
        let text = err.to_string();
        assert!(text.contains("cart"));
        assert!(text.contains("db offline"));
    }

    #[test]
    fn setup_error_keeps_source() {
        let inner: BoxError = "bad config".into();
        let err = AggError::Setup(inner);
        let source = std::error::Error::source(&err).expect("source should be kept");
        assert_eq!(source.to_string(), "bad config");
    }

    #[test]
    fn sync_error_from_serde() {
        let serde_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = SyncError::from(serde_err);
        assert!(err.to_string().starts_with("sync message encoding failed"));
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross task
    // boundaries, which is required for use with `tokio::spawn`.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ExecuteError<TestDomainError>>();
            assert_send_sync::<AggError>();
            assert_send_sync::<RequestError>();
            assert_send_sync::<PluginError>();
            assert_send_sync::<SyncError>();
        }
    };
}
