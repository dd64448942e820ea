//! Plain (non-reactive) snapshots of an aggregate's declared states.
//!
//! Every aggregate keeps a snapshot record that its state watchers refresh
//! on each change. Shared aggregates answer peers' state requests from this
//! record and overwrite their cells when a peer's snapshot arrives.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::aggregate::Declarations;
use crate::reactive::lock;
use crate::version::Version;

/// A point-in-time copy of every declared state, keyed by state name.
///
/// `version` advances each time any state changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// JSON form of each state value.
    pub states: BTreeMap<String, Value>,
    /// Snapshot version at capture time.
    pub version: Version,
}

impl StateSnapshot {
    /// Deserialize the state named `name`.
    ///
    /// Returns `None` if the state is absent or does not deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        serde_json::from_value(self.states.get(name)?.clone()).ok()
    }

    /// Capture every state in `decls`. States that fail to serialize are
    /// logged and left out.
    pub(crate) fn capture(decls: &Declarations, version: Version) -> Self {
        let mut states = BTreeMap::new();
        for (name, slot) in &decls.states {
            match slot.to_json() {
                Ok(value) => {
                    states.insert(name.clone(), value);
                }
                Err(e) => tracing::warn!(state = %name, error = %e, "state is not serializable"),
            }
        }
        Self { states, version }
    }

    /// Overwrite the cells in `decls` with this snapshot's values.
    ///
    /// Names this aggregate does not declare, and values of the wrong
    /// shape, are skipped with a warning.
    ///
    /// # Returns
    ///
    /// The number of states applied.
    pub(crate) fn apply_to(&self, agg: &str, decls: &Declarations) -> usize {
        let mut applied = 0;
        for (name, value) in &self.states {
            let Some(slot) = decls.states.get(name) else {
                tracing::warn!(agg, state = %name, "snapshot names an undeclared state; skipped");
                continue;
            };
            match slot.restore(value.clone()) {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!(agg, state = %name, error = %e, "snapshot value rejected; skipped")
                }
            }
        }
        applied
    }
}

/// The live snapshot record of one aggregate.
///
/// `Clone` shares the same record.
#[derive(Clone, Default)]
pub(crate) struct SnapshotRecord {
    inner: Arc<Mutex<StateSnapshot>>,
}

impl SnapshotRecord {
    pub(crate) fn new(initial: StateSnapshot) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    /// Store the new value of `name` and advance the version.
    pub(crate) fn record(&self, name: &str, value: Value) {
        let mut snapshot = lock(&self.inner);
        snapshot.states.insert(name.to_owned(), value);
        snapshot.version.bump();
    }

    pub(crate) fn current(&self) -> StateSnapshot {
        lock(&self.inner).clone()
    }

    pub(crate) fn set_version(&self, version: Version) {
        lock(&self.inner).version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterCommand};
    use crate::aggregate::{Aggregate, SetupContext};
    use serde_json::json;

    fn counter() -> (Counter, SetupContext) {
        let mut ctx = SetupContext::new(Counter::NAME, None);
        let counter = Counter::setup(&mut ctx).unwrap();
        (counter, ctx)
    }

    #[test]
    fn capture_reads_every_state() {
        let (counter, ctx) = counter();
        counter.handle(CounterCommand::Add(3)).unwrap();

        let snap = StateSnapshot::capture(&ctx.decls, Version::from(4));

        assert_eq!(snap.states["value"], json!(3));
        assert_eq!(snap.get::<u64>("value"), Some(3));
        assert_eq!(snap.get::<String>("value"), None);
        assert_eq!(snap.get::<u64>("missing"), None);
        assert_eq!(snap.version.as_str(), "4");
    }

    #[test]
    fn apply_skips_unknown_and_mistyped_states() {
        let (counter, ctx) = counter();
        let mut states = BTreeMap::new();
        states.insert("value".to_owned(), json!(11));
        states.insert("ghost".to_owned(), json!(true));
        let snap = StateSnapshot {
            states,
            version: Version::from(2),
        };

        assert_eq!(snap.apply_to("counter", &ctx.decls), 1);
        assert_eq!(counter.value.get(), 11);

        let mut bad = snap.clone();
        bad.states.insert("value".to_owned(), json!("eleven"));
        assert_eq!(bad.apply_to("counter", &ctx.decls), 0);
        assert_eq!(counter.value.get(), 11);
    }

    #[test]
    fn record_tracks_changes_and_versions() {
        let record = SnapshotRecord::default();
        record.record("value", json!(1));
        record.record("value", json!(2));

        let snap = record.current();
        assert_eq!(snap.states["value"], json!(2));
        assert_eq!(snap.version.as_str(), "2");

        record.set_version(Version::from(40));
        assert_eq!(record.current().version.as_str(), "40");
    }

    #[test]
    fn serializes_with_plain_json_values() {
        let mut snap = StateSnapshot::default();
        snap.states.insert("items".to_owned(), json!(["a", "b"]));
        let text = serde_json::to_string(&snap).unwrap();
        assert_eq!(text, r#"{"states":{"items":["a","b"]},"version":"0"}"#);
    }
}
