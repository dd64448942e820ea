//! Two "tabs" sharing a todo list over an in-process channel hub.
//!
//! Each tab builds its own aggregate; commands executed in one tab are
//! replayed in the other, and a tab opened later catches up through a
//! state request.
//!
//! Run with: `cargo run --example tabs`
//!
//! Set `RUST_LOG=aggsync=debug` to watch the sync traffic.

use std::time::Duration;

use aggsync::{Agg, AggError, Aggregate, BroadcastEvent, ChannelHub, Plugin};
use aggsync::{PluginRegistry, SetupContext, State};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Todo aggregate
// ---------------------------------------------------------------------------

/// A shared list of todo items.
struct Todos {
    items: State<Vec<String>>,
    completed: BroadcastEvent<String>,
}

/// Commands accepted by [`Todos`].
///
/// Adjacently tagged so the command name and arguments travel separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum TodoCommand {
    Add(String),
    Complete(String),
}

#[derive(Debug, thiserror::Error)]
enum TodoError {
    #[error("no todo named `{0}`")]
    Unknown(String),
}

impl Aggregate for Todos {
    const NAME: &'static str = "todos";
    type Command = TodoCommand;
    type Error = TodoError;

    fn setup(ctx: &mut SetupContext) -> Result<Self, AggError> {
        let items = ctx.state("items", Vec::new())?;
        let completed = ctx.broadcast_event("completed")?;
        ctx.on_before_initialize(async {
            // Stands in for loading persisted items.
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(())
        })?;
        Ok(Todos { items, completed })
    }

    fn handle(&self, cmd: TodoCommand) -> Result<(), TodoError> {
        match cmd {
            TodoCommand::Add(title) => self.items.update(|items| items.push(title)),
            TodoCommand::Complete(title) => {
                if !self.items.with(|items| items.contains(&title)) {
                    return Err(TodoError::Unknown(title));
                }
                self.items.update(|items| items.retain(|t| *t != title));
                self.completed.publish(title);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_tab(
    hub: &ChannelHub,
    registry: &PluginRegistry,
    label: &'static str,
) -> Result<Agg<Todos>, AggError> {
    let tab = Agg::<Todos>::builder()
        .shared(hub, "todos")
        .plugins(registry)
        .build()?;
    if let Some(completed) = tab.event::<String>("completed") {
        completed.listen(move |payload| {
            println!("[{label}] completed {:?} (v{})", payload.data, payload.version);
        });
    }
    Ok(tab)
}

fn items(tab: &Agg<Todos>) -> Vec<String> {
    tab.state::<Vec<String>>("items")
        .map(|s| s.get())
        .unwrap_or_default()
}

/// Give the tabs' sync loops a moment to exchange messages.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let hub = ChannelHub::new();
    let registry = PluginRegistry::new();
    registry.register_plugin(Plugin::setup("audit", |agg| {
        println!("audit plugin mounted on {} ({})", agg.name(), agg.physical_id());
        Ok(())
    }))?;

    // --- first tab ---
    let left = open_tab(&hub, &registry, "left")?;
    left.until_initialized().await?;
    settle().await;

    left.execute(TodoCommand::Add("write docs".into()))?;
    left.execute(TodoCommand::Add("ship release".into()))?;

    // --- second tab joins late and catches up ---
    let right = open_tab(&hub, &registry, "right")?;
    right.until_initialized().await?;
    settle().await;
    println!("right after joining: {:?}", items(&right));
    assert_eq!(items(&left), items(&right));

    // --- commands flow both ways ---
    right.execute(TodoCommand::Complete("write docs".into()))?;
    left.execute(TodoCommand::Add("celebrate".into()))?;
    settle().await;

    println!("left  = {:?}", items(&left));
    println!("right = {:?}", items(&right));
    assert_eq!(items(&left), items(&right));

    if let Err(e) = left.execute(TodoCommand::Complete("nap".into())) {
        println!("rejected locally: {e}");
    }

    println!("all assertions passed");
    Ok(())
}
