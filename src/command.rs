//! Command encoding for peer realms.
//!
//! Commands use adjacently tagged serde (`"type"` + `"data"`). On the wire
//! the tag becomes the command name and the content becomes its arguments,
//! so a peer can rebuild the typed command and run the same handler.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::SyncError;

/// Split a command into its name and arguments.
///
/// Fieldless variants have `Value::Null` arguments.
///
/// # Arguments
///
/// * `cmd` - A command whose type uses `#[serde(tag = "type", content = "data")]`.
///
/// # Returns
///
/// `(command_name, args)`.
///
/// # Errors
///
/// Returns [`SyncError::Encode`] if the command cannot be serialized, or
/// [`SyncError::MalformedCommand`] if it does not serialize to an object
/// with a string `"type"` field.
///
/// # Examples
///
/// ```
/// use aggsync::encode_command;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// #[serde(tag = "type", content = "data")]
/// enum CartCommand {
///     Clear,
///     AddItem { sku: String, qty: u32 },
/// }
///
/// let (name, args) = encode_command(&CartCommand::AddItem { sku: "A1".into(), qty: 2 }).unwrap();
/// assert_eq!(name, "AddItem");
/// assert_eq!(args, serde_json::json!({"sku": "A1", "qty": 2}));
///
/// let (name, args) = encode_command(&CartCommand::Clear).unwrap();
/// assert_eq!(name, "Clear");
/// assert!(args.is_null());
/// ```
pub fn encode_command<C: Serialize>(cmd: &C) -> Result<(String, Value), SyncError> {
    let value = serde_json::to_value(cmd)?;
    let Value::Object(mut obj) = value else {
        return Err(SyncError::MalformedCommand(
            "command must serialize to a tagged object".to_owned(),
        ));
    };
    let Some(Value::String(name)) = obj.remove("type") else {
        return Err(SyncError::MalformedCommand(
            "command must have a string `type` field".to_owned(),
        ));
    };
    // Data may be absent for fieldless variants.
    let args = obj.remove("data").unwrap_or(Value::Null);
    Ok((name, args))
}

/// Rebuild a typed command from its name and arguments.
///
/// # Errors
///
/// Returns [`SyncError::MalformedCommand`] if no variant named `name`
/// accepts `args`.
pub fn decode_command<C: DeserializeOwned>(name: &str, args: Value) -> Result<C, SyncError> {
    let tagged = if args.is_null() {
        // Fieldless variant: just `{"type": "VariantName"}`
        serde_json::json!({ "type": name })
    } else {
        serde_json::json!({ "type": name, "data": args })
    };
    serde_json::from_value(tagged)
        .map_err(|e| SyncError::MalformedCommand(format!("`{name}`: {e}")))
}
