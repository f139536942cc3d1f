use serde_json::Value;
use sha2::{Digest, Sha256};
use shared::domain::WidgetId;

/// Sentinel hashed in place of a user key so a keyless widget can never
/// collide with one keyed by a plain string.
const NO_KEY_SENTINEL: &[u8] = b"\x00none";

/// Stable identity for one widget invocation: a SHA-256 hex digest over the
/// widget type, its declared arguments, and the optional user key.
///
/// `declared_args` must already exclude the current value/default and any
/// volatile runtime-only fields; that is the marshalling layer's contract.
/// Re-declaring the same visible configuration therefore always yields the
/// same id across runs and across processes, which is what lets the state
/// store find a widget's prior value. Declaring two different widgets with
/// identical configuration and no key is a declaration error, reported when
/// the second one materializes.
pub fn compute_widget_id(
    widget_type: &str,
    declared_args: &Value,
    user_key: Option<&str>,
) -> WidgetId {
    let mut hasher = Sha256::new();
    hasher.update(widget_type.as_bytes());
    hasher.update(b"\x1f");
    // serde_json::Value maps are ordered by key, so serialization is
    // canonical regardless of argument insertion order.
    hasher.update(declared_args.to_string().as_bytes());
    hasher.update(b"\x1f");
    match user_key {
        Some(key) => hasher.update(key.as_bytes()),
        None => hasher.update(NO_KEY_SENTINEL),
    }
    WidgetId(hex::encode(hasher.finalize()))
}
