//! Identity resolution — principal to opaque descriptor.

use std::sync::Arc;

use serde_json::Value;

use crate::types::UserDescriptor;

/// Authenticated principal as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub name: String,
}

/// Pluggable principal → descriptor mapping, chosen at state
/// construction. Must be deterministic for a given principal within one
/// session's lifetime; the protocol treats its output as opaque.
pub type IdentityResolver = Arc<dyn Fn(&Principal) -> UserDescriptor + Send + Sync>;

pub fn default_resolver() -> IdentityResolver {
    Arc::new(default_descriptor)
}

/// Default mapping: `{"id": ..., "display_name": ...}`.
pub fn default_descriptor(principal: &Principal) -> UserDescriptor {
    let mut descriptor = UserDescriptor::new();
    descriptor.insert("id".into(), Value::String(principal.id.clone()));
    descriptor.insert(
        "display_name".into(),
        Value::String(principal.name.clone()),
    );
    descriptor
}
