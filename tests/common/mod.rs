//! Shared helpers for integration tests: proptest presets and a registry
//! over the in-memory local backend.
#![allow(dead_code)]

use proptest::prelude::*;
use std::sync::Arc;

use sandbot::bus::EventBus;
use sandbot::sandbox::{LocalBackend, SandboxRegistry, SandboxStatus};

/// Standard proptest configuration.
pub fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    }
}

/// camelCase key: lowercase head, then capitalized segments.
pub fn camel_key() -> impl Strategy<Value = String> + Clone {
    "[a-z][a-z0-9]{0,6}([A-Z][a-z0-9]{0,6}){0,3}"
}

/// snake_case key whose segments start with a letter.
pub fn snake_key() -> impl Strategy<Value = String> + Clone {
    "[a-z][a-z0-9]{0,6}(_[a-z][a-z0-9]{0,6}){0,3}"
}

/// Arbitrary nested JSON whose object keys come from `key`.
pub fn json_with_keys<S>(key: S) -> impl Strategy<Value = serde_json::Value>
where
    S: Strategy<Value = String> + Clone + 'static,
{
    let leaf = prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        "[a-zA-Z0-9 _-]{0,12}".prop_map(serde_json::Value::from),
    ];
    leaf.prop_recursive(4, 48, 6, move |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
            prop::collection::btree_map(key.clone(), inner, 0..5)
                .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Registry over a local backend holding the given sandboxes.
pub fn local_registry(sandboxes: &[(&str, SandboxStatus)]) -> (Arc<SandboxRegistry>, Arc<EventBus>) {
    let backend = LocalBackend::new();
    for (name, status) in sandboxes {
        backend.add_sandbox(name, *status);
    }
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(SandboxRegistry::new(Arc::new(backend), Arc::clone(&bus)));
    (registry, bus)
}

/// A port range starting at a port the OS just handed out.
pub fn free_range(width: u16) -> (u16, u16) {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let start = port.min(u16::MAX - width);
    (start, start + width)
}
