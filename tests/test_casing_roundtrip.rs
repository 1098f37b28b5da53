mod common;

use proptest::prelude::*;
use sandbot::sync::casing::{keys_to_host_casing, keys_to_sandbox_casing};

proptest! {
    #![proptest_config(common::proptest_config())]

    #[test]
    fn sandbox_keys_survive_host_roundtrip(doc in common::json_with_keys(common::camel_key())) {
        let host = keys_to_host_casing(&doc);
        prop_assert_eq!(keys_to_sandbox_casing(&host), doc);
    }

    #[test]
    fn host_keys_survive_sandbox_roundtrip(doc in common::json_with_keys(common::snake_key())) {
        let sandbox = keys_to_sandbox_casing(&doc);
        prop_assert_eq!(keys_to_host_casing(&sandbox), doc);
    }

    #[test]
    fn host_casing_has_no_uppercase_keys(doc in common::json_with_keys(common::camel_key())) {
        fn check(v: &serde_json::Value) -> bool {
            match v {
                serde_json::Value::Object(m) => m
                    .iter()
                    .all(|(k, v)| !k.chars().any(char::is_uppercase) && check(v)),
                serde_json::Value::Array(items) => items.iter().all(check),
                _ => true,
            }
        }
        prop_assert!(check(&keys_to_host_casing(&doc)));
    }
}
