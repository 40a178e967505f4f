use cachebox_core::{ArtifactKey, FingerprintBuilder};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn gen_segment() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-][A-Za-z0-9._-]{0,15}".prop_filter("relative segment", |s| s != "." && s != "..")
}

fn gen_key() -> impl Strategy<Value = String> {
    prop::collection::vec(gen_segment(), 1..5).prop_map(|segments| segments.join("/"))
}

fn fingerprint(inputs: &BTreeMap<String, String>) -> FingerprintBuilder {
    inputs
        .iter()
        .fold(ArtifactKey::fingerprint(), |builder, (name, value)| {
            builder.input(name.clone(), value.clone())
        })
}

proptest! {
    #[test]
    fn test_valid_keys_round_trip(raw in gen_key()) {
        let key = ArtifactKey::new(raw.clone()).unwrap();
        prop_assert_eq!(key.as_str(), raw.as_str());

        let parsed: ArtifactKey = key.to_string().parse().unwrap();
        prop_assert_eq!(&parsed, &key);
        prop_assert_eq!(key.segments().count(), raw.split('/').count());
    }

    #[test]
    fn test_keys_with_forbidden_characters_rejected(
        prefix in gen_segment(),
        bad in "[ \\\\:*?\"<>|%#\n]",
    ) {
        let raw = format!("{}{}", prefix, bad);
        prop_assert!(ArtifactKey::new(raw).is_err());
    }

    #[test]
    fn test_relative_segments_rejected(prefix in gen_key(), rel in prop::sample::select(vec!["", ".", ".."])) {
        let raw = format!("{}/{}", prefix, rel);
        prop_assert!(ArtifactKey::new(raw).is_err());
    }

    #[test]
    fn test_fingerprint_is_deterministic(
        inputs in prop::collection::btree_map("[a-z]{1,8}", "[ -~]{0,16}", 1..6),
    ) {
        let first = fingerprint(&inputs).build().unwrap();
        let second = inputs
            .iter()
            .rev()
            .fold(ArtifactKey::fingerprint(), |builder, (name, value)| {
                builder.input(name.clone(), value.clone())
            })
            .build()
            .unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn test_fingerprint_changes_with_inputs(
        inputs in prop::collection::btree_map("[a-z]{1,8}", "[a-z]{0,16}", 1..6),
        extra in "[A-Z]{1,8}",
    ) {
        let base = fingerprint(&inputs).build().unwrap();
        let changed = fingerprint(&inputs).env_var(extra, "1").build().unwrap();
        prop_assert_ne!(base, changed);
    }
}

#[test]
fn test_namespaced_fingerprint() {
    let key = ArtifactKey::fingerprint()
        .namespace("ci")
        .input("command", "cargo build --release")
        .build()
        .unwrap();

    let mut segments = key.segments();
    assert_eq!(segments.next(), Some("ci"));
    assert_eq!(segments.next().map(str::len), Some(64));
    assert!(ArtifactKey::fingerprint().build().is_err());
}
