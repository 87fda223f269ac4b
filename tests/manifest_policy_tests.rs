#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests for the Snapper producer.
//!
//! These tests parse `Cargo.toml` and the fuzz manifest and check that the
//! lint policy, feature wiring and declared targets stay consistent. If one
//! fails, the manifests have drifted from the agreed-upon setup.

use std::path::PathBuf;

use toml::{Table, Value};

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Parses a manifest relative to the project root.
fn read_manifest(relative_path: &str) -> Table {
    let path = project_root().join(relative_path);
    let contents = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read '{}': {e}", path.display()));
    contents
        .parse::<Table>()
        .unwrap_or_else(|e| panic!("'{}' is not valid TOML: {e}", path.display()))
}

fn table<'a>(parent: &'a Table, key: &str) -> &'a Table {
    parent
        .get(key)
        .and_then(Value::as_table)
        .unwrap_or_else(|| panic!("missing [{key}] table"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: lint_policy
// ─────────────────────────────────────────────────────────────────────────────

mod lint_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn cargo_toml_denies_all_panic_prone_lints() {
        let cargo = read_manifest("Cargo.toml");
        let clippy = table(table(&cargo, "lints"), "clippy");

        for lint in REQUIRED_DENY_LINTS {
            assert_eq!(
                clippy.get(*lint).and_then(Value::as_str),
                Some("deny"),
                "[lints.clippy] must set `{lint} = \"deny\"` to keep library \
                 code panic-free."
            );
        }
    }

    #[test]
    fn msrv_is_declared() {
        let cargo = read_manifest("Cargo.toml");
        let msrv = table(&cargo, "package")
            .get("rust-version")
            .and_then(Value::as_str)
            .expect("package.rust-version must be set");
        assert_eq!(msrv.split('.').count(), 3, "rust-version must be x.y.z");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: feature_policy
// ─────────────────────────────────────────────────────────────────────────────

mod feature_policy {
    use super::*;

    #[test]
    fn tcp_transport_is_the_default_feature() {
        let cargo = read_manifest("Cargo.toml");
        let features = table(&cargo, "features");
        let default = features["default"].as_array().unwrap();
        assert!(default.iter().any(|f| f.as_str() == Some("transport-tcp")));
    }

    #[test]
    fn optional_dependencies_are_feature_gated() {
        let cargo = read_manifest("Cargo.toml");
        let deps = table(&cargo, "dependencies");
        let features = table(&cargo, "features");

        for (name, spec) in deps {
            let optional = spec
                .as_table()
                .and_then(|t| t.get("optional"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !optional {
                continue;
            }
            let needle = format!("dep:{name}");
            let enabled = features.values().any(|list| {
                list.as_array()
                    .is_some_and(|items| items.iter().any(|i| i.as_str() == Some(&needle)))
            });
            assert!(enabled, "optional dependency `{name}` is not enabled by any feature");
        }
    }

    #[test]
    fn declared_demos_and_tests_exist() {
        let cargo = read_manifest("Cargo.toml");
        for kind in ["example", "test"] {
            let Some(targets) = cargo.get(kind).and_then(Value::as_array) else {
                continue;
            };
            for target in targets {
                let path = target["path"].as_str().unwrap();
                assert!(
                    project_root().join(path).is_file(),
                    "[[{kind}]] path '{path}' does not exist"
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: fuzz_policy
// ─────────────────────────────────────────────────────────────────────────────

mod fuzz_policy {
    use super::*;

    #[test]
    fn fuzz_crate_depends_on_this_crate_by_path() {
        let fuzz = read_manifest("fuzz/Cargo.toml");
        let deps = table(&fuzz, "dependencies");
        let this = deps["snapper-producer"].as_table().unwrap();
        assert_eq!(this["path"].as_str(), Some(".."));
    }

    #[test]
    fn fuzz_targets_exist() {
        let fuzz = read_manifest("fuzz/Cargo.toml");
        let bins = fuzz["bin"].as_array().unwrap();
        assert!(!bins.is_empty());
        for bin in bins {
            let path = bin["path"].as_str().unwrap();
            assert!(
                project_root().join("fuzz").join(path).is_file(),
                "fuzz target '{path}' does not exist"
            );
        }
    }
}
