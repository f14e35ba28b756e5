//! Every member crate inherits the workspace version.

use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .unwrap()
        .to_path_buf()
}

fn manifest(dir: &Path) -> toml::Value {
    let raw = std::fs::read_to_string(dir.join("Cargo.toml")).unwrap();
    raw.parse().unwrap()
}

/// `"workspace"` when the crate uses `version.workspace = true`, otherwise
/// the literal version string.
fn crate_version(manifest_dir: &Path) -> String {
    let doc = manifest(manifest_dir);
    let version = doc
        .get("package")
        .and_then(|pkg| pkg.get("version"))
        .unwrap_or_else(|| panic!("no package.version in {}", manifest_dir.display()));
    if version
        .as_table()
        .and_then(|t| t.get("workspace"))
        .and_then(|v| v.as_bool())
        == Some(true)
    {
        return "workspace".to_string();
    }
    version.as_str().unwrap().to_string()
}

#[test]
fn all_crates_use_workspace_version() {
    let root = workspace_root();
    let members = manifest(&root)["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert!(members.contains(&"crates/waymark-core".to_string()));
    assert!(members.contains(&"crates/waymark-cli".to_string()));

    for krate in &members {
        let version = crate_version(&root.join(krate));
        assert_eq!(
            version, "workspace",
            "{krate} should use version.workspace = true, got {version:?}"
        );
    }
}

#[test]
fn workspace_version_matches_cargo_pkg() {
    let doc = manifest(&workspace_root());
    let ws_version = doc["workspace"]["package"]["version"].as_str().unwrap();
    assert_eq!(ws_version, env!("CARGO_PKG_VERSION"));
    assert_eq!(waymark_core::VERSION, ws_version);
}

#[test]
fn internal_dependency_pins_workspace_version() {
    let doc = manifest(&workspace_root());
    let ws_version = doc["workspace"]["package"]["version"].as_str().unwrap();
    let pinned = doc["workspace"]["dependencies"]["waymark-core"]["version"]
        .as_str()
        .unwrap();
    assert_eq!(pinned, ws_version);
}
