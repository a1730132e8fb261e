//! Plugin manifest discovery.
//!
//! Each configured directory is scanned one level deep: a subdirectory
//! holding a manifest file is a plugin, and a manifest directly in the
//! scanned directory is a plugin rooted there. A bad manifest is reported
//! and skipped; it never hides the others.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginDescriptor;

/// Default manifest file name.
pub const MANIFEST_FILE_NAME: &str = "plugin.toml";

/// Manifests found by [`discover_manifests`].
#[derive(Debug, Default)]
pub struct Discovery {
    /// Parsed descriptors, sorted by plugin name.
    pub descriptors: Vec<PluginDescriptor>,
    /// Manifests that could not be read or parsed.
    pub failures: Vec<PluginError>,
}

/// Scan `dirs` for plugin manifests named `manifest_file`.
///
/// Missing directories are skipped silently.
#[must_use]
pub fn discover_manifests(dirs: &[PathBuf], manifest_file: &str) -> Discovery {
    let mut discovery = Discovery::default();

    for dir in dirs {
        if !dir.is_dir() {
            debug!(path = %dir.display(), "plugin directory does not exist, skipping");
            continue;
        }
        info!(path = %dir.display(), "discovering plugins");
        match manifest_paths(dir, manifest_file) {
            Ok(paths) => {
                for path in paths {
                    match PluginDescriptor::load(&path) {
                        Ok(desc) => {
                            debug!(path = %path.display(), plugin = %desc.name, "loaded plugin manifest");
                            discovery.descriptors.push(desc);
                        },
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "failed to load plugin manifest");
                            discovery.failures.push(e);
                        },
                    }
                }
            },
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "failed to scan plugin directory");
                discovery.failures.push(e);
            },
        }
    }

    discovery.descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    info!(
        count = discovery.descriptors.len(),
        failed = discovery.failures.len(),
        "discovered plugin manifests"
    );
    discovery
}

/// Manifest files directly in `dir` or one level below, sorted by path.
fn manifest_paths(dir: &Path, manifest_file: &str) -> PluginResult<Vec<PathBuf>> {
    let mut paths = Vec::new();

    let direct = dir.join(manifest_file);
    if direct.is_file() {
        paths.push(direct);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            let candidate = path.join(manifest_file);
            if candidate.is_file() {
                paths.push(candidate);
            }
        }
    }

    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plugin(root: &Path, dir: &str, name: &str) {
        let plugin_dir = root.join(dir);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join(MANIFEST_FILE_NAME),
            format!(
                "name = \"{name}\"\nversion = \"1.0.0\"\n[[provides]]\ntype = \"declarative\"\npath = \"features\"\n"
            ),
        )
        .unwrap();
    }

    #[test]
    fn test_discovers_subdirectories_sorted_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), "one", "zeta");
        write_plugin(tmp.path(), "two", "alpha");

        let found = discover_manifests(&[tmp.path().to_path_buf()], MANIFEST_FILE_NAME);
        assert!(found.failures.is_empty());
        let names: Vec<_> = found.descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(found.descriptors[0].root, tmp.path().join("two"));
    }

    #[test]
    fn test_manifest_in_scanned_directory() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), ".", "solo");
        let found = discover_manifests(&[tmp.path().to_path_buf()], MANIFEST_FILE_NAME);
        assert_eq!(found.descriptors.len(), 1);
        assert_eq!(found.descriptors[0].name.as_str(), "solo");
    }

    #[test]
    fn test_bad_manifest_does_not_hide_others() {
        let tmp = tempfile::tempdir().unwrap();
        write_plugin(tmp.path(), "good", "good");
        let bad = tmp.path().join("bad");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(MANIFEST_FILE_NAME), "name = 42").unwrap();

        let found = discover_manifests(&[tmp.path().to_path_buf()], MANIFEST_FILE_NAME);
        assert_eq!(found.descriptors.len(), 1);
        assert_eq!(found.failures.len(), 1);
        assert!(matches!(
            &found.failures[0],
            PluginError::InvalidManifest { path, .. } if path.ends_with("bad/plugin.toml")
        ));
    }

    #[test]
    fn test_missing_directory_skipped() {
        let found = discover_manifests(&[PathBuf::from("/definitely/not/here")], MANIFEST_FILE_NAME);
        assert!(found.descriptors.is_empty());
        assert!(found.failures.is_empty());
    }
}
