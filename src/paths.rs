use crate::arch::Arch;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

lazy_static! {
    // Test variants of a package keep the module ids of the package
    // they wrap.
    static ref LOCAL_TEST_PREFIX: Regex = Regex::new(r"^local-test[:_]").unwrap();
}

// Top-level app directories that never contribute modules.
const EXCLUDED_TOP_LEVEL_DIRS: &[&str] =
    &["private", "packages", "programs", "cordova-build-override"];

/// Maps absolute filesystem paths to absolute module identifiers for
/// one bundle architecture and package-name context.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    // Empty name means an application scan; a package name reroots the
    // ids under node_modules/meteor/<name>/.
    pub name: Option<String>,
    pub bundle_arch: Arch,
    pub source_root: PathBuf,
    pub node_modules_paths: Vec<PathBuf>,
}

impl PathPolicy {
    pub fn is_app(&self) -> bool {
        self.name.is_none()
    }

    /// Derives the runtime-visible module id for a path, or None when
    /// the file is not installable on this architecture.
    pub fn abs_module_id(&self, abs_path: &Path) -> Option<String> {
        let mut id = self
            .node_modules_abs_module_id(abs_path)
            .or_else(|| self.source_root_abs_module_id(abs_path))?;

        if let Some(name) = self.name.as_deref() {
            let stripped = LOCAL_TEST_PREFIX.replace(name, "");
            id = format!("node_modules/meteor/{}/{}", stripped, id);
        }

        Some(ensure_leading_slash(&id))
    }

    // Modules reached through any of the configured node_modules roots
    // install under /node_modules/<relative>.
    fn node_modules_abs_module_id(&self, abs_path: &Path) -> Option<String> {
        self.node_modules_paths.iter().find_map(|path| {
            abs_path
                .strip_prefix(path)
                .ok()
                .map(|rel| format!("node_modules/{}", to_posix(rel)))
        })
    }

    fn source_root_abs_module_id(&self, abs_path: &Path) -> Option<String> {
        let rel = abs_path.strip_prefix(&self.source_root).ok()?;
        let dirs: Vec<&str> = rel
            .parent()
            .map(|parent| {
                parent
                    .components()
                    .filter_map(|c| match c {
                        Component::Normal(name) => name.to_str(),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        // All of the exclusions below apply to app source trees only;
        // a package scan keeps every path under its source root.
        if self.is_app() {
            if let Some(top) = dirs.first() {
                if EXCLUDED_TOP_LEVEL_DIRS.contains(top) {
                    return None;
                }
            }
        }

        let bundling_for_web = self.bundle_arch.is_web();

        for dir in &dirs {
            if self.is_app() {
                if dir.starts_with('.') {
                    // Files inside dot-directories are never loaded.
                    return None;
                }

                if bundling_for_web {
                    if *dir == "server" {
                        // Server-only code stays out of client bundles.
                        return None;
                    }
                } else if *dir == "client" {
                    // Client-only code stays out of server bundles.
                    return None;
                }
            }

            if *dir == "node_modules" {
                // Anything within node_modules is accepted as-is, exempt
                // from the filtering above.
                return Some(to_posix(rel));
            }
        }

        Some(to_posix(rel))
    }

    /// On the server, modules under node_modules (other than bundled
    /// meteor packages) are delegated to the host Node loader.
    pub fn should_use_node(&self, abs_module_id: &str) -> bool {
        if self.bundle_arch.is_web() {
            return false;
        }

        let parts: Vec<&str> = abs_module_id
            .split('/')
            .filter(|part| !part.is_empty())
            .collect();

        match parts.iter().position(|part| *part == "node_modules") {
            Some(index) => parts.get(index + 1) != Some(&"meteor"),
            None => false,
        }
    }
}

pub fn ensure_leading_slash(id: &str) -> String {
    if id.starts_with('/') {
        id.to_string()
    } else {
        format!("/{}", id)
    }
}

pub fn strip_leading_slash(id: &str) -> String {
    id.strip_prefix('/').unwrap_or(id).to_string()
}

// Module ids are always /-delimited, whatever the host separator is.
pub fn to_posix(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
