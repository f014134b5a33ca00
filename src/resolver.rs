use crate::arch::Arch;
use crate::optimistic;
use crate::optimistic::FileKind;
use lazy_static::lazy_static;
use path_clean::PathClean;
use phf::phf_set;
use serde_json::Map;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::trace;

// Node builtins for which meteor-node-stubs ships browser replacements.
static NATIVE_MODULES: phf::Set<&'static str> = phf_set! {
    "assert", "buffer", "child_process", "cluster", "console", "constants",
    "crypto", "dgram", "dns", "domain", "events", "fs", "http", "https",
    "module", "net", "os", "path", "process", "punycode", "querystring",
    "readline", "repl", "stream", "string_decoder", "sys", "timers", "tls",
    "tty", "url", "util", "vm", "zlib",
};

/// Lookup hook for files that exist only in a scanner's memory
/// (synthesized proxies, compiler output not yet written to disk).
pub trait FileOracle {
    fn has_file(&self, abs_path: &Path) -> bool;
}

pub struct NoVirtualFiles;

impl FileOracle for NoVirtualFiles {
    fn has_file(&self, _abs_path: &Path) -> bool {
        false
    }
}

/// Per-call state: the virtual-file oracle belongs to the calling
/// scanner, not to the (shared) resolver instance.
pub struct ResolverContext<'a> {
    pub oracle: &'a dyn FileOracle,
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub path: PathBuf,
    // Every package.json whose presence steered this lookup, in consult
    // order, reduced to the subset of fields the runtime needs.
    pub package_json_map: Vec<(PathBuf, Value)>,
}

/// A browser-field override: references to `source` must be redirected
/// to `target` on this arch.
#[derive(Debug, Clone)]
pub struct BrowserAlias {
    pub source: PathBuf,
    pub target: PathBuf,
    pub package_json_map: Vec<(PathBuf, Value)>,
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(Resolved),
    Alias(BrowserAlias),
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolverOptions {
    pub source_root: PathBuf,
    pub target_arch: Arch,
    pub extensions: Vec<String>,
    pub node_modules_paths: Vec<PathBuf>,
}

lazy_static! {
    static ref RESOLVERS: Mutex<HashMap<ResolverOptions, Arc<Resolver>>> =
        Mutex::new(HashMap::new());
}

/// Node-style module resolution for one (source root, arch) pair. The
/// path and extension policy is shared process-wide; everything mutable
/// per scanner arrives through the ResolverContext.
#[derive(Debug)]
pub struct Resolver {
    source_root: PathBuf,
    target_arch: Arch,
    extensions: Vec<String>,
    node_modules_paths: Vec<PathBuf>,
}

impl Resolver {
    pub fn get_or_create(options: ResolverOptions) -> Arc<Resolver> {
        let mut resolvers = RESOLVERS.lock().unwrap();
        resolvers
            .entry(options.clone())
            .or_insert_with(|| {
                Arc::new(Resolver {
                    source_root: options.source_root,
                    target_arch: options.target_arch,
                    extensions: options.extensions,
                    node_modules_paths: options.node_modules_paths,
                })
            })
            .clone()
    }

    pub fn is_web(&self) -> bool {
        self.target_arch.is_web()
    }

    pub fn is_native(id: &str) -> bool {
        NATIVE_MODULES.contains(id)
    }

    pub fn native_stub_id(id: &str) -> String {
        format!("meteor-node-stubs/deps/{}.js", id)
    }

    /// Resolves `specifier` against the file at `parent_abs`.
    pub fn resolve(
        &self,
        specifier: &str,
        parent_abs: &Path,
        ctx: &ResolverContext,
    ) -> Resolution {
        trace!(
            "resolving {:?} from {} for {}",
            specifier,
            parent_abs.display(),
            self.target_arch
        );

        let parent_dir = parent_abs.parent().unwrap_or_else(|| Path::new("/"));
        let mut pkg_map: Vec<(PathBuf, Value)> = vec![];

        let resolved = if specifier.starts_with('/') {
            self.resolve_path(Path::new(specifier), ctx, &mut pkg_map, true)
        } else if specifier.starts_with("./") || specifier.starts_with("../") {
            let path = parent_dir.join(specifier).clean();
            self.resolve_path(&path, ctx, &mut pkg_map, true)
        } else {
            self.resolve_node_module(specifier, parent_dir, ctx, &mut pkg_map)
        };

        let path = match resolved {
            Some(path) => path,
            None => return Resolution::Missing,
        };

        if self.is_web() {
            if let Some(alias) =
                self.check_browser_alias(&path, specifier, parent_dir, ctx, &mut pkg_map)
            {
                return Resolution::Alias(alias);
            }
        }

        Resolution::Resolved(Resolved {
            path,
            package_json_map: pkg_map,
        })
    }

    fn stat(&self, path: &Path, ctx: &ResolverContext) -> Option<FileKind> {
        if ctx.oracle.has_file(path) {
            // Virtual files are always plain files.
            return Some(FileKind::File);
        }
        optimistic::stat_or_null(path)
    }

    fn resolve_path(
        &self,
        path: &Path,
        ctx: &ResolverContext,
        pkg_map: &mut Vec<(PathBuf, Value)>,
        allow_package_entry: bool,
    ) -> Option<PathBuf> {
        self.resolve_as_file(path, ctx)
            .or_else(|| self.resolve_as_directory(path, ctx, pkg_map, allow_package_entry))
    }

    // Exact path first, then the configured extension search order.
    fn resolve_as_file(&self, path: &Path, ctx: &ResolverContext) -> Option<PathBuf> {
        if self.stat(path, ctx) == Some(FileKind::File) {
            return Some(path.to_path_buf());
        }

        let name = path.file_name()?.to_string_lossy().into_owned();
        for ext in &self.extensions {
            let candidate = path.with_file_name(format!("{}{}", name, ext));
            if self.stat(&candidate, ctx) == Some(FileKind::File) {
                return Some(candidate);
            }
        }
        None
    }

    fn resolve_as_directory(
        &self,
        path: &Path,
        ctx: &ResolverContext,
        pkg_map: &mut Vec<(PathBuf, Value)>,
        allow_package_entry: bool,
    ) -> Option<PathBuf> {
        if self.stat(path, ctx) != Some(FileKind::Dir) {
            return None;
        }

        if allow_package_entry {
            if let Some(main) = self.resolve_package_entry(path, ctx, pkg_map) {
                return Some(main);
            }
        }

        for ext in &self.extensions {
            let candidate = path.join(format!("index{}", ext));
            if self.stat(&candidate, ctx) == Some(FileKind::File) {
                return Some(candidate);
            }
        }
        None
    }

    // Honors the package.json "main" field; on web arches a string-typed
    // "browser" field substitutes for it.
    fn resolve_package_entry(
        &self,
        dir: &Path,
        ctx: &ResolverContext,
        pkg_map: &mut Vec<(PathBuf, Value)>,
    ) -> Option<PathBuf> {
        let pkg_json_path = dir.join("package.json");
        let pkg = read_json_or_null(&pkg_json_path)?;

        let mut main = pkg.get("main").and_then(Value::as_str);
        if self.is_web() {
            if let Some(browser) = pkg.get("browser").and_then(Value::as_str) {
                main = Some(browser);
            }
        }

        let main = main?;
        let entry = dir.join(main).clean();
        let resolved = self
            .resolve_as_file(&entry, ctx)
            .or_else(|| self.resolve_as_directory(&entry, ctx, pkg_map, false))?;

        record_package_json(pkg_map, &pkg_json_path, &pkg);
        Some(resolved)
    }

    // Walks the configured node_modules roots, then every ancestor
    // node_modules directory of the referrer.
    fn resolve_node_module(
        &self,
        specifier: &str,
        parent_dir: &Path,
        ctx: &ResolverContext,
        pkg_map: &mut Vec<(PathBuf, Value)>,
    ) -> Option<PathBuf> {
        for nm in &self.node_modules_paths {
            if let Some(path) = self.resolve_path(&nm.join(specifier), ctx, pkg_map, true) {
                return Some(path);
            }
        }

        for dir in parent_dir.ancestors() {
            if dir.file_name().map(|n| n == "node_modules").unwrap_or(false) {
                continue;
            }
            let candidate = dir.join("node_modules").join(specifier);
            if let Some(path) = self.resolve_path(&candidate, ctx, pkg_map, true) {
                return Some(path);
            }
        }

        None
    }

    // Applies the browser-field alias table of the referrer's enclosing
    // package. Aliases that escape the declaring package are refused,
    // and entries that resolve back to themselves are discarded.
    fn check_browser_alias(
        &self,
        resolved: &Path,
        specifier: &str,
        parent_dir: &Path,
        ctx: &ResolverContext,
        pkg_map: &mut Vec<(PathBuf, Value)>,
    ) -> Option<BrowserAlias> {
        let (pkg_dir, pkg_json_path, pkg) = self.enclosing_package(parent_dir)?;
        let browser = pkg.get("browser")?.as_object()?;

        for (key, value) in browser {
            let target_spec = match value {
                Value::String(s) => s.as_str(),
                // Boolean false means "omit this module"; it never
                // produces an alias.
                _ => continue,
            };

            let matches = if key.starts_with("./") || key.starts_with("../") {
                self.resolve_as_file(&pkg_dir.join(key).clean(), ctx)
                    .map(|source| source == resolved)
                    .unwrap_or(false)
            } else {
                key == specifier
            };
            if !matches {
                continue;
            }

            let target = match self.resolve_as_file(&pkg_dir.join(target_spec).clean(), ctx) {
                Some(target) => target,
                None => continue,
            };

            if target.strip_prefix(&pkg_dir).is_err() {
                // Browser aliases may not reach into other packages.
                trace!(
                    "refusing cross-package browser alias {:?} -> {:?}",
                    key,
                    target_spec
                );
                continue;
            }

            if target == resolved {
                // A self-referential alias would loop forever.
                continue;
            }

            record_package_json(pkg_map, &pkg_json_path, &pkg);
            return Some(BrowserAlias {
                source: resolved.to_path_buf(),
                target,
                package_json_map: pkg_map.clone(),
            });
        }

        None
    }

    // Nearest package.json at or above the given directory, stopping at
    // the source root.
    fn enclosing_package(&self, dir: &Path) -> Option<(PathBuf, PathBuf, Value)> {
        for candidate in dir.ancestors() {
            let pkg_json_path = candidate.join("package.json");
            if let Some(pkg) = read_json_or_null(&pkg_json_path) {
                return Some((candidate.to_path_buf(), pkg_json_path, pkg));
            }
            if candidate == self.source_root {
                break;
            }
        }
        None
    }
}

fn read_json_or_null(path: &Path) -> Option<Value> {
    let data = optimistic::read_file(path).ok()?;
    serde_json::from_slice(&data).ok()
}

// The helper module emitted for a consulted manifest carries only the
// fields the runtime needs; an explicit import may upgrade it later.
fn record_package_json(pkg_map: &mut Vec<(PathBuf, Value)>, path: &Path, pkg: &Value) {
    if pkg_map.iter().any(|(existing, _)| existing == path) {
        return;
    }
    let mut subset = Map::new();
    for key in ["name", "version", "main", "browser"] {
        if let Some(value) = pkg.get(key) {
            subset.insert(key.to_string(), value.clone());
        }
    }
    pkg_map.push((path.to_path_buf(), Value::Object(subset)));
}
