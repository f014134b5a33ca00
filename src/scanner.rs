use crate::arch::Arch;
use crate::file::merge_import_infos;
use crate::file::File;
use crate::file::FileAlias;
use crate::file::FileType;
use crate::file::ImportInfo;
use crate::file::ImportedStatus;
use crate::handlers::DefaultHandlers;
use crate::messages::BuildMessages;
use crate::optimistic;
use crate::paths::strip_leading_slash;
use crate::paths::to_posix;
use crate::paths::PathPolicy;
use crate::resolver::FileOracle;
use crate::resolver::Resolution;
use crate::resolver::Resolver;
use crate::resolver::ResolverContext;
use crate::resolver::ResolverOptions;
use crate::transcode;
use crate::watch::WatchSet;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ScannerOptions {
    // None means an application scan; a package name reroots module ids
    // under node_modules/meteor/<name>/.
    pub name: Option<String>,
    pub bundle_arch: Arch,
    // Extension search order for the resolver, dots included.
    pub extensions: Vec<String>,
    pub source_root: PathBuf,
    pub node_modules_paths: Vec<PathBuf>,
    // Files the scan depends on are recorded here for change detection.
    pub watch_set: WatchSet,
    pub cache_dir: Option<PathBuf>,
}

/// What a missing-module re-scan changed, so the surrounding install
/// loop can converge on a fixed point.
#[derive(Debug, Default)]
pub struct MissingModulesDelta {
    pub newly_added: BTreeMap<String, Vec<ImportInfo>>,
    pub newly_missing: BTreeMap<String, Vec<ImportInfo>>,
}

// Which file a dep walk is reading from: a regular output file, or the
// synthetic parent driving a missing-module re-scan. The stub lives in
// its own slot so it can never reach the output set.
#[derive(Debug, Clone, Copy)]
enum ParentRef {
    Output(usize),
    Stub,
}

enum DepTarget {
    File(PathBuf),
    Alias { source: PathBuf, target: PathBuf },
}

fn abs_path_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

struct KnownFiles<'a> {
    index: &'a HashMap<String, usize>,
}

impl FileOracle for KnownFiles<'_> {
    fn has_file(&self, abs_path: &Path) -> bool {
        self.index.contains_key(&abs_path_key(abs_path))
    }
}

/// Walks the module dependency graph from a set of seed files, loading
/// and transcoding every reachable module, and accumulates the output
/// file set together with the modules that could not be resolved.
pub struct ImportScanner {
    policy: PathPolicy,
    handlers: DefaultHandlers,
    resolver: Arc<Resolver>,
    watch_set: WatchSet,
    messages: BuildMessages,
    output_files: Vec<File>,
    // Case-folded absolute path -> index into output_files.
    abs_path_to_output_index: HashMap<String, usize>,
    real_path_to_files: HashMap<PathBuf, Vec<usize>>,
    realpath_cache: HashMap<PathBuf, PathBuf>,
    all_missing_modules: BTreeMap<String, Vec<ImportInfo>>,
    missing_stub: Option<File>,
}

impl ImportScanner {
    pub fn new(options: ScannerOptions) -> ImportScanner {
        let resolver = Resolver::get_or_create(ResolverOptions {
            source_root: options.source_root.clone(),
            target_arch: options.bundle_arch.clone(),
            extensions: options.extensions.clone(),
            node_modules_paths: options.node_modules_paths.clone(),
        });
        let handlers =
            DefaultHandlers::new(options.bundle_arch.clone(), options.cache_dir.clone());
        let policy = PathPolicy {
            name: options.name,
            bundle_arch: options.bundle_arch,
            source_root: options.source_root,
            node_modules_paths: options.node_modules_paths,
        };

        ImportScanner {
            policy,
            handlers,
            resolver,
            watch_set: options.watch_set,
            messages: BuildMessages::new(),
            output_files: vec![],
            abs_path_to_output_index: HashMap::new(),
            real_path_to_files: HashMap::new(),
            realpath_cache: HashMap::new(),
            all_missing_modules: BTreeMap::new(),
            missing_stub: None,
        }
    }

    pub fn messages(&self) -> &BuildMessages {
        &self.messages
    }

    pub fn watch_set(&self) -> &WatchSet {
        &self.watch_set
    }

    pub fn all_missing_modules(&self) -> &BTreeMap<String, Vec<ImportInfo>> {
        &self.all_missing_modules
    }

    fn is_web(&self) -> bool {
        self.policy.bundle_arch.is_web()
    }

    fn file(&self, parent: ParentRef) -> &File {
        match parent {
            ParentRef::Output(index) => &self.output_files[index],
            ParentRef::Stub => self.missing_stub.as_ref().unwrap(),
        }
    }

    fn file_mut(&mut self, parent: ParentRef) -> &mut File {
        match parent {
            ParentRef::Output(index) => &mut self.output_files[index],
            ParentRef::Stub => self.missing_stub.as_mut().unwrap(),
        }
    }

    fn get_file_index(&self, abs_path: &Path) -> Option<usize> {
        self.abs_path_to_output_index
            .get(&abs_path_key(abs_path))
            .copied()
    }

    fn push_and_index(&mut self, file: File) -> usize {
        let real = self.real_path(&file.abs_path);
        let key = abs_path_key(&file.abs_path);
        let index = self.output_files.len();
        self.output_files.push(file);
        self.abs_path_to_output_index.insert(key, index);
        self.real_path_to_files.entry(real).or_default().push(index);
        index
    }

    /// Ingests seed files contributed by upstream compilers.
    pub fn add_input_files(&mut self, files: Vec<File>) {
        for mut file in files {
            file.source_path = self.derived_source_path(&file);
            self.check_source_and_target_paths(&mut file);

            // This absolute path may not exist on the file system.
            file.abs_path = self.policy.source_root.join(&file.source_path);
            file.imported = ImportedStatus::None;
            if file.abs_module_id.is_none() {
                file.abs_module_id = self.policy.abs_module_id(&file.abs_path);
            }
            if let Some(id) = file.abs_module_id.as_deref() {
                file.serve_path = strip_leading_slash(id);
            }

            self.insert_input_file(file);
        }
    }

    fn derived_source_path(&self, file: &File) -> PathBuf {
        if !file.source_path.is_absolute() {
            return file.source_path.clone();
        }
        match file.source_path.strip_prefix(&self.policy.source_root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => panic!(
                "sourcePath {} is not a subdirectory of the source root {}",
                file.source_path.display(),
                self.policy.source_root.display()
            ),
        }
    }

    // A seed that installs somewhere other than its source location gets
    // an implicit proxy file at the source location re-exporting the
    // target, and the seed itself moves to the target location.
    fn check_source_and_target_paths(&mut self, file: &mut File) {
        let target_path = match file.target_path.clone() {
            Some(target) => target,
            None => return,
        };
        if target_path == file.source_path {
            return;
        }

        let abs_source_path = self.policy.source_root.join(&file.source_path);
        let abs_target_path = self.policy.source_root.join(&target_path);
        let relative_id = relative_import_id(
            abs_source_path.parent().unwrap_or(&self.policy.source_root),
            &abs_target_path,
        );

        let explicit_exists = self
            .get_file_index(&abs_source_path)
            .map(|index| !self.output_files[index].implicit)
            .unwrap_or(false);

        if !explicit_exists {
            let mut proxy = File::new(&abs_source_path);
            proxy.source_path = file.source_path.clone();
            proxy.implicit = true;
            proxy.lazy = file.lazy;
            proxy.file_type = FileType::Js;
            proxy.abs_module_id = self.policy.abs_module_id(&abs_source_path);
            if let Some(id) = proxy.abs_module_id.as_deref() {
                proxy.serve_path = strip_leading_slash(id);
            }
            // Re-export both default and named bindings through the
            // live-binding linker.
            proxy.set_data_string(format!(
                "module.link({}, {{ \"*\": \"*+\" }});",
                json_escape(&relative_id)
            ));
            self.insert_input_file(proxy);
        }

        file.source_path = target_path;
    }

    fn insert_input_file(&mut self, file: File) {
        let index = match self.get_file_index(&file.abs_path) {
            Some(index) => index,
            None => {
                self.push_and_index(file);
                return;
            }
        };

        let existing = &mut self.output_files[index];
        if existing.implicit && !file.implicit {
            // The placeholder gives way to the explicit contribution.
            let status = existing.imported;
            *existing = file;
            existing.note_imported(status);
        } else if !existing.implicit && file.implicit {
            // An explicit file at the source location must not be
            // overridden by a proxy.
        } else {
            self.combine_files(index, file);
        }
    }

    // Concatenates a colliding input file onto the one already known at
    // the same case-folded path.
    fn combine_files(&mut self, index: usize, file: File) {
        let existing = &mut self.output_files[index];

        if existing.lazy != file.lazy || existing.bare != file.bare {
            panic!(
                "Attempting to combine different files:\n{:#?}\n{:#?}",
                existing, file
            );
        }

        let combined_map = combine_source_maps(
            &existing.data_string,
            existing.source_map.as_ref(),
            file.source_map.as_ref(),
            &existing.serve_path,
        );
        let combined = format!("{}\n\n{}", existing.data_string, file.data_string);
        existing.set_data_string(combined);
        existing.source_map = combined_map;
        existing.note_imported(file.imported);
        // The body changed, so any extracted deps are stale.
        existing.deps = None;
    }

    /// Initiates a graph walk from every eager seed.
    pub fn scan_imports(&mut self) {
        let seeds = self.output_files.len();
        for index in 0..seeds {
            if !self.output_files[index].lazy {
                self.scan_file(index, false);
            }
        }
    }

    /// Re-entry point for the install loop: scans the subgraphs hanging
    /// off previously missing specifiers that newly provided files may
    /// now satisfy.
    pub fn scan_missing_modules(
        &mut self,
        missing: BTreeMap<String, Vec<ImportInfo>>,
    ) -> MissingModulesDelta {
        let mut delta = MissingModulesDelta::default();
        if missing.is_empty() {
            return delta;
        }

        let previous = std::mem::take(&mut self.all_missing_modules);

        for (id, infos) in &missing {
            // Scanning per-edge would be wasteful; the only relevant
            // difference between edges is dynamic-ness, so at most two
            // representative infos drive the re-scan.
            let mut static_info: Option<&ImportInfo> = None;
            let mut dynamic_info: Option<&ImportInfo> = None;
            for info in infos {
                if info.parent_was_dynamic || info.dynamic {
                    dynamic_info = dynamic_info.or(Some(info));
                } else {
                    static_info = static_info.or(Some(info));
                }
                if static_info.is_some() && dynamic_info.is_some() {
                    break;
                }
            }

            for info in [static_info, dynamic_info].into_iter().flatten() {
                let mut stub = File::new(info.parent_path.clone());
                stub.fake = true;
                stub.source_path = PathBuf::from("fake.js");
                stub.lazy = true;
                stub.deps = Some(BTreeMap::from([(id.clone(), info.clone())]));
                self.missing_stub = Some(stub);
                self.scan_deps(ParentRef::Stub, info.dynamic);
                self.missing_stub = None;
            }
        }

        // all_missing_modules now holds only the misses recorded during
        // this re-scan.
        let newly = std::mem::take(&mut self.all_missing_modules);
        self.all_missing_modules = previous;

        for (id, infos) in &missing {
            if !newly.contains_key(id) {
                delta.newly_added.insert(id.clone(), infos.clone());
            }
        }

        for (id, infos) in newly {
            match self.all_missing_modules.get_mut(&id) {
                Some(existing) => {
                    // Previously-known misses merge back, so idempotent
                    // re-entry does not lose state.
                    merge_import_infos(existing, infos);
                }
                None => {
                    self.all_missing_modules.insert(id.clone(), infos.clone());
                    delta.newly_missing.insert(id, infos);
                }
            }
        }

        delta
    }

    /// Finalizes the scan: collapses realpath duplicates, then yields
    /// every installable file that is either eager or imported.
    pub fn output_files(&mut self) -> Vec<&File> {
        self.coalesce_real_paths();
        self.output_files
            .iter()
            .filter(|file| {
                file.abs_module_id.is_some()
                    && !file.fake
                    && !file.has_errors
                    && (!file.lazy || file.imported.is_imported())
            })
            .collect()
    }

    // Files sharing a physical realpath collapse into one container (the
    // first with a /node_modules/ id, else the first seen); the rest
    // become aliases. Statuses align to the max across the group first,
    // so a static alias never points at a merely-dynamic container.
    fn coalesce_real_paths(&mut self) {
        let groups: Vec<Vec<usize>> = self
            .real_path_to_files
            .values()
            .filter(|group| group.len() > 1)
            .cloned()
            .collect();

        for group in groups {
            let max_status = group
                .iter()
                .map(|&index| self.output_files[index].imported)
                .max()
                .unwrap_or(ImportedStatus::None);
            for &index in &group {
                self.output_files[index].imported = max_status;
            }

            let container = group
                .iter()
                .copied()
                .find(|&index| {
                    self.output_files[index]
                        .abs_module_id
                        .as_deref()
                        .map(|id| id.starts_with("/node_modules/"))
                        .unwrap_or(false)
                })
                .unwrap_or(group[0]);

            let container_id = match self.output_files[container].abs_module_id.clone() {
                Some(id) => id,
                None => continue,
            };

            for &index in &group {
                if index != container {
                    self.output_files[index].alias = Some(FileAlias {
                        abs_module_id: container_id.clone(),
                    });
                }
            }
        }
    }

    fn scan_file(&mut self, index: usize, for_dynamic_import: bool) {
        {
            let file = &self.output_files[index];
            if file.imported == ImportedStatus::Static {
                return;
            }
            if for_dynamic_import && file.imported == ImportedStatus::Dynamic {
                return;
            }
        }

        self.output_files[index]
            .note_imported(ImportedStatus::for_dynamic(for_dynamic_import));

        if !self.output_files[index].pending_errors.is_empty() {
            // Errors saved at compile time are only reported now that we
            // know the file is actually used.
            let pending = std::mem::take(&mut self.output_files[index].pending_errors);
            for message in pending {
                self.messages.push(message);
            }
            self.output_files[index].has_errors = true;
            return;
        }

        if self.output_files[index].deps.is_none() {
            let data_string = self.output_files[index].data_string.clone();
            match transcode::find_imported_module_identifiers(&data_string) {
                Ok(mut deps) => {
                    let parent_path = self.output_files[index].abs_path.clone();
                    for info in deps.values_mut() {
                        info.parent_path = parent_path.clone();
                    }
                    self.output_files[index].deps = Some(deps);
                }
                Err(e) => {
                    let source_path = self.output_files[index].source_path.clone();
                    self.messages.error(
                        e.message,
                        Some(source_path),
                        Some(e.line),
                        Some(e.column),
                    );
                    // A file with parse errors contributes no edges, and
                    // the scan moves on.
                    self.output_files[index].deps = Some(BTreeMap::new());
                    return;
                }
            }
        }

        self.scan_deps(ParentRef::Output(index), for_dynamic_import);
    }

    fn scan_deps(&mut self, parent: ParentRef, for_dynamic_import: bool) {
        let deps: Vec<(String, ImportInfo)> = self
            .file(parent)
            .deps
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();

        for (id, info) in deps {
            // Asynchronous module fetching only really makes sense in
            // the browser; on the server everything loads eagerly.
            let dynamic = self.is_web()
                && (for_dynamic_import || info.parent_was_dynamic || info.dynamic);

            let target = match self.resolve_dep(parent, &id, dynamic) {
                Some(target) => target,
                None => continue,
            };

            match target {
                DepTarget::File(path) => self.scan_dep_target(&path, dynamic),
                DepTarget::Alias { source, target } => {
                    self.add_alias_file(&source, &target, dynamic);
                    self.scan_dep_target(&target, dynamic);
                }
            }
        }
    }

    fn scan_dep_target(&mut self, path: &Path, dynamic: bool) {
        if let Some(index) = self.get_file_index(path) {
            self.upgrade_implicit_package_json(index, path);
            self.scan_file(index, dynamic);
            return;
        }

        let dep = match self.read_dep_file(path) {
            Some(dep) => dep,
            None => return,
        };
        let index = self.push_and_index(dep);
        self.scan_file(index, dynamic);
    }

    // An implicit package.json stub becomes the full parsed manifest the
    // moment something imports it explicitly.
    fn upgrade_implicit_package_json(&mut self, index: usize, path: &Path) {
        let is_stub = {
            let file = &self.output_files[index];
            file.implicit
                && file.json_data.is_some()
                && file
                    .abs_module_id
                    .as_deref()
                    .map(|id| id.ends_with("/package.json"))
                    .unwrap_or(false)
        };
        if !is_stub {
            return;
        }
        if let Some((data_string, json)) = self.read_package_json(path) {
            let file = &mut self.output_files[index];
            file.set_data_string(data_string);
            file.json_data = Some(json);
            file.implicit = false;
        }
    }

    fn resolve_dep(
        &mut self,
        parent: ParentRef,
        id: &str,
        dynamic: bool,
    ) -> Option<DepTarget> {
        let parent_abs = self.file(parent).abs_path.clone();

        let resolution = {
            let oracle = KnownFiles {
                index: &self.abs_path_to_output_index,
            };
            let resolver = Arc::clone(&self.resolver);
            resolver.resolve(id, &parent_abs, &ResolverContext { oracle: &oracle })
        };

        match resolution {
            Resolution::Missing => self.on_missing(parent, id, dynamic),
            Resolution::Resolved(resolved) => {
                self.record_helpers(parent, id, dynamic, &resolved.package_json_map);
                Some(DepTarget::File(resolved.path))
            }
            Resolution::Alias(alias) => {
                self.record_helpers(parent, id, dynamic, &alias.package_json_map);
                Some(DepTarget::Alias {
                    source: alias.source,
                    target: alias.target,
                })
            }
        }
    }

    fn on_missing(
        &mut self,
        parent: ParentRef,
        id: &str,
        dynamic: bool,
    ) -> Option<DepTarget> {
        if self.is_web() && Resolver::is_native(id) {
            // To keep the native import evaluable at runtime, depend on
            // the corresponding meteor-node-stubs replacement instead.
            let stub_id = Resolver::native_stub_id(id);
            if stub_id != id {
                if self.file(parent).abs_module_id.is_some() {
                    if let Some(info) =
                        self.file_mut(parent).deps.as_mut().and_then(|deps| deps.get_mut(id))
                    {
                        info.helpers.insert(stub_id.clone(), dynamic);
                    }
                }
                return self.resolve_dep(parent, &stub_id, dynamic);
            }
        }

        let possibly_spurious = self
            .file(parent)
            .deps
            .as_ref()
            .and_then(|deps| deps.get(id))
            .map(|info| info.possibly_spurious)
            .unwrap_or(false);

        let info = ImportInfo {
            parent_path: self.file(parent).abs_path.clone(),
            dynamic,
            parent_was_dynamic: self.file(parent).imported == ImportedStatus::Dynamic,
            possibly_spurious,
            helpers: BTreeMap::new(),
        };

        debug!("missing module {:?} (parent {})", id, info.parent_path.display());

        self.file_mut(parent)
            .missing_modules
            .insert(id.to_string(), info.clone());
        let entry = self.all_missing_modules.entry(id.to_string()).or_default();
        merge_import_infos(entry, vec![info]);

        None
    }

    // Each package.json consulted during a resolution becomes an
    // implicit helper module of the importing file.
    fn record_helpers(
        &mut self,
        parent: ParentRef,
        id: &str,
        dynamic: bool,
        package_json_map: &[(PathBuf, Value)],
    ) {
        for (path, pkg) in package_json_map {
            let helper_id = self.add_pkg_json_to_output(path, pkg, dynamic);

            if self.file(parent).abs_module_id.is_none() {
                // A file that never reaches the output has no use for
                // helper records.
                continue;
            }
            if let Some(helper_id) = helper_id {
                if let Some(info) =
                    self.file_mut(parent).deps.as_mut().and_then(|deps| deps.get_mut(id))
                {
                    info.helpers.insert(helper_id, dynamic);
                }
            }
        }
    }

    fn add_pkg_json_to_output(
        &mut self,
        path: &Path,
        pkg: &Value,
        dynamic: bool,
    ) -> Option<String> {
        if let Some(index) = self.get_file_index(path) {
            self.output_files[index].note_imported(ImportedStatus::for_dynamic(dynamic));
            return self.output_files[index].abs_module_id.clone();
        }

        let abs_module_id = self.policy.abs_module_id(path)?;

        let mut file = File::new(path);
        file.source_path = self.relative_source_path(path);
        file.file_type = FileType::Js;
        file.lazy = true;
        file.implicit = true;
        file.imported = ImportedStatus::for_dynamic(dynamic);
        file.serve_path = strip_leading_slash(&abs_module_id);
        file.abs_module_id = Some(abs_module_id.clone());
        file.json_data = Some(pkg.clone());
        file.set_data_string(transcode::json_data_to_common_js(pkg));
        file.deps = Some(BTreeMap::new());

        self.watch_set
            .add_file(path, optimistic::hash_or_null(path));
        self.push_and_index(file);
        Some(abs_module_id)
    }

    fn add_alias_file(&mut self, source: &Path, target: &Path, dynamic: bool) {
        let target_id = match self.policy.abs_module_id(target) {
            Some(id) => id,
            None => return,
        };

        if let Some(index) = self.get_file_index(source) {
            let file = &mut self.output_files[index];
            file.alias = Some(FileAlias {
                abs_module_id: target_id,
            });
            file.note_imported(ImportedStatus::for_dynamic(dynamic));
            return;
        }

        let source_id = match self.policy.abs_module_id(source) {
            Some(id) => id,
            None => return,
        };

        let mut file = File::new(source);
        file.source_path = self.relative_source_path(source);
        file.file_type = FileType::Js;
        file.lazy = true;
        file.implicit = true;
        file.imported = ImportedStatus::for_dynamic(dynamic);
        file.serve_path = strip_leading_slash(&source_id);
        file.abs_module_id = Some(source_id);
        file.alias = Some(FileAlias {
            abs_module_id: target_id,
        });
        file.deps = Some(BTreeMap::new());
        self.push_and_index(file);
    }

    /// Loads a dependency file from disk (or synthesizes its stub) and
    /// prepares it for insertion into the output set.
    fn read_dep_file(&mut self, abs_path: &Path) -> Option<File> {
        let abs_module_id = match self.policy.abs_module_id(abs_path) {
            Some(id) => id,
            // The file cannot be installed on this architecture.
            None => return None,
        };

        let real_path = self.real_path(abs_path);
        let ext = abs_path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let mut file = if let Some(existing) = self.get_info_by_real_path(&real_path) {
            // A file with the same physical identity is already known;
            // share its bytes so both copies stay identical. This is
            // what lets a symlinked package be compiled as application
            // code even when reached through node_modules.
            let known = &self.output_files[existing];
            let mut file = File::new(abs_path);
            file.file_type = known.file_type;
            file.data = known.data.clone();
            file.data_string = known.data_string.clone();
            file.hash = known.hash.clone();
            file.json_data = known.json_data.clone();
            file
        } else if self.policy.should_use_node(&abs_module_id) {
            // On the server, node_modules code is evaluated by the host
            // loader, so a delegation stub replaces the module body.
            let mut file = File::new(abs_path);
            file.set_data_string("module.useNode();");
            file.deps = Some(BTreeMap::new());
            if optimistic::should_watch(abs_path) {
                self.watch_set
                    .add_file(abs_path, optimistic::hash_or_null(abs_path));
            }
            file
        } else if abs_path.file_name().map(|n| n == "package.json").unwrap_or(false) {
            let (data_string, json) = self.read_package_json(abs_path)?;
            let mut file = File::new(abs_path);
            file.json_data = Some(json);
            file.set_data_string(data_string);
            file
        } else if ext == "node" {
            let mut file = File::new(abs_path);
            let message = if self.is_web() {
                "cannot load native .node modules on the web"
            } else {
                "cannot load native .node modules outside node_modules"
            };
            file.set_data_string(format!("throw new Error({});", json_escape(message)));
            file.deps = Some(BTreeMap::new());
            file
        } else {
            self.read_module(abs_path, &ext)?
        };

        // TODO: stop forcing the type to js here; the downstream bundler
        // distinguishes modules by content, not by this field.
        file.file_type = FileType::Js;
        file.source_path = self.relative_source_path(abs_path);
        file.abs_module_id = Some(abs_module_id.clone());
        file.serve_path = strip_leading_slash(&abs_module_id);
        file.lazy = true;
        file.imported = ImportedStatus::None;

        Some(file)
    }

    fn read_module(&mut self, abs_path: &Path, ext: &str) -> Option<File> {
        let data = optimistic::read_file(abs_path).ok()?;
        self.watch_set
            .add_file(abs_path, optimistic::hash_or_null(abs_path));

        let mut file = File::new(abs_path);
        file.set_data_string(String::from_utf8_lossy(&data).to_string());
        file.file_type = FileType::from_extension(ext);

        match self.handlers.handle(ext, &mut file) {
            Ok(Some(body)) => {
                file.set_data_string(body);
                Some(file)
            }
            // No handler matched and the body is not plain JS.
            Ok(None) => None,
            Err(e) => {
                let source_path = self.relative_source_path(abs_path);
                self.messages
                    .error(e.message, Some(source_path), Some(e.line), Some(e.column));
                None
            }
        }
    }

    fn read_package_json(&mut self, abs_path: &Path) -> Option<(String, Value)> {
        let data = optimistic::read_file(abs_path).ok()?;
        let mut json: Value = match serde_json::from_slice(&data) {
            Ok(json) => json,
            Err(e) => {
                let source_path = self.relative_source_path(abs_path);
                self.messages.error(
                    e.to_string(),
                    Some(source_path),
                    Some(e.line()),
                    Some(e.column()),
                );
                return None;
            }
        };

        if let Value::Object(map) = &mut json {
            // Root keys starting with an underscore are npm bookkeeping
            // and vary between installs.
            map.retain(|key, _| !key.starts_with('_'));
        }

        self.watch_set
            .add_file(abs_path, optimistic::hash_or_null(abs_path));
        Some((transcode::json_data_to_common_js(&json), json))
    }

    fn relative_source_path(&self, abs_path: &Path) -> PathBuf {
        abs_path
            .strip_prefix(&self.policy.source_root)
            .map(|rel| rel.to_path_buf())
            .unwrap_or_else(|_| abs_path.to_path_buf())
    }

    // First known file with the same physical identity whose bytes are
    // worth sharing.
    fn get_info_by_real_path(&self, real_path: &Path) -> Option<usize> {
        self.real_path_to_files.get(real_path).and_then(|group| {
            group
                .iter()
                .copied()
                .find(|&index| !self.output_files[index].data_string.is_empty())
        })
    }

    // Walks the path component-by-component under the source root; only
    // when some component is a symlink does the real realpath lookup
    // run. Paths outside the source root are taken as already real.
    fn real_path(&mut self, abs_path: &Path) -> PathBuf {
        if let Some(cached) = self.realpath_cache.get(abs_path) {
            return cached.clone();
        }

        let real = match abs_path.strip_prefix(&self.policy.source_root) {
            Err(_) => abs_path.to_path_buf(),
            Ok(rel) => {
                let mut prefix = self.policy.source_root.clone();
                let mut symlinked = false;
                for component in rel.components() {
                    prefix.push(component);
                    if optimistic::lstat_is_symlink(&prefix) {
                        symlinked = true;
                        break;
                    }
                }
                if symlinked {
                    optimistic::realpath_or_null(abs_path)
                        .unwrap_or_else(|| abs_path.to_path_buf())
                } else {
                    abs_path.to_path_buf()
                }
            }
        };

        self.realpath_cache
            .insert(abs_path.to_path_buf(), real.clone());
        real
    }
}

fn json_escape(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("{:?}", s))
}

// Posix-style relative import id from a directory to a target path,
// always prefixed so the resolver treats it as relative.
fn relative_import_id(from_dir: &Path, to: &Path) -> String {
    let from: Vec<_> = from_dir.components().collect();
    let to_components: Vec<_> = to.components().collect();

    let mut common = 0;
    while common < from.len()
        && common < to_components.len()
        && from[common] == to_components[common]
    {
        common += 1;
    }

    let ups = from.len() - common;
    let mut parts: Vec<String> = vec![];
    for _ in 0..ups {
        parts.push("..".into());
    }
    let rest = to_components[common..]
        .iter()
        .collect::<PathBuf>();
    let rest = to_posix(&rest);
    if !rest.is_empty() {
        parts.push(rest);
    }

    let joined = parts.join("/");
    if joined.starts_with("../") {
        joined
    } else {
        format!("./{}", joined)
    }
}

/// Concatenates two files' source maps for a combined body of
/// `old + "\n\n" + new`. A result with no mappings is dropped.
fn combine_source_maps(
    old_body: &str,
    old_map: Option<&Value>,
    new_map: Option<&Value>,
    file: &str,
) -> Option<Value> {
    if old_map.is_none() && new_map.is_none() {
        return None;
    }

    let parse = |value: &Value| -> Option<sourcemap::SourceMap> {
        let bytes = serde_json::to_vec(value).ok()?;
        sourcemap::SourceMap::from_slice(&bytes).ok()
    };

    let mut builder = sourcemap::SourceMapBuilder::new(Some(file));
    let mut copy = |map: &sourcemap::SourceMap, line_offset: u32| {
        for token in map.tokens() {
            builder.add(
                token.get_dst_line() + line_offset,
                token.get_dst_col(),
                token.get_src_line(),
                token.get_src_col(),
                token.get_source(),
                token.get_name(),
            );
        }
        for (index, source) in map.sources().enumerate() {
            if let Some(contents) = map.get_source_contents(index as u32) {
                let id = builder.add_source(source);
                builder.set_source_contents(id, Some(contents));
            }
        }
    };

    if let Some(map) = old_map.and_then(|value| parse(value)) {
        copy(&map, 0);
    }
    if let Some(map) = new_map.and_then(|value| parse(value)) {
        // The new body starts after the old one and the blank joiner.
        let offset = old_body.matches('\n').count() as u32 + 2;
        copy(&map, offset);
    }

    let combined = builder.into_sourcemap();
    if combined.get_token_count() == 0 {
        return None;
    }

    let mut buffer = vec![];
    combined.to_writer(&mut buffer).ok()?;
    serde_json::from_slice(&buffer).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;
    use std::fs;

    fn scanner_for(root: &Path, arch: &str) -> ImportScanner {
        ImportScanner::new(ScannerOptions {
            name: None,
            bundle_arch: Arch::new(arch),
            extensions: vec![".js".into(), ".json".into()],
            source_root: root.to_path_buf(),
            node_modules_paths: vec![root.join("node_modules")],
            watch_set: WatchSet::new(),
            cache_dir: None,
        })
    }

    // Builds an eager seed the way the CLI does: read the entry file
    // and transcode it with the handler registry.
    fn seed(root: &Path, rel: &str, arch: &str) -> File {
        let abs = root.join(rel);
        let ext = abs
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let mut file = File::new(&abs);
        file.source_path = PathBuf::from(rel);
        file.file_type = FileType::from_extension(&ext);
        file.set_data_string(fs::read_to_string(&abs).unwrap());

        let handlers = DefaultHandlers::new(Arch::new(arch), None);
        if let Some(body) = handlers.handle(&ext, &mut file).unwrap() {
            file.set_data_string(body);
        }
        file
    }

    fn canonical_root(tmp: &TempDir) -> PathBuf {
        tmp.path().canonicalize().unwrap()
    }

    fn by_serve<'a>(files: &'a [&'a File], serve_path: &str) -> &'a File {
        files
            .iter()
            .find(|file| file.serve_path == serve_path)
            .unwrap_or_else(|| panic!("no output file with serve path {:?}", serve_path))
    }

    #[test]
    fn simple_app_single_static_import() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import \"./util.js\";").unwrap();
        tmp.child("util.js").write_str("export const x = 1;").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        assert_eq!(files.len(), 2);

        let main = by_serve(&files, "main.js");
        assert!(!main.lazy);
        assert_eq!(main.imported, ImportedStatus::Static);
        assert!(main.data_string.contains("module.link(\"./util.js\");"));
        assert_eq!(main.abs_module_id.as_deref(), Some("/main.js"));

        let util = by_serve(&files, "util.js");
        assert!(util.lazy);
        assert_eq!(util.imported, ImportedStatus::Static);
        assert!(util.data_string.contains("module.export"));
    }

    #[test]
    fn dynamic_imports_stay_dynamic_on_web() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import(\"./lazy.js\");").unwrap();
        tmp.child("lazy.js").write_str("import \"./deep.js\";").unwrap();
        tmp.child("deep.js").write_str("export const d = 1;").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        assert_eq!(by_serve(&files, "lazy.js").imported, ImportedStatus::Dynamic);
        // Dynamic-ness propagates through the transitive static import.
        assert_eq!(by_serve(&files, "deep.js").imported, ImportedStatus::Dynamic);
    }

    #[test]
    fn dynamic_imports_become_static_on_the_server() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import(\"./lazy.js\");").unwrap();
        tmp.child("lazy.js").write_str("import \"./deep.js\";").unwrap();
        tmp.child("deep.js").write_str("export const d = 1;").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "os");
        scanner.add_input_files(vec![seed(&root, "main.js", "os")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        assert_eq!(by_serve(&files, "lazy.js").imported, ImportedStatus::Static);
        assert_eq!(by_serve(&files, "deep.js").imported, ImportedStatus::Static);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_package_collapses_to_one_container() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import \"x\";").unwrap();
        tmp.child("shared/x/index.js")
            .write_str("export const x = 1;")
            .unwrap();
        let root = canonical_root(&tmp);
        fs::create_dir_all(root.join("node_modules")).unwrap();
        std::os::unix::fs::symlink(
            root.join("shared/x"),
            root.join("node_modules/x"),
        )
        .unwrap();

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![
            seed(&root, "main.js", "web.browser"),
            seed(&root, "shared/x/index.js", "web.browser"),
        ]);
        scanner.scan_imports();

        let files = scanner.output_files();
        let container = by_serve(&files, "node_modules/x/index.js");
        let aliased = by_serve(&files, "shared/x/index.js");

        assert!(container.alias.is_none());
        assert_eq!(
            aliased.alias.as_ref().unwrap().abs_module_id,
            "/node_modules/x/index.js"
        );
        assert_eq!(container.hash, aliased.hash);
        assert_eq!(container.imported, aliased.imported);
    }

    #[test]
    fn browser_field_aliases_emit_alias_files() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import \"pkg\";").unwrap();
        tmp.child("node_modules/pkg/package.json")
            .write_str(
                "{\"name\": \"pkg\", \"main\": \"index.js\", \
                 \"browser\": {\"./node.js\": \"./browser.js\"}}",
            )
            .unwrap();
        tmp.child("node_modules/pkg/index.js")
            .write_str("import \"./node.js\";")
            .unwrap();
        tmp.child("node_modules/pkg/node.js")
            .write_str("exports.n = 1;")
            .unwrap();
        tmp.child("node_modules/pkg/browser.js")
            .write_str("exports.b = 1;")
            .unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        let alias = by_serve(&files, "node_modules/pkg/node.js");
        assert_eq!(
            alias.alias.as_ref().unwrap().abs_module_id,
            "/node_modules/pkg/browser.js"
        );
        assert_eq!(
            by_serve(&files, "node_modules/pkg/browser.js").imported,
            ImportedStatus::Static
        );

        // The consulted manifest rides along as an implicit helper.
        let manifest = by_serve(&files, "node_modules/pkg/package.json");
        assert!(manifest.implicit);
        let main = by_serve(&files, "main.js");
        let helpers = &main.deps.as_ref().unwrap()["pkg"].helpers;
        assert_eq!(helpers.get("/node_modules/pkg/package.json"), Some(&false));
    }

    #[test]
    fn missing_module_then_satisfied() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import \"react\";").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        assert!(scanner.all_missing_modules().contains_key("react"));
        assert!(scanner
            .output_files()
            .iter()
            .all(|file| !file.serve_path.starts_with("node_modules/react/")));

        // The install loop provides the package and re-enters the scan.
        tmp.child("node_modules/react/package.json")
            .write_str("{\"name\": \"react\", \"main\": \"index.js\"}")
            .unwrap();
        tmp.child("node_modules/react/index.js")
            .write_str("exports.createElement = function () {};")
            .unwrap();

        let missing = scanner.all_missing_modules().clone();
        let delta = scanner.scan_missing_modules(missing);

        assert!(delta.newly_added.contains_key("react"));
        assert!(delta.newly_missing.is_empty());

        let files = scanner.output_files();
        let react = by_serve(&files, "node_modules/react/index.js");
        assert_eq!(react.imported, ImportedStatus::Static);
        // The synthetic re-scan parent never reaches the output.
        assert!(files.iter().all(|file| !file.fake));
        assert!(files
            .iter()
            .all(|file| file.source_path != PathBuf::from("fake.js")));
    }

    #[test]
    fn rescanning_nothing_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import \"ghost\";").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();
        let before = scanner.all_missing_modules().clone();

        let delta = scanner.scan_missing_modules(BTreeMap::new());
        assert!(delta.newly_added.is_empty());
        assert!(delta.newly_missing.is_empty());
        assert_eq!(scanner.all_missing_modules(), &before);
    }

    #[test]
    fn colliding_inputs_are_concatenated() {
        let tmp = TempDir::new().unwrap();
        let root = canonical_root(&tmp);

        let mut first = File::new(root.join("dup.js"));
        first.source_path = PathBuf::from("dup.js");
        first.set_data_string("exports.a = 1;");
        let mut second = File::new(root.join("dup.js"));
        second.source_path = PathBuf::from("dup.js");
        second.set_data_string("exports.b = 2;");

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![first, second]);
        scanner.scan_imports();

        let files = scanner.output_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].data_string, "exports.a = 1;\n\nexports.b = 2;");
    }

    #[test]
    #[should_panic(expected = "Attempting to combine different files")]
    fn colliding_inputs_with_different_laziness_panic() {
        let tmp = TempDir::new().unwrap();
        let root = canonical_root(&tmp);

        let mut first = File::new(root.join("dup.js"));
        first.source_path = PathBuf::from("dup.js");
        first.set_data_string("exports.a = 1;");
        let mut second = File::new(root.join("dup.js"));
        second.source_path = PathBuf::from("dup.js");
        second.set_data_string("exports.b = 2;");
        second.lazy = true;

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![first, second]);
    }

    #[test]
    #[should_panic(expected = "not a subdirectory of the source root")]
    fn seeds_outside_the_source_root_panic() {
        let tmp = TempDir::new().unwrap();
        let root = canonical_root(&tmp);

        let mut rogue = File::new("/elsewhere/rogue.js");
        rogue.source_path = PathBuf::from("/elsewhere/rogue.js");

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![rogue]);
    }

    #[test]
    fn target_paths_synthesize_source_proxies() {
        let tmp = TempDir::new().unwrap();
        let root = canonical_root(&tmp);

        let mut file = File::new(root.join("proxy-src.js"));
        file.source_path = PathBuf::from("proxy-src.js");
        file.target_path = Some(PathBuf::from("proxy-target.js"));
        file.set_data_string("exports.t = 1;");

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![file]);
        scanner.scan_imports();

        let files = scanner.output_files();
        let proxy = by_serve(&files, "proxy-src.js");
        assert!(proxy.implicit);
        assert_eq!(
            proxy.data_string,
            "module.link(\"./proxy-target.js\", { \"*\": \"*+\" });"
        );

        // The proxy's link resolves through the in-memory file set; the
        // target never existed on disk.
        let target = by_serve(&files, "proxy-target.js");
        assert_eq!(target.imported, ImportedStatus::Static);
    }

    #[test]
    fn client_files_never_reach_server_bundles() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js")
            .write_str("import \"./client/ui.js\";")
            .unwrap();
        tmp.child("client/ui.js").write_str("exports.ui = 1;").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "os.linux.x86_64");
        scanner.add_input_files(vec![seed(&root, "main.js", "os.linux.x86_64")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].serve_path, "main.js");
        // Uninstallable is not the same as missing.
        assert!(scanner.all_missing_modules().is_empty());
    }

    #[test]
    fn unknown_extensions_that_parse_as_js_are_bundled() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js")
            .write_str("import \"./data.weird\";")
            .unwrap();
        tmp.child("data.weird").write_str("exports.w = 1;").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        let weird = by_serve(&files, "data.weird");
        assert_eq!(weird.imported, ImportedStatus::Static);
        assert!(weird.data_string.contains("exports.w = 1;"));
    }

    #[test]
    fn server_node_modules_are_delegated_to_node() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import \"pkg\";").unwrap();
        tmp.child("node_modules/pkg/package.json")
            .write_str("{\"name\": \"pkg\", \"main\": \"index.js\"}")
            .unwrap();
        tmp.child("node_modules/pkg/index.js")
            .write_str("require(\"secret-dep\");")
            .unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "os");
        scanner.add_input_files(vec![seed(&root, "main.js", "os")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        let pkg = by_serve(&files, "node_modules/pkg/index.js");
        assert_eq!(pkg.data_string, "module.useNode();");
        // The stub has no deps, so the package's own imports are not
        // walked.
        assert!(scanner.all_missing_modules().is_empty());
    }

    #[test]
    fn native_imports_use_stubs_on_the_web() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import \"fs\";").unwrap();
        tmp.child("node_modules/meteor-node-stubs/deps/fs.js")
            .write_str("module.exports = {};")
            .unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        let stub = by_serve(&files, "node_modules/meteor-node-stubs/deps/fs.js");
        assert_eq!(stub.imported, ImportedStatus::Static);

        let main = by_serve(&files, "main.js");
        let helpers = &main.deps.as_ref().unwrap()["fs"].helpers;
        assert_eq!(helpers.get("meteor-node-stubs/deps/fs.js"), Some(&false));
        assert!(scanner.all_missing_modules().is_empty());
    }

    #[test]
    fn native_imports_without_stubs_are_missing() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import \"fs\";").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        assert!(scanner
            .all_missing_modules()
            .contains_key("meteor-node-stubs/deps/fs.js"));
    }

    #[test]
    fn spurious_requires_are_recorded_quietly() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js")
            .write_str("if (false) { require(\"ghost\"); }")
            .unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        let missing = scanner.all_missing_modules();
        assert!(missing["ghost"][0].possibly_spurious);
        // Spurious misses never surface as user-visible errors.
        assert!(scanner.messages().is_empty());
    }

    #[test]
    fn static_edges_promote_dynamically_reached_files() {
        let tmp = TempDir::new().unwrap();
        tmp.child("a.js").write_str("import(\"./shared.js\");").unwrap();
        tmp.child("b.js").write_str("import \"./shared.js\";").unwrap();
        tmp.child("shared.js").write_str("exports.s = 1;").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![
            seed(&root, "a.js", "web.browser"),
            seed(&root, "b.js", "web.browser"),
        ]);
        scanner.scan_imports();

        let files = scanner.output_files();
        assert_eq!(by_serve(&files, "shared.js").imported, ImportedStatus::Static);
    }

    #[test]
    fn json_dependencies_keep_their_parsed_tree() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js")
            .write_str("import \"./config.json\";")
            .unwrap();
        tmp.child("config.json").write_str("{\"debug\": true}").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        let config = by_serve(&files, "config.json");
        assert!(config.data_string.starts_with("module.exports = {"));
        assert_eq!(config.json_data.as_ref().unwrap()["debug"], true);
        // Dep-loaded files are typed js regardless of handler.
        assert_eq!(config.file_type, FileType::Js);
    }

    #[test]
    fn package_json_deps_strip_npm_private_keys() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js")
            .write_str("import \"./meta/package.json\";")
            .unwrap();
        tmp.child("meta/package.json")
            .write_str("{\"name\": \"meta\", \"_id\": \"meta@1.0.0\"}")
            .unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        let manifest = by_serve(&files, "meta/package.json");
        assert!(manifest.data_string.contains("\"name\""));
        assert!(!manifest.data_string.contains("_id"));
    }

    #[test]
    fn implicit_manifest_stubs_upgrade_when_imported() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js")
            .write_str("import \"pkg\";\nimport \"pkg/package.json\";")
            .unwrap();
        tmp.child("node_modules/pkg/package.json")
            .write_str("{\"name\": \"pkg\", \"main\": \"index.js\", \"license\": \"MIT\"}")
            .unwrap();
        tmp.child("node_modules/pkg/index.js")
            .write_str("exports.p = 1;")
            .unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        let files = scanner.output_files();
        let manifest = by_serve(&files, "node_modules/pkg/package.json");
        // The resolver's subset stub was upgraded to the full manifest.
        assert!(!manifest.implicit);
        assert!(manifest.data_string.contains("\"license\""));
    }

    #[test]
    fn pending_compiler_errors_flush_on_import() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("import \"./broken.js\";").unwrap();
        let root = canonical_root(&tmp);

        let mut broken = File::new(root.join("broken.js"));
        broken.source_path = PathBuf::from("broken.js");
        broken.lazy = true;
        broken.set_data_string("exports.b = 1;");
        broken.pending_errors.push(crate::messages::BuildMessage {
            message: "upstream compiler failed".into(),
            file: Some(PathBuf::from("broken.js")),
            line: Some(1),
            column: None,
        });

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser"), broken]);
        scanner.scan_imports();

        assert_eq!(scanner.messages().len(), 1);
        let files = scanner.output_files();
        assert!(files.iter().all(|file| file.serve_path != "broken.js"));
    }

    #[test]
    fn parse_errors_are_scoped_to_one_file() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js")
            .write_str("import \"./bad.js\";\nimport \"./good.js\";")
            .unwrap();
        tmp.child("bad.js").write_str("var x = ;").unwrap();
        tmp.child("good.js").write_str("exports.g = 1;").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        assert_eq!(scanner.messages().len(), 1);
        let message = scanner.messages().iter().next().unwrap().clone();
        assert_eq!(message.file.as_deref(), Some(Path::new("bad.js")));
        assert_eq!(message.line, Some(1));

        // The scan carried on past the broken file.
        let files = scanner.output_files();
        assert_eq!(by_serve(&files, "good.js").imported, ImportedStatus::Static);
    }

    #[test]
    fn scanning_is_idempotent_and_deterministic() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js")
            .write_str("import \"./a.js\";\nimport(\"./b.js\");")
            .unwrap();
        tmp.child("a.js").write_str("export const a = 1;").unwrap();
        tmp.child("b.js").write_str("export const b = 2;").unwrap();
        let root = canonical_root(&tmp);

        let snapshot = |scanner: &mut ImportScanner| -> Vec<(String, String, ImportedStatus)> {
            scanner
                .output_files()
                .iter()
                .map(|file| (file.serve_path.clone(), file.hash.clone(), file.imported))
                .collect()
        };

        let mut first = scanner_for(&root, "web.browser");
        first.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        first.scan_imports();
        let once = snapshot(&mut first);

        // Scanning again after the fixed point changes nothing.
        first.scan_imports();
        assert_eq!(snapshot(&mut first), once);

        // A fresh scanner over the same tree produces the same output.
        let mut second = scanner_for(&root, "web.browser");
        second.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        second.scan_imports();
        assert_eq!(snapshot(&mut second), once);
    }

    #[test]
    fn lazy_files_without_importers_are_not_emitted() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js").write_str("exports.m = 1;").unwrap();
        tmp.child("orphan.js").write_str("exports.o = 1;").unwrap();
        let root = canonical_root(&tmp);

        let mut orphan = seed(&root, "orphan.js", "web.browser");
        orphan.lazy = true;

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser"), orphan]);
        scanner.scan_imports();

        let files = scanner.output_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].serve_path, "main.js");
    }

    #[test]
    fn emitted_files_satisfy_the_output_invariants() {
        let tmp = TempDir::new().unwrap();
        tmp.child("main.js")
            .write_str("import \"./a.js\";\nimport(\"./b.js\");\nimport \"missing-pkg\";")
            .unwrap();
        tmp.child("a.js").write_str("export const a = 1;").unwrap();
        tmp.child("b.js").write_str("export const b = 2;").unwrap();
        let root = canonical_root(&tmp);

        let mut scanner = scanner_for(&root, "web.browser");
        scanner.add_input_files(vec![seed(&root, "main.js", "web.browser")]);
        scanner.scan_imports();

        for file in scanner.output_files() {
            let id = file.abs_module_id.as_deref().unwrap();
            assert!(id.starts_with('/'));
            assert!(!file.fake);
            assert!(!file.has_errors);
            if file.lazy {
                assert!(file.imported.is_imported());
            }
            assert_eq!(file.data, file.data_string.as_bytes());
            assert_eq!(file.hash, crate::file::sha1_hex(&file.data));
        }
    }
}
