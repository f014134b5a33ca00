use crate::messages::BuildMessage;
use serde_json::Value;
use sha::sha1::Sha1;
use sha::utils::Digest;
use sha::utils::DigestExt;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// How a file has been reached during the graph walk. The ordering is
/// total (`None < Dynamic < Static`) and the status is monotonic: it is
/// only ever promoted via `join`, never demoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImportedStatus {
    None,
    Dynamic,
    Static,
}

impl ImportedStatus {
    pub fn join(self, other: ImportedStatus) -> ImportedStatus {
        self.max(other)
    }

    pub fn for_dynamic(dynamic: bool) -> ImportedStatus {
        if dynamic {
            ImportedStatus::Dynamic
        } else {
            ImportedStatus::Static
        }
    }

    pub fn is_imported(self) -> bool {
        self != ImportedStatus::None
    }
}

/// One dependency edge, keyed by import specifier on the importing file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportInfo {
    // Absolute path of the importer.
    pub parent_path: PathBuf,
    // The importer used a dynamic-import construct for this specifier.
    pub dynamic: bool,
    // The importer itself was only reached dynamically.
    pub parent_was_dynamic: bool,
    // The specifier may have been extracted from dead code; failures to
    // resolve it must stay quiet.
    pub possibly_spurious: bool,
    // Implicit helper modules consulted while resolving this specifier
    // (package.json manifests, native stubs), mapped to dynamic-ness.
    pub helpers: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Js,
    Mjs,
    Json,
    Css,
    Other,
}

impl FileType {
    pub fn from_extension(ext: &str) -> FileType {
        match ext {
            "js" => FileType::Js,
            "mjs" => FileType::Mjs,
            "json" => FileType::Json,
            "css" => FileType::Css,
            _ => FileType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Js => "js",
            FileType::Mjs => "mjs",
            FileType::Json => "json",
            FileType::Css => "css",
            FileType::Other => "other",
        }
    }
}

/// Redirects references for a module id to another module id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAlias {
    pub abs_module_id: String,
}

/// The unit owned by the scanner: one module of the output bundle.
#[derive(Debug, Clone)]
pub struct File {
    // Absolute filesystem path. May be synthetic for files that never
    // existed on disk.
    pub abs_path: PathBuf,
    // Normalized path relative to the source root.
    pub source_path: PathBuf,
    // Alternate install path; when different from source_path the
    // scanner synthesizes an aliasing proxy file.
    pub target_path: Option<PathBuf>,
    // Logical serve path: the absolute module id minus its leading /.
    pub serve_path: String,
    // Runtime-visible module id, always starting with /. None means the
    // file is not installable on this arch and is dropped from output.
    pub abs_module_id: Option<String>,
    // Canonical module body. data always mirrors data_string and hash is
    // the SHA-1 of data; use set_data_string to keep the three in sync.
    pub data: Vec<u8>,
    pub data_string: String,
    pub hash: String,
    pub file_type: FileType,
    // Lazy files are only emitted if reached by at least one import.
    pub lazy: bool,
    // Bare modules are evaluated without the module-scope wrapper.
    pub bare: bool,
    pub imported: ImportedStatus,
    // Placeholder that a later explicit contribution may replace.
    pub implicit: bool,
    // Synthetic parent used for missing-module re-scans; never emitted.
    pub fake: bool,
    pub has_errors: bool,
    // None until the identifier extractor has run over the body.
    pub deps: Option<BTreeMap<String, ImportInfo>>,
    pub missing_modules: BTreeMap<String, ImportInfo>,
    pub alias: Option<FileAlias>,
    pub json_data: Option<Value>,
    pub source_map: Option<Value>,
    // Errors accumulated by an upstream compiler, reported only once the
    // file is actually imported.
    pub pending_errors: Vec<BuildMessage>,
}

impl File {
    pub fn new(abs_path: impl Into<PathBuf>) -> File {
        File {
            abs_path: abs_path.into(),
            source_path: PathBuf::new(),
            target_path: None,
            serve_path: String::new(),
            abs_module_id: None,
            data: Vec::new(),
            data_string: String::new(),
            hash: sha1_hex(b""),
            file_type: FileType::Js,
            lazy: false,
            bare: false,
            imported: ImportedStatus::None,
            implicit: false,
            fake: false,
            has_errors: false,
            deps: None,
            missing_modules: BTreeMap::new(),
            alias: None,
            json_data: None,
            source_map: None,
            pending_errors: Vec::new(),
        }
    }

    /// Replaces the module body, keeping data, data_string and hash
    /// consistent with each other.
    pub fn set_data_string(&mut self, data_string: impl Into<String>) {
        self.data_string = data_string.into();
        self.data = self.data_string.as_bytes().to_vec();
        self.hash = sha1_hex(&self.data);
    }

    pub fn note_imported(&mut self, status: ImportedStatus) {
        self.imported = self.imported.join(status);
    }
}

pub fn sha1_hex(data: &[u8]) -> String {
    Sha1::default().digest(data).to_hex()
}

/// Merges two ImportInfo lists for the same specifier, deduplicating by
/// parent path (later wins). Entries without a parent, i.e. seed roots,
/// merge without deduplication.
pub fn merge_import_infos(target: &mut Vec<ImportInfo>, source: Vec<ImportInfo>) {
    for info in source {
        if info.parent_path.as_os_str().is_empty() {
            target.push(info);
            continue;
        }
        match target
            .iter_mut()
            .find(|existing| existing.parent_path == info.parent_path)
        {
            Some(existing) => *existing = info,
            None => target.push(info),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imported_status_is_totally_ordered() {
        assert!(ImportedStatus::None < ImportedStatus::Dynamic);
        assert!(ImportedStatus::Dynamic < ImportedStatus::Static);
        assert_eq!(
            ImportedStatus::Dynamic.join(ImportedStatus::Static),
            ImportedStatus::Static
        );
        assert_eq!(
            ImportedStatus::Static.join(ImportedStatus::Dynamic),
            ImportedStatus::Static
        );
    }

    #[test]
    fn set_data_string_keeps_hash_consistent() {
        let mut file = File::new("/app/main.js");
        file.set_data_string("module.exports = 1;");
        assert_eq!(file.data, file.data_string.as_bytes());
        assert_eq!(file.hash, sha1_hex(file.data_string.as_bytes()));
    }

    #[test]
    fn merge_dedupes_by_parent_path() {
        let mut target = vec![ImportInfo {
            parent_path: "/app/a.js".into(),
            dynamic: false,
            ..Default::default()
        }];
        merge_import_infos(
            &mut target,
            vec![ImportInfo {
                parent_path: "/app/a.js".into(),
                dynamic: true,
                ..Default::default()
            }],
        );
        assert_eq!(target.len(), 1);
        assert!(target[0].dynamic);
    }

    #[test]
    fn merge_keeps_parentless_entries() {
        let mut target = vec![ImportInfo::default()];
        merge_import_infos(&mut target, vec![ImportInfo::default()]);
        assert_eq!(target.len(), 2);
    }
}
