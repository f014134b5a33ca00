use crate::arch::Arch;
use crate::optimistic;
use crate::transcode;
use crate::transcode::CompileOptions;
use crate::transcode::ParseError;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use tracing::debug;

// Deferred cache writes queue here; a full queue skips persistence,
// which is safe because every entry is reconstructible from source.
const WRITER_QUEUE_DEPTH: usize = 128;

lazy_static! {
    static ref COMPILE_CACHE: Mutex<HashMap<(String, String), Arc<String>>> =
        Mutex::new(HashMap::new());
    static ref PLAIN_JS_CACHE: Mutex<HashMap<String, bool>> = Mutex::new(HashMap::new());
    static ref CSS_CACHE: Mutex<HashMap<String, Arc<String>>> = Mutex::new(HashMap::new());
    static ref WRITER: SyncSender<(PathBuf, Vec<u8>)> = {
        let (tx, rx) = mpsc::sync_channel::<(PathBuf, Vec<u8>)>(WRITER_QUEUE_DEPTH);
        thread::spawn(move || {
            while let Ok((path, data)) = rx.recv() {
                if let Err(e) = optimistic::write_file_atomically(&path, &data) {
                    debug!("cache write failed for {}: {}", path.display(), e);
                }
            }
        });
        tx
    };
}

fn cache_file_path(cache_dir: &Path, arch: &Arch, source_hash: &str) -> PathBuf {
    cache_dir
        .join(arch.tag())
        .join(format!("reify-{}.js", source_hash))
}

/// Memoized module compilation, keyed by `(source-hash, arch)`. When a
/// cache directory is configured, compiled bodies are persisted there on
/// a deferred task and reloaded by later invocations.
pub fn compile_with_cache(
    source: &str,
    source_hash: &str,
    arch: &Arch,
    cache_dir: Option<&Path>,
    options: &CompileOptions,
) -> Result<String, ParseError> {
    let key = (source_hash.to_string(), arch.tag().to_string());

    if let Some(code) = COMPILE_CACHE.lock().unwrap().get(&key) {
        return Ok(code.as_ref().clone());
    }

    if let Some(dir) = cache_dir {
        let path = cache_file_path(dir, arch, source_hash);
        if let Ok(data) = optimistic::read_file(&path) {
            let code = Arc::new(String::from_utf8_lossy(&data).to_string());
            COMPILE_CACHE.lock().unwrap().insert(key, code.clone());
            return Ok(code.as_ref().clone());
        }
    }

    let code = Arc::new(transcode::compile_module(source, options)?);
    COMPILE_CACHE
        .lock()
        .unwrap()
        .insert(key, code.clone());

    if let Some(dir) = cache_dir {
        let path = cache_file_path(dir, arch, source_hash);
        // The scan never waits on persistence.
        if WRITER
            .try_send((path, code.as_bytes().to_vec()))
            .is_err()
        {
            debug!("cache writer queue full, skipping reify-{}.js", source_hash);
        }
    }

    Ok(code.as_ref().clone())
}

/// Hash-memoized speculative parse for unknown-extension files.
pub fn can_be_parsed_as_plain_js(source: &str, hash: &str) -> bool {
    if let Some(result) = PLAIN_JS_CACHE.lock().unwrap().get(hash) {
        return *result;
    }
    let result = transcode::can_be_parsed_as_plain_js(source);
    PLAIN_JS_CACHE
        .lock()
        .unwrap()
        .insert(hash.to_string(), result);
    result
}

/// Hash-memoized CSS module wrapping.
pub fn css_to_common_js(css: &str, hash: &str) -> String {
    if let Some(body) = CSS_CACHE.lock().unwrap().get(hash) {
        return body.as_ref().clone();
    }
    let body = Arc::new(transcode::css_to_common_js(css, hash));
    CSS_CACHE
        .lock()
        .unwrap()
        .insert(hash.to_string(), body.clone());
    body.as_ref().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::file::sha1_hex;
    use assert_fs::TempDir;
    use std::time::Duration;
    use std::time::Instant;

    fn options() -> CompileOptions {
        CompileOptions::for_arch(&Arch::new("web.browser"))
    }

    #[test]
    fn identical_inputs_compile_identically() {
        let source = "import { a } from \"./a.js\";\nconsole.log(a);";
        let hash = sha1_hex(source.as_bytes());
        let arch = Arch::new("web.browser");

        let first = compile_with_cache(source, &hash, &arch, None, &options()).unwrap();
        let second = compile_with_cache(source, &hash, &arch, None, &options()).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("module.link(\"./a.js\""));
    }

    #[test]
    fn compiled_bodies_are_persisted_under_arch_dirs() {
        let tmp = TempDir::new().unwrap();
        let source = "export const persisted = 1;";
        let hash = sha1_hex(source.as_bytes());
        let arch = Arch::new("web.cordova");

        let code =
            compile_with_cache(source, &hash, &arch, Some(tmp.path()), &options()).unwrap();

        let expected = tmp
            .path()
            .join("web.cordova")
            .join(format!("reify-{}.js", hash));

        // Writes are deferred; wait for the writer to catch up.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !expected.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(std::fs::read_to_string(&expected).unwrap(), code);
    }

    #[test]
    fn disk_cache_short_circuits_compilation() {
        let tmp = TempDir::new().unwrap();
        let arch = Arch::new("os");
        // A hash nothing else uses, pointing at a pre-seeded cache file.
        let hash = sha1_hex(b"disk-cache-short-circuits-compilation");
        let path = tmp.path().join("os").join(format!("reify-{}.js", hash));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "cached-body;").unwrap();

        // The source is unparseable, proving the result came from disk.
        let code =
            compile_with_cache("this is ! not js", &hash, &arch, Some(tmp.path()), &options())
                .unwrap();
        assert_eq!(code, "cached-body;");
    }

    #[test]
    fn plain_js_sniff_is_memoized() {
        let hash = sha1_hex(b"plain-js-sniff-is-memoized");
        assert!(can_be_parsed_as_plain_js("exports.ok = true;", &hash));
        // Second call hits the cache keyed by hash, not by content.
        assert!(can_be_parsed_as_plain_js("not : valid : js", &hash));
    }
}
