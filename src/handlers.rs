use crate::arch::Arch;
use crate::cache;
use crate::file::sha1_hex;
use crate::file::File;
use crate::transcode;
use crate::transcode::CompileOptions;
use crate::transcode::ParseError;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::path::Path;
use std::path::PathBuf;

lazy_static! {
    static ref SHEBANG: Regex = Regex::new(r"^#![^\n]*").unwrap();
}

fn strip_shebang(source: &str) -> Cow<str> {
    SHEBANG.replace(source, "")
}

// core-js ships pre-built CommonJS that must not be rewritten.
fn in_core_js(abs_path: &Path) -> bool {
    let mut components = abs_path.components().peekable();
    while let Some(component) = components.next() {
        if component.as_os_str() == "node_modules"
            && components.peek().map(|c| c.as_os_str()) == Some("core-js".as_ref())
        {
            return true;
        }
    }
    false
}

/// Per-extension transcoders, parameterized by the bundle arch and the
/// optional on-disk compile cache.
#[derive(Debug, Clone)]
pub struct DefaultHandlers {
    bundle_arch: Arch,
    cache_dir: Option<PathBuf>,
}

impl DefaultHandlers {
    pub fn new(bundle_arch: Arch, cache_dir: Option<PathBuf>) -> DefaultHandlers {
        DefaultHandlers {
            bundle_arch,
            cache_dir,
        }
    }

    /// Transcodes a file body for the given extension. Ok(None) means no
    /// handler applies and the file should not be emitted.
    pub fn handle(&self, ext: &str, file: &mut File) -> Result<Option<String>, ParseError> {
        match ext {
            "js" | "mjs" => self.js(file).map(Some),
            "json" => self.json(file).map(Some),
            "css" => Ok(Some(self.css(file))),
            _ => {
                // Unknown extension: treat as JS if it parses as JS.
                if cache::can_be_parsed_as_plain_js(&file.data_string, &file.hash) {
                    self.js(file).map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn js(&self, file: &File) -> Result<String, ParseError> {
        let source = strip_shebang(&file.data_string);
        if in_core_js(&file.abs_path) {
            return Ok(source.into_owned());
        }
        let source_hash = sha1_hex(source.as_bytes());
        cache::compile_with_cache(
            &source,
            &source_hash,
            &self.bundle_arch,
            self.cache_dir.as_deref(),
            &CompileOptions::for_arch(&self.bundle_arch),
        )
    }

    fn json(&self, file: &mut File) -> Result<String, ParseError> {
        let data: Value = serde_json::from_str(&file.data_string).map_err(|e| ParseError {
            message: e.to_string(),
            line: e.line(),
            column: e.column(),
        })?;
        let body = transcode::json_data_to_common_js(&data);
        file.json_data = Some(data);
        Ok(body)
    }

    fn css(&self, file: &File) -> String {
        cache::css_to_common_js(&file.data_string, &file.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileType;

    fn handlers() -> DefaultHandlers {
        DefaultHandlers::new(Arch::new("web.browser"), None)
    }

    fn file_with(path: &str, body: &str) -> File {
        let mut file = File::new(path);
        file.set_data_string(body);
        file
    }

    #[test]
    fn js_strips_shebang_and_compiles() {
        let mut file = file_with("/app/tool.js", "#!/usr/bin/env node\nimport \"./x.js\";");
        let body = handlers().handle("js", &mut file).unwrap().unwrap();
        assert!(!body.contains("#!"));
        assert!(body.contains("module.link(\"./x.js\");"));
    }

    #[test]
    fn core_js_passes_through_unchanged() {
        let mut file = file_with(
            "/app/node_modules/core-js/modules/es.array.js",
            "require(\"../internals/export\");",
        );
        let body = handlers().handle("js", &mut file).unwrap().unwrap();
        assert_eq!(body, "require(\"../internals/export\");");
    }

    #[test]
    fn json_keeps_the_parsed_tree() {
        let mut file = file_with("/app/config.json", "{\"a\": 1}");
        file.file_type = FileType::Json;
        let body = handlers().handle("json", &mut file).unwrap().unwrap();
        assert!(body.starts_with("module.exports = {"));
        assert_eq!(file.json_data.as_ref().unwrap()["a"], 1);
    }

    #[test]
    fn json_errors_carry_positions() {
        let mut file = file_with("/app/bad.json", "{\"a\": }");
        let err = handlers().handle("json", &mut file).unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.column > 0);
    }

    #[test]
    fn css_wraps_in_the_style_shim() {
        let mut file = file_with("/app/app.css", "body { color: red; }");
        let body = handlers().handle("css", &mut file).unwrap().unwrap();
        assert!(body.contains("addStyles"));
        assert!(body.contains("color: red"));
    }

    #[test]
    fn unknown_extension_that_parses_as_js_is_js() {
        let mut file = file_with("/app/script.weird", "exports.ok = true;");
        let body = handlers().handle("weird", &mut file).unwrap().unwrap();
        assert!(body.contains("exports.ok = true;"));
    }

    #[test]
    fn unknown_extension_that_is_not_js_is_skipped() {
        let mut file = file_with("/app/notes.txt", "not : javascript ; at all {");
        assert!(handlers().handle("txt", &mut file).unwrap().is_none());
    }
}
