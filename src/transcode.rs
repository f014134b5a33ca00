use crate::arch::Arch;
use crate::file::ImportInfo;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use swc_common::sync::Lrc;
use swc_common::FileName;
use swc_common::FilePathMapping;
use swc_common::SourceFile;
use swc_common::SourceMap;
use swc_common::Span;
use swc_common::DUMMY_SP;
use swc_ecma_ast::*;
use swc_ecma_codegen::text_writer::JsWriter;
use swc_ecma_codegen::Emitter;
use swc_ecma_parser::lexer::Lexer;
use swc_ecma_parser::EsSyntax;
use swc_ecma_parser::Parser;
use swc_ecma_parser::StringInput;
use swc_ecma_parser::Syntax;
use swc_ecma_visit::Visit;
use swc_ecma_visit::VisitMut;
use swc_ecma_visit::VisitMutWith;
use swc_ecma_visit::VisitWith;

/// A positioned syntax error, scoped to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.message, self.line, self.column)
    }
}

impl std::error::Error for ParseError {}

/// Flags steering the module rewriter, derived from the bundle arch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub generate_let_declarations: bool,
    pub avoid_modern_syntax: bool,
    pub enforce_strict_mode: bool,
    pub dynamic_import: bool,
}

impl CompileOptions {
    pub fn for_arch(arch: &Arch) -> CompileOptions {
        let legacy = arch.is_legacy();
        CompileOptions {
            generate_let_declarations: !legacy,
            avoid_modern_syntax: legacy,
            enforce_strict_mode: false,
            dynamic_import: true,
        }
    }
}

fn new_parser(fm: &SourceFile) -> Parser<Lexer> {
    let lexer = Lexer::new(
        Syntax::Es(EsSyntax::default()),
        Default::default(),
        StringInput::from(fm),
        None,
    );
    Parser::new_from(lexer)
}

fn parse_error_at(cm: &Lrc<SourceMap>, span: Span, message: String) -> ParseError {
    let loc = cm.lookup_char_pos(span.lo);
    ParseError {
        message,
        line: loc.line,
        column: loc.col_display,
    }
}

// One `module.link(id, {...}, n)` call being accumulated.
struct LinkEntry {
    source: String,
    // imported name -> local binding; empty for side-effect-only imports.
    setters: Vec<(String, String)>,
    // re-export mappings: original name -> exported name.
    reexports: Vec<(String, String)>,
}

fn escape(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("{:?}", s))
}

/// Rewrites ES module syntax into the module-runtime calling convention:
/// imports and re-exports become `module.link(...)`, local exports become
/// `module.export(...)` / `module.exportDefault(...)`, and dynamic
/// `import(x)` becomes `module.dynamicImport(x)`. Bindings introduced by
/// imports are hoisted declarations assigned through live-binding setters.
pub fn compile_module(source: &str, options: &CompileOptions) -> Result<String, ParseError> {
    let cm: Lrc<SourceMap> = Lrc::new(SourceMap::new(FilePathMapping::empty()));
    let fm = cm.new_source_file(FileName::Anon.into(), source.into());
    let mut parser = new_parser(&fm);

    let module = parser
        .parse_module()
        .map_err(|e| parse_error_at(&cm, e.span(), e.kind().msg().to_string()))?;

    let mut links: Vec<LinkEntry> = vec![];
    let mut exports: Vec<(String, String)> = vec![];
    let mut hoisted: Vec<String> = vec![];
    let mut kept: Vec<ModuleItem> = vec![];

    for item in module.body {
        match item {
            ModuleItem::ModuleDecl(decl) => match decl {
                ModuleDecl::Import(import) => {
                    let mut entry = LinkEntry {
                        source: import.src.value.to_string(),
                        setters: vec![],
                        reexports: vec![],
                    };
                    for spec in import.specifiers {
                        let (imported, local) = match spec {
                            ImportSpecifier::Default(s) => ("default".to_string(), s.local),
                            ImportSpecifier::Namespace(s) => ("*".to_string(), s.local),
                            ImportSpecifier::Named(s) => {
                                let imported = match s.imported {
                                    Some(name) => export_name_string(&name),
                                    None => s.local.sym.to_string(),
                                };
                                (imported, s.local)
                            }
                        };
                        hoisted.push(local.sym.to_string());
                        entry.setters.push((imported, local.sym.to_string()));
                    }
                    links.push(entry);
                }
                ModuleDecl::ExportNamed(named) => match named.src {
                    Some(src) => {
                        let mut entry = LinkEntry {
                            source: src.value.to_string(),
                            setters: vec![],
                            reexports: vec![],
                        };
                        for spec in named.specifiers {
                            match spec {
                                ExportSpecifier::Named(s) => {
                                    let orig = export_name_string(&s.orig);
                                    let exported = s
                                        .exported
                                        .as_ref()
                                        .map(export_name_string)
                                        .unwrap_or_else(|| orig.clone());
                                    entry.reexports.push((orig, exported));
                                }
                                ExportSpecifier::Namespace(s) => {
                                    entry
                                        .reexports
                                        .push(("*".into(), export_name_string(&s.name)));
                                }
                                ExportSpecifier::Default(s) => {
                                    entry
                                        .reexports
                                        .push(("default".into(), s.exported.sym.to_string()));
                                }
                            }
                        }
                        links.push(entry);
                    }
                    None => {
                        for spec in named.specifiers {
                            if let ExportSpecifier::Named(s) = spec {
                                let local = export_name_string(&s.orig);
                                let exported = s
                                    .exported
                                    .as_ref()
                                    .map(export_name_string)
                                    .unwrap_or_else(|| local.clone());
                                exports.push((exported, local));
                            }
                        }
                    }
                },
                ModuleDecl::ExportAll(all) => {
                    links.push(LinkEntry {
                        source: all.src.value.to_string(),
                        setters: vec![],
                        reexports: vec![("*".into(), "*".into())],
                    });
                }
                ModuleDecl::ExportDecl(export) => {
                    for name in decl_names(&export.decl) {
                        exports.push((name.clone(), name));
                    }
                    kept.push(ModuleItem::Stmt(Stmt::Decl(export.decl)));
                }
                ModuleDecl::ExportDefaultExpr(default) => {
                    kept.push(ModuleItem::Stmt(export_default_stmt(*default.expr)));
                }
                ModuleDecl::ExportDefaultDecl(default) => match default.decl {
                    DefaultDecl::Fn(fn_expr) => match fn_expr.ident.clone() {
                        Some(ident) => {
                            kept.push(ModuleItem::Stmt(Stmt::Decl(Decl::Fn(FnDecl {
                                ident: ident.clone(),
                                declare: false,
                                function: fn_expr.function,
                            }))));
                            kept.push(ModuleItem::Stmt(export_default_stmt(Expr::Ident(
                                ident,
                            ))));
                        }
                        None => {
                            kept.push(ModuleItem::Stmt(export_default_stmt(Expr::Fn(
                                fn_expr,
                            ))));
                        }
                    },
                    DefaultDecl::Class(class_expr) => match class_expr.ident.clone() {
                        Some(ident) => {
                            kept.push(ModuleItem::Stmt(Stmt::Decl(Decl::Class(ClassDecl {
                                ident: ident.clone(),
                                declare: false,
                                class: class_expr.class,
                            }))));
                            kept.push(ModuleItem::Stmt(export_default_stmt(Expr::Ident(
                                ident,
                            ))));
                        }
                        None => {
                            kept.push(ModuleItem::Stmt(export_default_stmt(Expr::Class(
                                class_expr,
                            ))));
                        }
                    },
                    DefaultDecl::TsInterfaceDecl(_) => {}
                },
                ModuleDecl::TsImportEquals(_)
                | ModuleDecl::TsExportAssignment(_)
                | ModuleDecl::TsNamespaceExport(_) => {}
            },
            ModuleItem::Stmt(stmt) => kept.push(ModuleItem::Stmt(stmt)),
        }
    }

    // Rewrite dynamic import() calls in the retained statements.
    let mut rewritten = Module {
        span: DUMMY_SP,
        body: kept,
        shebang: None,
    };
    if options.dynamic_import {
        rewritten.visit_mut_with(&mut DynamicImportRewriter);
    }

    let mut buffer = vec![];
    {
        let mut emitter = Emitter {
            cfg: swc_ecma_codegen::Config::default(),
            cm: cm.clone(),
            comments: None,
            wr: JsWriter::new(cm.clone(), "\n", &mut buffer, None),
        };
        emitter.emit_module(&rewritten).unwrap();
    }
    let body = String::from_utf8_lossy(&buffer).to_string();

    let mut preamble = String::new();

    if !hoisted.is_empty() {
        let kind = if options.generate_let_declarations && !options.avoid_modern_syntax {
            "let"
        } else {
            "var"
        };
        preamble.push_str(&format!("{} {};\n", kind, hoisted.join(", ")));
    }

    for (index, link) in links.iter().enumerate() {
        if link.setters.is_empty() && link.reexports.is_empty() {
            preamble.push_str(&format!("module.link({});\n", escape(&link.source)));
            continue;
        }
        let mut entries: Vec<String> = vec![];
        for (imported, local) in &link.setters {
            entries.push(format!(
                "{}: function (v) {{ {} = v; }}",
                escape(imported),
                local
            ));
        }
        for (orig, exported) in &link.reexports {
            entries.push(format!("{}: {}", escape(orig), escape(exported)));
        }
        preamble.push_str(&format!(
            "module.link({}, {{ {} }}, {});\n",
            escape(&link.source),
            entries.join(", "),
            index
        ));
    }

    if !exports.is_empty() {
        let entries: Vec<String> = exports
            .iter()
            .map(|(exported, local)| {
                if options.avoid_modern_syntax {
                    format!(
                        "{}: function () {{ return {}; }}",
                        escape(exported),
                        local
                    )
                } else {
                    format!("{}: () => {}", escape(exported), local)
                }
            })
            .collect();
        preamble.push_str(&format!("module.export({{ {} }});\n", entries.join(", ")));
    }

    Ok(format!("{}{}", preamble, body))
}

fn export_default_stmt(expr: Expr) -> Stmt {
    call_stmt(member_expr("module", "exportDefault"), vec![expr])
}

fn export_name_string(name: &ModuleExportName) -> String {
    match name {
        ModuleExportName::Ident(ident) => ident.sym.to_string(),
        ModuleExportName::Str(s) => s.value.to_string(),
    }
}

fn member_expr(obj: &str, prop: &str) -> Expr {
    Expr::Member(MemberExpr {
        span: DUMMY_SP,
        obj: Box::new(Expr::Ident(Ident::new(obj.into(), DUMMY_SP))),
        prop: MemberProp::Ident(Ident::new(prop.into(), DUMMY_SP)),
    })
}

fn call_stmt(callee: Expr, args: Vec<Expr>) -> Stmt {
    Stmt::Expr(ExprStmt {
        span: DUMMY_SP,
        expr: Box::new(Expr::Call(CallExpr {
            span: DUMMY_SP,
            callee: Callee::Expr(Box::new(callee)),
            args: args
                .into_iter()
                .map(|expr| ExprOrSpread {
                    spread: None,
                    expr: Box::new(expr),
                })
                .collect(),
            type_args: None,
        })),
    })
}

// Bound identifiers introduced by an exported declaration.
fn decl_names(decl: &Decl) -> Vec<String> {
    match decl {
        Decl::Fn(f) => vec![f.ident.sym.to_string()],
        Decl::Class(c) => vec![c.ident.sym.to_string()],
        Decl::Var(var) => {
            let mut names = vec![];
            for declarator in &var.decls {
                collect_pat_names(&declarator.name, &mut names);
            }
            names
        }
        _ => vec![],
    }
}

fn collect_pat_names(pat: &Pat, names: &mut Vec<String>) {
    match pat {
        Pat::Ident(ident) => names.push(ident.id.sym.to_string()),
        Pat::Array(array) => {
            for elem in array.elems.iter().flatten() {
                collect_pat_names(elem, names);
            }
        }
        Pat::Object(object) => {
            for prop in &object.props {
                match prop {
                    ObjectPatProp::KeyValue(kv) => collect_pat_names(&kv.value, names),
                    ObjectPatProp::Assign(assign) => names.push(assign.key.sym.to_string()),
                    ObjectPatProp::Rest(rest) => collect_pat_names(&rest.arg, names),
                }
            }
        }
        Pat::Assign(assign) => collect_pat_names(&assign.left, names),
        Pat::Rest(rest) => collect_pat_names(&rest.arg, names),
        Pat::Invalid(_) | Pat::Expr(_) => {}
    }
}

struct DynamicImportRewriter;

impl VisitMut for DynamicImportRewriter {
    fn visit_mut_call_expr(&mut self, call: &mut CallExpr) {
        call.visit_mut_children_with(self);
        if matches!(call.callee, Callee::Import(_)) {
            call.callee = Callee::Expr(Box::new(member_expr("module", "dynamicImport")));
        }
    }
}

struct ImportCollector {
    imports: BTreeMap<String, ImportInfo>,
}

impl ImportCollector {
    fn add(&mut self, specifier: &str, dynamic: bool, possibly_spurious: bool) {
        match self.imports.get_mut(specifier) {
            Some(info) => {
                // A specifier reached both ways counts as static, and a
                // single solid occurrence clears the spurious flag.
                info.dynamic = info.dynamic && dynamic;
                info.possibly_spurious = info.possibly_spurious && possibly_spurious;
            }
            None => {
                self.imports.insert(
                    specifier.to_string(),
                    ImportInfo {
                        dynamic,
                        possibly_spurious,
                        ..Default::default()
                    },
                );
            }
        }
    }

    fn first_string_arg(call: &CallExpr) -> Option<String> {
        match call.args.first() {
            Some(ExprOrSpread { spread: None, expr }) => match &**expr {
                Expr::Lit(Lit::Str(s)) => Some(s.value.to_string()),
                _ => None,
            },
            _ => None,
        }
    }
}

impl Visit for ImportCollector {
    fn visit_import_decl(&mut self, import: &ImportDecl) {
        self.add(&import.src.value, false, false);
    }

    fn visit_named_export(&mut self, named: &NamedExport) {
        if let Some(src) = &named.src {
            self.add(&src.value, false, false);
        }
    }

    fn visit_export_all(&mut self, all: &ExportAll) {
        self.add(&all.src.value, false, false);
    }

    fn visit_call_expr(&mut self, call: &CallExpr) {
        call.visit_children_with(self);

        if matches!(call.callee, Callee::Import(_)) {
            if let Some(id) = Self::first_string_arg(call) {
                self.add(&id, true, false);
            }
            return;
        }

        let callee = match &call.callee {
            Callee::Expr(expr) => &**expr,
            _ => return,
        };

        match callee {
            // CommonJS requires may live in never-taken branches, so a
            // failure to resolve them must stay quiet.
            Expr::Ident(ident) if ident.sym == *"require" => {
                if let Some(id) = Self::first_string_arg(call) {
                    self.add(&id, false, true);
                }
            }
            Expr::Member(member) => {
                let obj_is_module = matches!(
                    &*member.obj,
                    Expr::Ident(ident) if ident.sym == *"module"
                );
                if !obj_is_module {
                    return;
                }
                let prop = match &member.prop {
                    MemberProp::Ident(ident) => ident.sym.as_str(),
                    _ => return,
                };
                match prop {
                    "link" => {
                        if let Some(id) = Self::first_string_arg(call) {
                            self.add(&id, false, false);
                        }
                    }
                    "dynamicImport" => {
                        if let Some(id) = Self::first_string_arg(call) {
                            self.add(&id, true, false);
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

/// Extracts every import specifier from a module body, which may be raw
/// ES syntax or an already-compiled body full of `module.link` calls.
pub fn find_imported_module_identifiers(
    source: &str,
) -> Result<BTreeMap<String, ImportInfo>, ParseError> {
    let cm: Lrc<SourceMap> = Lrc::new(SourceMap::new(FilePathMapping::empty()));
    let fm = cm.new_source_file(FileName::Anon.into(), source.into());
    let mut parser = new_parser(&fm);

    let program = parser
        .parse_program()
        .map_err(|e| parse_error_at(&cm, e.span(), e.kind().msg().to_string()))?;

    let mut collector = ImportCollector {
        imports: BTreeMap::new(),
    };
    program.visit_with(&mut collector);
    Ok(collector.imports)
}

/// Speculative parse used for files with unknown extensions.
pub fn can_be_parsed_as_plain_js(source: &str) -> bool {
    let cm: Lrc<SourceMap> = Lrc::new(SourceMap::new(FilePathMapping::empty()));
    let fm = cm.new_source_file(FileName::Anon.into(), source.into());
    let mut parser = new_parser(&fm);
    let parsed = parser.parse_program();
    parsed.is_ok() && parser.take_errors().is_empty()
}

/// Wraps a stylesheet in the module-runtime CSS shim.
pub fn css_to_common_js(css: &str, _hash: &str) -> String {
    format!(
        "module.exports = require(\"meteor/modules\").addStyles({});",
        escape(css)
    )
}

/// Byte-deterministic CommonJS rendition of a parsed JSON body.
pub fn json_data_to_common_js(data: &Value) -> String {
    format!(
        "module.exports = {};",
        serde_json::to_string_pretty(data).unwrap_or_else(|_| "null".into())
    )
}
