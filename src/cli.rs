use crate::arch::Arch;
use crate::file::File;
use crate::file::FileType;
use crate::file::ImportedStatus;
use crate::handlers::DefaultHandlers;
use crate::messages;
use crate::optimistic;
use crate::scanner::ImportScanner;
use crate::scanner::ScannerOptions;
use crate::watch;
use crate::watch::WatchSet;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::ArgAction;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueHint;
use colored::*;
use path_absolutize::*;
use serde_json::json;
use serde_json::Value;
use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Scan entry modules and assemble the output file set",
        arg_required_else_help = true
    )]
    Scan(ScanArgs),
}

#[derive(Debug, Args)]
struct ScanArgs {
    #[arg(
        help = "Entry module files (relative to the source root)",
        value_hint = ValueHint::FilePath,
        required = true
    )]
    entries: Vec<PathBuf>,
    #[arg(
        help = "Target architecture (web.browser, web.browser.legacy, os, ...)",
        long,
        value_name = "ARCH",
        default_value = "web.browser"
    )]
    arch: String,
    #[arg(
        help = "Application source root (default: current directory)",
        long = "source-root",
        value_name = "DIR",
        value_hint = ValueHint::DirPath
    )]
    source_root: Option<PathBuf>,
    #[arg(
        help = "Additional node_modules directories to search",
        long = "node-modules",
        value_name = "DIR",
        value_hint = ValueHint::DirPath
    )]
    node_modules: Vec<PathBuf>,
    #[arg(
        help = "Additional resolvable extensions (with leading dot)",
        long = "extension",
        value_name = "EXT"
    )]
    extensions: Vec<String>,
    #[arg(
        help = "Scan as the given package instead of an application",
        long,
        value_name = "NAME"
    )]
    package: Option<String>,
    #[arg(
        help = "Directory for the persistent compile cache",
        long = "cache-dir",
        value_name = "DIR",
        value_hint = ValueHint::DirPath
    )]
    cache_dir: Option<PathBuf>,
    #[arg(
        help = "Write emitted module bodies under this directory",
        long,
        value_name = "DIR",
        value_hint = ValueHint::DirPath
    )]
    out: Option<PathBuf>,
    #[arg(
        help = "Print a machine-readable manifest instead of a report",
        long,
        action = ArgAction::SetTrue
    )]
    json: bool,
    #[arg(
        help = "Keep running and rescan when watched files change",
        long,
        action = ArgAction::SetTrue
    )]
    watch: bool,
}

pub fn process_cli_arguments() {
    let cli = Cli::parse();
    match cli.command {
        Command::Scan(args) => run_scan(args),
    }
}

fn run_scan(args: ScanArgs) {
    let cwd = env::current_dir().unwrap_or_else(|e| messages::fatal(e.into()));
    let source_root = args
        .source_root
        .clone()
        .unwrap_or(cwd)
        .absolutize()
        .map(|path| path.to_path_buf())
        .unwrap();

    let mut node_modules_paths = vec![source_root.join("node_modules")];
    for path in &args.node_modules {
        node_modules_paths.push(path.absolutize().map(|p| p.to_path_buf()).unwrap());
    }

    let mut extensions = vec![".js".to_string(), ".json".to_string()];
    extensions.extend(args.extensions.iter().cloned());

    let options = ScannerOptions {
        name: args.package.clone(),
        bundle_arch: Arch::new(args.arch.clone()),
        extensions,
        source_root: source_root.clone(),
        node_modules_paths,
        watch_set: WatchSet::new(),
        cache_dir: args.cache_dir.clone(),
    };

    let watch_set = scan_once(&options, &args).unwrap_or_else(|e| messages::fatal(e));

    if args.watch {
        watch::start(&source_root, watch_set, move || {
            match scan_once(&options, &args) {
                Ok(watch_set) => watch_set,
                Err(e) => {
                    // Watch mode survives a broken rescan; the next file
                    // change gets another chance.
                    eprintln!("{}", messages::render_scan_error(&e));
                    WatchSet::new()
                }
            }
        });
    }
}

fn scan_once(options: &ScannerOptions, args: &ScanArgs) -> Result<WatchSet> {
    let mut scanner = ImportScanner::new(options.clone());

    let mut seeds = vec![];
    for entry in &args.entries {
        seeds.push(load_entry_file(options, entry)?);
    }
    scanner.add_input_files(seeds);
    scanner.scan_imports();

    let missing = scanner.all_missing_modules().clone();
    let messages: Vec<String> = scanner
        .messages()
        .iter()
        .map(|message| message.to_string())
        .collect();
    let had_errors = !scanner.messages().is_empty();

    let files = scanner.output_files();

    if let Some(out) = args.out.as_ref() {
        for file in &files {
            let target = out.join(&file.serve_path);
            optimistic::write_file_atomically(&target, &file.data)?;
        }
    }

    if args.json {
        println!("{}", manifest(&options.bundle_arch, &files, &missing));
    } else {
        print_report(&options.bundle_arch, &files, &missing);
    }

    for message in &messages {
        eprintln!("{}", message);
    }

    let watch_set = scanner.watch_set().clone();

    if had_errors && !args.watch {
        std::process::exit(1);
    }

    Ok(watch_set)
}

// The CLI stands in for the upstream compiler: entries are read from
// disk and transcoded before seeding the scanner.
fn load_entry_file(options: &ScannerOptions, entry: &Path) -> Result<File> {
    let abs = options.source_root.join(entry);
    let source = fs::read_to_string(&abs)
        .with_context(|| format!("Failed to read entry {}", abs.display()))?;
    let ext = abs
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let mut file = File::new(&abs);
    file.source_path = entry.to_path_buf();
    file.file_type = FileType::from_extension(&ext);
    file.set_data_string(source);

    let handlers = DefaultHandlers::new(options.bundle_arch.clone(), options.cache_dir.clone());
    match handlers.handle(&ext, &mut file) {
        Ok(Some(body)) => file.set_data_string(body),
        Ok(None) => bail!("no handler for entry {}", abs.display()),
        Err(e) => bail!("failed to compile {}: {}", abs.display(), e),
    }

    Ok(file)
}

fn imported_value(status: ImportedStatus) -> Value {
    match status {
        ImportedStatus::None => Value::Bool(false),
        ImportedStatus::Dynamic => Value::String("dynamic".into()),
        ImportedStatus::Static => Value::String("static".into()),
    }
}

fn manifest(arch: &Arch, files: &[&File], missing: &MissingMap) -> Value {
    json!({
        "arch": arch.tag(),
        "files": files.iter().map(|file| {
            json!({
                "sourcePath": file.source_path,
                "servePath": file.serve_path,
                "absModuleId": file.abs_module_id,
                "hash": file.hash,
                "type": file.file_type.as_str(),
                "lazy": file.lazy,
                "bare": file.bare,
                "imported": imported_value(file.imported),
                "alias": file.alias.as_ref().map(|alias| alias.abs_module_id.clone()),
            })
        }).collect::<Vec<_>>(),
        "missingModules": missing.iter().map(|(id, infos)| {
            let edges = infos.iter().map(|info| {
                json!({
                    "parentPath": info.parent_path,
                    "dynamic": info.dynamic,
                    "possiblySpurious": info.possibly_spurious,
                })
            }).collect::<Vec<_>>();
            (id.clone(), Value::Array(edges))
        }).collect::<serde_json::Map<String, Value>>(),
    })
}

type MissingMap = std::collections::BTreeMap<String, Vec<crate::file::ImportInfo>>;

fn print_report(arch: &Arch, files: &[&File], missing: &MissingMap) {
    println!(
        "{} {} module(s) for {}",
        "Scanned".green(),
        files.len(),
        arch
    );

    for file in files {
        let status = match file.imported {
            ImportedStatus::Static => "static".green(),
            ImportedStatus::Dynamic => "dynamic".yellow(),
            ImportedStatus::None => "eager".normal(),
        };
        let mut line = format!("  {} {}", status, file.serve_path);
        if let Some(alias) = file.alias.as_ref() {
            line.push_str(&format!(" -> {}", alias.abs_module_id));
        }
        println!("{}", line);
    }

    if !missing.is_empty() {
        println!("{}", "Missing modules:".yellow());
        for (id, infos) in missing {
            let spurious = infos.iter().all(|info| info.possibly_spurious);
            let suffix = if spurious { " (possibly spurious)" } else { "" };
            println!("  {}{}", id, suffix);
        }
    }
}
