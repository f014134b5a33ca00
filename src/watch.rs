use colored::*;
use notify::Config;
use notify::Event;
use notify::EventHandler;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use std::time::Instant;

/// The set of files a build depends on. Change detection over this set
/// is what triggers incremental rebuilds.
#[derive(Debug, Default, Clone)]
pub struct WatchSet {
    files: BTreeMap<PathBuf, Option<String>>,
}

impl WatchSet {
    pub fn new() -> WatchSet {
        WatchSet::default()
    }

    /// Records a dependency on a file, keyed by the hash observed when
    /// it was read. A later entry for the same path wins.
    pub fn add_file(&mut self, abs_path: impl Into<PathBuf>, hash: Option<String>) {
        self.files.insert(abs_path.into(), hash);
    }

    pub fn contains(&self, abs_path: &Path) -> bool {
        self.files.contains_key(abs_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &Option<String>)> {
        self.files.iter()
    }

    pub fn merge(&mut self, other: WatchSet) {
        self.files.extend(other.files);
    }
}

struct WatcherHandler {
    // The sending-half of the change notification channel.
    tx: mpsc::Sender<PathBuf>,
    // Event timestamps, used to squash duplicate notifications.
    records: BTreeMap<PathBuf, Instant>,
}

impl EventHandler for WatcherHandler {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        let event = match event {
            Ok(event) => event,
            Err(_) => return,
        };
        let path = match event.paths.first() {
            Some(path) => path.to_owned(),
            None => return,
        };

        match self.records.get_mut(&path) {
            Some(instant) => {
                // Duplicate events arrive in bursts; accept changes with
                // more than 250ms time difference.
                if Instant::now() - *instant > Duration::from_millis(250) {
                    *instant = Instant::now();
                    let _ = self.tx.send(path);
                }
            }
            None => {
                self.records.insert(path.clone(), Instant::now());
                let _ = self.tx.send(path);
            }
        }
    }
}

/// Watches the source root and re-runs `rescan` whenever a file in the
/// current watch set changes. `rescan` returns the watch set for the
/// next round.
pub fn start<F>(source_root: &Path, initial: WatchSet, mut rescan: F)
where
    F: FnMut() -> WatchSet,
{
    let (sender, receiver) = mpsc::channel::<PathBuf>();

    let mut watcher = match RecommendedWatcher::new(
        WatcherHandler {
            tx: sender,
            records: BTreeMap::new(),
        },
        Config::default().with_compare_contents(true),
    ) {
        Ok(watcher) => watcher,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    println!(
        "{}",
        format!("[modscan] watching {}", source_root.display()).yellow()
    );

    if let Err(e) = watcher.watch(source_root, RecursiveMode::Recursive) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let mut watch_set = initial;

    loop {
        let path = match receiver.recv() {
            Ok(path) => path,
            Err(_) => break,
        };

        // Only files the previous scan depended on warrant a rescan.
        if !watch_set.contains(&path) {
            continue;
        }

        println!("{}", "[modscan] file change detected!".green());
        println!("[modscan] {}", path.display());
        watch_set = rescan();
    }
}
