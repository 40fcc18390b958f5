//! File system watcher feeding the change processor.
//!
//! Wraps the platform watcher from the `notify` crate. An [`EventTranslator`]
//! turns its events into [`Notification`]s, which are handled directly on
//! notify's delivery thread.
//!
//! Renames need state. inotify reports one rename as a `From` half, a `To`
//! half and a combined `Both` event, all carrying the same tracker cookie,
//! while other backends only send the two halves. The translator pairs halves
//! into a single move and holds an unpaired source back for a short window
//! before giving up on it. It also keeps an index of the directories under
//! the root, because a renamed-away path can no longer be inspected.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use jwalk::{Parallelism, WalkDir};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::sync::error::Result;
use crate::sync::processor::{ChangeEventProcessor, Notification, NotificationKind};

/// How long the source half of a rename waits for its destination.
pub const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(100);

/// Directories that disappeared stay known for this many pairing windows, so
/// late events about them are still classified as directory events.
const VANISHED_DIR_WINDOWS: u32 = 10;

/// Live watch over a processor's root directory. Dropping it stops the watch.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    processor: Arc<ChangeEventProcessor>,
    watched_paths: Vec<PathBuf>,
    flusher: JoinHandle<()>,
}

impl FileWatcher {
    /// Watch `processor.root()` recursively.
    pub fn start(processor: Arc<ChangeEventProcessor>) -> Result<Self> {
        let root = processor.root().to_path_buf();

        let mut translator = EventTranslator::new(RENAME_PAIR_WINDOW);
        translator.index_tree(&root);
        let translator = Arc::new(Mutex::new(translator));

        let handler = Arc::clone(&processor);
        let events = Arc::clone(&translator);
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    trace!(?event, "raw watcher event");
                    let notifications = lock(&events).translate(&event, Instant::now());
                    for notification in notifications {
                        handler.handle(notification);
                    }
                }
                Err(err) => warn!("watcher error: {err}"),
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )?;

        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "watching for local changes");

        // Unpaired rename halves are released even when no further event
        // arrives to trigger a flush.
        let handler = Arc::clone(&processor);
        let flusher = processor.runtime().spawn(async move {
            let mut ticks = tokio::time::interval(RENAME_PAIR_WINDOW);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let due = lock(&translator).flush(Instant::now());
                for notification in due {
                    handler.handle(notification);
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            processor,
            watched_paths: vec![root],
            flusher,
        })
    }

    pub fn processor(&self) -> &Arc<ChangeEventProcessor> {
        &self.processor
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched_paths
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

fn lock(translator: &Mutex<EventTranslator>) -> MutexGuard<'_, EventTranslator> {
    translator.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct PendingSource {
    path: PathBuf,
    seen: Instant,
}

/// Stateful translation of notify events into notifications.
///
/// Access and metadata-only events carry no content change and are dropped.
/// Rename halves are paired by tracker cookie, or by arrival order when the
/// backend gives none:
///
/// - a source followed by its destination becomes one move, and any later
///   half or combined event for the same cookie is dropped;
/// - a source with no destination within the window becomes a delete;
/// - a destination with no source becomes a create.
#[derive(Debug)]
pub struct EventTranslator {
    window: Duration,
    directories: HashSet<PathBuf>,
    vanished: HashMap<PathBuf, Instant>,
    sources: HashMap<Option<usize>, PendingSource>,
    paired: HashMap<usize, Instant>,
}

impl EventTranslator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            directories: HashSet::new(),
            vanished: HashMap::new(),
            sources: HashMap::new(),
            paired: HashMap::new(),
        }
    }

    /// Record `path` and every directory below it as known directories.
    pub fn index_tree(&mut self, path: &Path) {
        let walk = WalkDir::new(path)
            .parallelism(Parallelism::Serial)
            .skip_hidden(false)
            .follow_links(false);

        for entry in walk {
            match entry {
                Ok(entry) if entry.file_type().is_dir() => {
                    self.directories.insert(entry.path());
                }
                Ok(_) => {}
                Err(err) => debug!(path = %path.display(), "cannot index directory: {err}"),
            }
        }
    }

    /// Whether `path` is, or very recently was, a directory under the root.
    pub fn is_known_directory(&self, path: &Path) -> bool {
        self.directories.contains(path) || self.vanished.contains_key(path)
    }

    /// Source halves still waiting for their destination.
    pub fn pending_renames(&self) -> usize {
        self.sources.len()
    }

    /// Translate one event observed at `now`. Rename sources whose window
    /// has passed are released first.
    pub fn translate(&mut self, event: &Event, now: Instant) -> Vec<Notification> {
        let mut out = self.flush(now);

        match &event.kind {
            EventKind::Create(kind) => {
                for path in &event.paths {
                    let is_directory = match kind {
                        CreateKind::Folder => true,
                        CreateKind::File => false,
                        _ => path.is_dir(),
                    };
                    if is_directory {
                        self.index_tree(path);
                    }
                    out.push(notification(NotificationKind::Created, path, is_directory));
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => self.rename(*mode, event, now, &mut out),
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for path in &event.paths {
                    let is_directory = self.is_known_directory(path) || path.is_dir();
                    out.push(notification(NotificationKind::Modified, path, is_directory));
                }
            }
            EventKind::Remove(kind) => {
                for path in &event.paths {
                    let is_directory = match kind {
                        RemoveKind::Folder => true,
                        RemoveKind::File => false,
                        _ => self.is_known_directory(path),
                    };
                    if is_directory {
                        self.forget_tree(path, now);
                    }
                    out.push(notification(NotificationKind::Deleted, path, is_directory));
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }

        out
    }

    /// Release rename sources that waited a full window as deletes, and
    /// expire old pairing and directory state.
    pub fn flush(&mut self, now: Instant) -> Vec<Notification> {
        let window = self.window;
        let expired: Vec<Option<usize>> = self
            .sources
            .iter()
            .filter(|(_, source)| now.saturating_duration_since(source.seen) >= window)
            .map(|(key, _)| *key)
            .collect();

        let mut released: Vec<PendingSource> = expired
            .into_iter()
            .filter_map(|key| self.sources.remove(&key))
            .collect();
        released.sort_by_key(|source| source.seen);

        let out: Vec<Notification> = released
            .into_iter()
            .map(|source| self.source_gone(source.path, now))
            .collect();

        self.paired
            .retain(|_, at| now.saturating_duration_since(*at) < window);
        let grace = window * VANISHED_DIR_WINDOWS;
        self.vanished
            .retain(|_, at| now.saturating_duration_since(*at) < grace);

        out
    }

    fn rename(
        &mut self,
        mode: RenameMode,
        event: &Event,
        now: Instant,
        out: &mut Vec<Notification>,
    ) {
        let tracker = event.tracker();
        if let Some(cookie) = tracker {
            if self.paired.contains_key(&cookie) {
                trace!(cookie, "dropping rename event for an emitted move");
                return;
            }
        }

        let paths = &event.paths;
        match mode {
            RenameMode::Both if paths.len() == 2 => {
                self.sources.remove(&tracker);
                if let Some(cookie) = tracker {
                    self.paired.insert(cookie, now);
                }
                out.push(self.moved(paths[0].clone(), paths[1].clone(), now));
            }
            RenameMode::From => {
                for path in paths {
                    let source = PendingSource {
                        path: path.clone(),
                        seen: now,
                    };
                    if let Some(previous) = self.sources.insert(tracker, source) {
                        out.push(self.source_gone(previous.path, now));
                    }
                }
            }
            RenameMode::To => {
                for path in paths {
                    match self.sources.remove(&tracker) {
                        Some(source) => {
                            if let Some(cookie) = tracker {
                                self.paired.insert(cookie, now);
                            }
                            out.push(self.moved(source.path, path.clone(), now));
                        }
                        None => out.push(self.target_arrived(path)),
                    }
                }
            }
            // Backends that cannot pair renames: whatever still exists arrived.
            _ => {
                for path in paths {
                    if path.exists() {
                        out.push(self.target_arrived(path));
                    } else {
                        out.push(self.source_gone(path.clone(), now));
                    }
                }
            }
        }
    }

    fn moved(&mut self, from: PathBuf, to: PathBuf, now: Instant) -> Notification {
        let is_directory = to.is_dir() || self.is_known_directory(&from);
        if is_directory {
            self.rename_tree(&from, &to, now);
        }
        Notification {
            is_directory,
            ..Notification::moved(from, to)
        }
    }

    fn source_gone(&mut self, path: PathBuf, now: Instant) -> Notification {
        let is_directory = self.is_known_directory(&path);
        if is_directory {
            self.forget_tree(&path, now);
        }
        notification(NotificationKind::Deleted, &path, is_directory)
    }

    fn target_arrived(&mut self, path: &Path) -> Notification {
        let is_directory = path.is_dir();
        if is_directory {
            self.index_tree(path);
        }
        notification(NotificationKind::Created, path, is_directory)
    }

    fn forget_tree(&mut self, path: &Path, now: Instant) {
        let gone: Vec<PathBuf> = self
            .directories
            .iter()
            .filter(|dir| dir.starts_with(path))
            .cloned()
            .collect();
        for dir in gone {
            self.directories.remove(&dir);
            self.vanished.insert(dir, now);
        }
        self.vanished.insert(path.to_path_buf(), now);
    }

    fn rename_tree(&mut self, from: &Path, to: &Path, now: Instant) {
        let moved: Vec<PathBuf> = self
            .directories
            .iter()
            .filter(|dir| dir.starts_with(from))
            .cloned()
            .collect();
        for dir in moved {
            self.directories.remove(&dir);
            if let Ok(rest) = dir.strip_prefix(from) {
                if !rest.as_os_str().is_empty() {
                    self.directories.insert(to.join(rest));
                }
            }
            self.vanished.insert(dir, now);
        }
        self.vanished.insert(from.to_path_buf(), now);
        self.directories.insert(to.to_path_buf());
    }
}

fn notification(kind: NotificationKind, path: &Path, is_directory: bool) -> Notification {
    Notification {
        is_directory,
        ..Notification::new(kind, path)
    }
}
