use chrono::Utc;
use log::{error, info, trace};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::AutoscanError;
use crate::filter::Filterer;
use crate::processor::Processor;
use crate::rewrite::{Rewrite, Rewriter};
use crate::scan::Scan;
use crate::utils::clean_path;

/// How long a path must stay quiet before its scan is emitted.
const DEBOUNCE_DELAY: Duration = Duration::from_secs(10);

/// Cadence of the worker draining expired queue entries.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InotifyConfig {
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub verbosity: Option<String>,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub paths: Vec<WatchPathConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchPathConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub rewrite: Vec<Rewrite>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

struct WatchPath {
    path: String,
    rewriter: Rewriter,
    filterer: Filterer,
}

/// Holds pending paths with a deadline; re-submission pushes the deadline
/// forward, absorbing bursts from atomic-replace editors.
struct DebounceQueue {
    pending: Mutex<HashMap<String, Instant>>,
    delay: Duration,
}

impl DebounceQueue {
    fn new(delay: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            delay,
        }
    }

    fn push(&self, path: String) {
        let mut pending = self.pending.lock().unwrap();
        pending.insert(path, Instant::now() + self.delay);
    }

    fn drain_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap();

        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &expired {
            pending.remove(path);
        }

        expired
    }
}

/// Watches configured roots recursively and turns rename/remove activity
/// into debounced scans.
pub struct InotifyTrigger;

impl InotifyTrigger {
    pub fn spawn(config: InotifyConfig, processor: Arc<Processor>) -> Result<(), AutoscanError> {
        let mut paths = Vec::with_capacity(config.paths.len());
        for p in &config.paths {
            let mut rewrites = p.rewrite.clone();
            rewrites.extend(config.rewrite.iter().cloned());

            let mut includes = p.include.clone();
            includes.extend(config.include.iter().cloned());
            let mut excludes = p.exclude.clone();
            excludes.extend(config.exclude.iter().cloned());

            paths.push(WatchPath {
                path: p.path.to_string_lossy().into_owned(),
                rewriter: Rewriter::new(&rewrites)?,
                filterer: Filterer::new(&includes, &excludes)?,
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher =
            RecommendedWatcher::new(
                move |result: Result<notify::Event, notify::Error>| {
                    let _ = tx.send(result);
                },
                notify::Config::default(),
            )
            .map_err(|err| AutoscanError::Fatal(format!("create watcher: {err}")))?;

        for watch_path in &paths {
            watcher
                .watch(Path::new(&watch_path.path), RecursiveMode::Recursive)
                .map_err(|err| {
                    AutoscanError::Fatal(format!("watch directory {}: {err}", watch_path.path))
                })?;

            trace!("Watching directory: {}", watch_path.path);
        }

        tokio::spawn(worker(watcher, rx, paths, config.priority, processor));

        Ok(())
    }
}

async fn worker(
    _watcher: RecommendedWatcher,
    mut rx: mpsc::UnboundedReceiver<Result<notify::Event, notify::Error>>,
    paths: Vec<WatchPath>,
    priority: i32,
    processor: Arc<Processor>,
) {
    let queue = DebounceQueue::new(DEBOUNCE_DELAY);
    let mut poll = tokio::time::interval(QUEUE_POLL_INTERVAL);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(event)) => handle_event(&event, &paths, &queue),
                    Some(Err(err)) => error!("Failed receiving filesystem events: {err}"),
                    None => break,
                }
            }
            _ = poll.tick() => {
                let expired = queue.drain_expired();
                if expired.is_empty() {
                    continue;
                }

                let now = Utc::now();
                let scans: Vec<Scan> = expired
                    .into_iter()
                    .map(|folder| Scan { folder, priority, time: now })
                    .collect();

                let folders: Vec<String> =
                    scans.iter().map(|scan| scan.folder.clone()).collect();
                match processor.submit(scans) {
                    Ok(()) => {
                        for folder in folders {
                            info!("Scan moved to processor: {folder}");
                        }
                    }
                    Err(err) => error!("Failed moving scans to processor: {err}"),
                }
            }
        }
    }
}

fn handle_event(event: &notify::Event, paths: &[WatchPath], queue: &DebounceQueue) {
    // Creates only extend the watch set, which recursive mode already
    // handles. Writes settle through the containing rename/remove.
    let relevant = matches!(
        event.kind,
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    );
    if !relevant {
        return;
    }

    for path in &event.paths {
        let event_path = normalize_event_path(&path.to_string_lossy());

        let Some(watch_path) = watch_path_for(paths, &event_path) else {
            trace!("No watch path matches event: {event_path}");
            continue;
        };

        let rewritten = watch_path.rewriter.rewrite(&event_path);
        if !watch_path.filterer.is_allowed(&rewritten) {
            continue;
        }

        queue.push(clean_path(&rewritten));
    }
}

/// Normalizes an event path to its containing directory: a path carrying an
/// extension is assumed to be a file.
fn normalize_event_path(path: &str) -> String {
    if Path::new(path).extension().is_some() {
        return crate::utils::dir_name(path);
    }

    path.to_owned()
}

fn watch_path_for<'a>(paths: &'a [WatchPath], path: &str) -> Option<&'a WatchPath> {
    paths.iter().find(|wp| path.starts_with(&wp.path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_emits_only_after_the_delay() {
        let queue = DebounceQueue::new(Duration::from_millis(20));
        queue.push("/Media/TV/Show".into());

        assert!(queue.drain_expired().is_empty());

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.drain_expired(), vec!["/Media/TV/Show".to_owned()]);
        assert!(queue.drain_expired().is_empty());
    }

    #[test]
    fn resubmission_pushes_the_deadline_forward() {
        let queue = DebounceQueue::new(Duration::from_millis(40));
        queue.push("/Media/TV/Show".into());

        std::thread::sleep(Duration::from_millis(25));
        queue.push("/Media/TV/Show".into());

        // the original deadline has passed, but the refreshed one has not
        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.drain_expired().is_empty());

        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(queue.drain_expired().len(), 1);
    }

    #[test]
    fn file_paths_normalize_to_their_directory() {
        assert_eq!(
            normalize_event_path("/Media/TV/Show/episode.mkv"),
            "/Media/TV/Show"
        );
        assert_eq!(normalize_event_path("/Media/TV/Show"), "/Media/TV/Show");
    }

    #[test]
    fn events_resolve_against_the_matching_root() {
        let paths = vec![
            WatchPath {
                path: "/watch/tv".into(),
                rewriter: Rewriter::default(),
                filterer: Filterer::default(),
            },
            WatchPath {
                path: "/watch/movies".into(),
                rewriter: Rewriter::default(),
                filterer: Filterer::default(),
            },
        ];

        assert_eq!(
            watch_path_for(&paths, "/watch/movies/Film").map(|wp| wp.path.as_str()),
            Some("/watch/movies")
        );
        assert!(watch_path_for(&paths, "/elsewhere/Film").is_none());
    }

    #[test]
    fn filtered_events_never_enter_the_queue() {
        let paths = vec![WatchPath {
            path: "/watch".into(),
            rewriter: Rewriter::default(),
            filterer: Filterer::new(&[], &["^/watch/incomplete/".to_owned()]).unwrap(),
        }];
        let queue = DebounceQueue::new(Duration::from_millis(1));

        let event = notify::Event::new(EventKind::Remove(notify::event::RemoveKind::Any))
            .add_path(PathBuf::from("/watch/incomplete/download"))
            .add_path(PathBuf::from("/watch/tv/show"));
        handle_event(&event, &paths, &queue);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(queue.drain_expired(), vec!["/watch/tv/show".to_owned()]);
    }
}
