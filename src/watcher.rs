use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::CreateKind,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{error, warn};

/// Something that can be hot-reloaded from disk.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;
    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Background tasks polling one directory tree.
pub struct DirectoryWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Watch `dir` recursively for paths with one of `exts` or accepted by
    /// `watcher_impl.is_relevant`. With `initial_scan`, existing entries are
    /// reloaded first; with `enable_retry`, failed reloads are retried a few
    /// times.
    pub async fn new(
        dir: PathBuf,
        watcher_impl: Arc<dyn WatchedType>,
        exts: &[&str],
        initial_scan: bool,
        enable_retry: bool,
        poll_interval: Duration,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }
        let exts: Vec<String> = exts.iter().map(|s| s.to_string()).collect();

        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if matches(&*watcher_impl, &path, &exts) {
                    try_reload(&watcher_impl, &path, enable_retry).await;
                }
            }
        }

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        // The poll watcher is created here so setup errors reach the caller.
        let mut watcher = PollWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;

        let handle_watcher = tokio::spawn(async move {
            let _keep_alive = watcher;
            futures::future::pending::<()>().await;
        });

        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind:
                            EventKind::Create(CreateKind::Any | CreateKind::File)
                            | EventKind::Modify(_),
                        paths,
                        ..
                    }) => {
                        for path in paths {
                            if !matches(&*watcher_impl, &path, &exts) {
                                continue;
                            }
                            let watcher_inner = watcher_impl.clone();
                            tokio::spawn(async move {
                                if let Err(e) = watcher_inner.on_create_or_modify(&path).await {
                                    warn!(?path, ?e, "Failed to handle create/modify");
                                }
                            });
                        }
                    }
                    Ok(Event { kind: EventKind::Remove(_), paths, .. }) => {
                        for path in paths {
                            if matches(&*watcher_impl, &path, &exts) {
                                if let Err(e) = watcher_impl.on_remove(&path).await {
                                    warn!(?path, ?e, "Failed to handle removal");
                                }
                            }
                        }
                    }
                    Err(e) => warn!(?e, "Watcher error"),
                    _ => {}
                }
            }
        });

        Ok(DirectoryWatcher { handles: vec![handle_dispatch, handle_watcher] })
    }

    /// Abort the polling tasks. No more events are dispatched afterwards.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn matches(watched: &dyn WatchedType, path: &Path, exts: &[String]) -> bool {
    watched.is_relevant(path)
        || path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| exts.iter().any(|x| x == e))
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) if !retry || attempt == MAX_RETRIES - 1 => {
                error!("Failed to reload {:?}: {e:?}", path);
                return;
            }
            Err(e) => {
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
