use std::path::PathBuf;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::jobs::{Job, JobQueue};
use crate::state::AppState;

pub fn configure_watcher(state: &AppState) {
    if !state.config.media.watch_media {
        info!("Watcher disabled (watch_media=false)");
        *state.watcher.write() = None;
        return;
    }
    let root = match &state.paths.media_root {
        Some(root) if root.is_dir() => root.clone(),
        Some(root) => {
            warn!("Watcher not started, {} does not exist", root.display());
            return;
        }
        None => return,
    };

    let watch_debounce_secs = if state.config.media.watch_debounce_secs == 0 {
        2
    } else {
        state.config.media.watch_debounce_secs
    };
    let watch_debounce = Duration::from_secs(watch_debounce_secs);

    match setup_watcher(state.jobs.clone(), root.clone(), watch_debounce) {
        Ok(watcher) => {
            info!(
                "Watching {} for changes (debounce {}s)",
                root.display(),
                watch_debounce.as_secs()
            );
            *state.watcher.write() = Some(watcher);
        }
        Err(err) => {
            warn!("Failed to start watcher: {}", err);
            *state.watcher.write() = None;
        }
    }
}

fn setup_watcher(
    jobs: JobQueue,
    root: PathBuf,
    debounce: Duration,
) -> Result<RecommendedWatcher, Box<dyn std::error::Error>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        watch_loop(jobs, rx, debounce).await;
    });

    Ok(watcher)
}

async fn watch_loop(jobs: JobQueue, mut rx: UnboundedReceiver<Event>, debounce: Duration) {
    loop {
        let event = match rx.recv().await {
            Some(event) => event,
            None => break,
        };
        if !is_relevant_event(&event) {
            continue;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    match jobs.enqueue(Job::Scan) {
                        Ok(queued) => info!("Media root changed, queued scan {}", queued.id),
                        Err(err) => warn!("Failed to queue auto-scan: {}", err),
                    }
                    break;
                }
                maybe_event = rx.recv() => {
                    if maybe_event.is_none() {
                        return;
                    }
                }
            }
        }
    }
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
