//! Filesystem-event source for monitor mode.
//!
//! Raw watcher events are mapped to coarse path changes and coalesced
//! over a short window: the first event opens the window, everything
//! arriving within it joins the same batch, and the batch becomes one
//! sync round.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::warn;

/// How long a batch keeps collecting after its first event.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    Modified(PathBuf),
    Created(PathBuf),
    Removed(PathBuf),
}

/// Watches `root` recursively. The returned watcher must stay alive for
/// as long as events are wanted; dropping it closes the channel.
pub fn watch_recursive(
    root: &Path,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<FsChange>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!("watcher error: {e}");
                return;
            }
        };
        let wrap: fn(PathBuf) -> FsChange = match event.kind {
            EventKind::Create(_) => FsChange::Created,
            EventKind::Modify(_) => FsChange::Modified,
            EventKind::Remove(_) => FsChange::Removed,
            _ => return,
        };
        for path in event.paths {
            // receiver gone means monitor mode ended; nothing to do
            let _ = tx.send(wrap(path));
        }
    })
    .context("failed to create fs watcher")?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", root.display()))?;
    Ok((watcher, rx))
}

/// Waits for the next event, then keeps draining the channel until the
/// coalescing window closes. `None` once the watcher is gone.
pub async fn next_batch(
    rx: &mut mpsc::UnboundedReceiver<FsChange>,
    window: Duration,
) -> Option<Vec<FsChange>> {
    let first = rx.recv().await?;
    let mut batch = vec![first];
    let deadline = sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            change = rx.recv() => match change {
                Some(c) => batch.push(c),
                None => break,
            },
        }
    }
    Some(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_next_batch_coalesces_burst() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(FsChange::Modified("a".into())).unwrap();
        tx.send(FsChange::Created("b".into())).unwrap();
        tx.send(FsChange::Removed("c".into())).unwrap();

        let batch = next_batch(&mut rx, Duration::from_millis(50)).await.unwrap();
        assert_eq!(
            batch,
            vec![
                FsChange::Modified("a".into()),
                FsChange::Created("b".into()),
                FsChange::Removed("c".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_next_batch_none_when_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel::<FsChange>();
        drop(tx);
        assert!(next_batch(&mut rx, Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_next_batch_ends_batch_on_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(FsChange::Modified("a".into())).unwrap();
        drop(tx);
        let batch = next_batch(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
