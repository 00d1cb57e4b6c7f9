//! Filesystem wake-ups for continuous discovery.
//!
//! A debounced watcher on the storage prefix nudges the bronze trigger loop so
//! new files are picked up before the next interval tick. Wake-ups carry no
//! data; the listing is still the source of truth.

use std::path::Path;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tokio::sync::mpsc;

/// Keeps the underlying watcher alive; dropping it stops wake-ups
pub struct PrefixWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
}

/// Watch `prefix` recursively and send a wake-up after each debounced burst
pub fn watch_prefix(
    prefix: &Path,
    debounce: Duration,
) -> Result<(PrefixWatcher, mpsc::Receiver<()>), notify::Error> {
    // Capacity 1: bursts collapse into a single pending wake-up
    let (wake_tx, wake_rx) = mpsc::channel::<()>(1);

    let mut debouncer = new_debouncer(debounce, move |result: DebounceEventResult| match result {
        Ok(events) if !events.is_empty() => {
            let _ = wake_tx.try_send(());
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Watcher error: {:?}", e),
    })?;

    debouncer.watcher().watch(prefix, RecursiveMode::Recursive)?;

    tracing::info!("Watching {} for new files", prefix.display());

    Ok((
        PrefixWatcher {
            _debouncer: debouncer,
        },
        wake_rx,
    ))
}
