// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-account command queue: strict FIFO, one command in flight at a
//! time, paced by [`QUEUE_DELAY`] so a device isn't sent commands too
//! tightly (§4.9).
//!
//! The queue worker talks to the live cloud session through a
//! [`tokio::sync::watch`] channel of the current publisher handle rather
//! than a shared reference to [`crate::cloud::CloudSession`] itself — the
//! bridge supervisor swaps the handle on every reconnect, and the worker
//! just keeps draining whatever is current.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rumqttc::AsyncClient;
use tokio::sync::{mpsc, watch};

use crate::command::{Command, ResponseClass};
use crate::error::Error;
use crate::mac::Mac;

/// Pacing delay between successive command sends on one account's
/// queue. The device drops or corrupts commands sent too tightly.
pub const QUEUE_DELAY: Duration = Duration::from_millis(200);

/// Above this many queued-but-undispatched items, a warning is logged
/// (soft threshold; the queue itself stays unbounded).
pub const SOFT_DEPTH_WARNING: usize = 32;

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One item sitting in an account's command queue.
#[derive(Debug, Clone)]
struct QueueItem {
    mac: Mac,
    command: Command,
    enqueued_at: Instant,
    correlation_id: u64,
}

/// A handle for enqueuing commands onto one account's dispatcher.
/// Cheaply cloneable; the worker task owns the actual queue.
#[derive(Clone)]
pub struct CommandDispatcher {
    tx: mpsc::UnboundedSender<QueueItem>,
    depth: Arc<Mutex<usize>>,
}

impl CommandDispatcher {
    /// Spawns the queue worker and returns a handle to it.
    ///
    /// `publisher` is updated by the bridge supervisor every time the
    /// account's cloud session reconnects; `None` means no session is
    /// currently live, and the worker holds the head item until one
    /// appears.
    ///
    /// `on_immediate` is called just before publishing an
    /// [`ResponseClass::Immediate`] write, so the state projector can
    /// arm its command-expectation window.
    #[must_use]
    pub fn spawn(
        mut publisher: watch::Receiver<Option<AsyncClient>>,
        on_immediate: impl Fn(Mac) + Send + 'static,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueueItem>();
        let depth = Arc::new(Mutex::new(0usize));
        let depth_worker = Arc::clone(&depth);

        tokio::spawn(async move {
            let mut queue: VecDeque<QueueItem> = VecDeque::new();
            loop {
                // Drain everything currently enqueued before sending,
                // so depth reflects reality even under bursty enqueue.
                while let Ok(item) = rx.try_recv() {
                    queue.push_back(item);
                }
                *depth_worker.lock() = queue.len();
                if queue.len() > SOFT_DEPTH_WARNING {
                    tracing::warn!(depth = queue.len(), "command queue depth above soft threshold");
                }

                let Some(item) = queue.front().cloned() else {
                    // Nothing queued; block for the next enqueue.
                    match rx.recv().await {
                        Some(item) => {
                            queue.push_back(item);
                            continue;
                        }
                        None => return, // all senders dropped, shut down
                    }
                };

                let Some(client) = publisher.borrow().clone() else {
                    // No live session. Wait for one to appear (or for
                    // shutdown), without popping the head item.
                    if publisher.changed().await.is_err() {
                        return;
                    }
                    continue;
                };

                if item.command.response_class() == ResponseClass::Immediate {
                    on_immediate(item.mac);
                }

                let frame = item.command.to_frame();
                match crate::cloud::publish_frame(&client, item.mac, &frame).await {
                    Ok(()) => {
                        tracing::debug!(
                            mac = %item.mac,
                            correlation_id = item.correlation_id,
                            age_ms = item.enqueued_at.elapsed().as_millis() as u64,
                            description = %item.command.description(),
                            "command published"
                        );
                        queue.pop_front();
                    }
                    Err(e) => {
                        // Session died between the watch read and the
                        // publish call; leave the item at the head and
                        // retry once a (possibly new) session appears.
                        tracing::debug!(mac = %item.mac, error = %e, "publish failed, will retry after reconnect");
                    }
                }

                tokio::time::sleep(QUEUE_DELAY).await;
            }
        });

        Self { tx, depth }
    }

    /// Appends a command for `mac` to the tail of the queue.
    pub fn enqueue(&self, mac: Mac, command: Command) {
        let correlation_id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(QueueItem {
            mac,
            command,
            enqueued_at: Instant::now(),
            correlation_id,
        });
    }

    /// Current (approximate) queue depth, for diagnostics.
    #[must_use]
    pub fn depth(&self) -> usize {
        *self.depth.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ResponseClass;
    use std::sync::atomic::AtomicUsize;

    fn mac() -> Mac {
        Mac::parse("7C2C67AB5F0E").unwrap()
    }

    #[tokio::test]
    async fn enqueue_without_session_does_not_panic_and_holds_depth() {
        let (_tx, rx) = watch::channel::<Option<AsyncClient>>(None);
        let dispatcher = CommandDispatcher::spawn(rx, |_mac| {});
        let cmd = Command::write_single_register(41, 1, ResponseClass::Immediate).unwrap();
        dispatcher.enqueue(mac(), cmd);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.depth(), 1);
    }

    #[tokio::test]
    async fn immediate_callback_fires_only_for_immediate_class() {
        let (_tx, rx) = watch::channel::<Option<AsyncClient>>(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let dispatcher = CommandDispatcher::spawn(rx, move |_mac| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        // No live session, so the callback never fires (there is
        // nothing to publish yet) -- this asserts the worker doesn't
        // call it speculatively before a publish is attempted.
        let cmd = Command::write_single_register(24, 1, ResponseClass::Delayed).unwrap();
        dispatcher.enqueue(mac(), cmd);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
