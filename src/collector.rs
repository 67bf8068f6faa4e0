//! The collector: a background reaper for finished decoder states.
//!
//! Decoder states are created by workers and flagged ready by post-render
//! accounting (or by stop), but only the collector frees them: the realtime
//! thread must never pay for a deallocation. Each sweep compare-and-swaps
//! ready slots back to empty, then blocks on the collector semaphore with a
//! watchdog timeout.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::player::Shared;

pub(crate) fn spawn(shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("decoder-collector".into())
        .spawn(move || run(shared))
}

fn run(shared: Arc<Shared>) {
    while shared.keep_collecting.load(Ordering::SeqCst) {
        let collected = shared.table.collect_ready();
        if collected > 0 {
            tracing::trace!(collected, "reclaimed decoder states");
        }
        shared.collector_sem.wait_timeout(shared.config.wait_timeout);
    }

    // Final sweep so an orderly shutdown leaves the table empty.
    shared.table.collect_ready();
}
