//! Background compaction thread.
//!
//! Commits nudge the worker through [`CompactionSignal`] whenever a
//! transaction log fills up; the worker then runs one compaction pass. Stop
//! requests wake it through the same condition variable, so shutdown never
//! waits for a poll interval to elapse.

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{is_cancelled, CancellationToken, EngineInner};

/// Upper bound on one idle sleep; cancellation is re-checked this often.
const IDLE_SLICE: Duration = Duration::from_millis(100);

/// Pending-request flag plus the condition variable the worker sleeps on.
#[derive(Default)]
pub(crate) struct CompactionSignal {
    requested: Mutex<bool>,
    wake: Condvar,
}

impl CompactionSignal {
    pub(crate) fn request(&self) {
        *self.requested.lock() = true;
        self.wake.notify_all();
    }

    /// Wakes the worker without asking for a pass.
    pub(crate) fn wake_all(&self) {
        let _guard = self.requested.lock();
        self.wake.notify_all();
    }

    /// Blocks until a pass is requested (`true`, request consumed) or the
    /// token is cancelled (`false`).
    pub(crate) fn wait_for_request(&self, token: &CancellationToken) -> bool {
        let mut requested = self.requested.lock();
        loop {
            if token.is_cancelled() {
                return false;
            }
            if *requested {
                *requested = false;
                return true;
            }
            self.wake.wait_for(&mut requested, IDLE_SLICE);
        }
    }
}

/// Owns the compactor thread. [`stop`](Self::stop) must be called before the
/// engine state is torn down; dropping without it only detaches the thread.
pub(crate) struct BackgroundWorker {
    inner: Arc<EngineInner>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub(crate) fn spawn(inner: Arc<EngineInner>) -> Result<Self> {
        let token = CancellationToken::new();
        let worker_inner = Arc::clone(&inner);
        let worker_token = token.clone();
        let handle = thread::Builder::new()
            .name("arbor-compactor".into())
            .spawn(move || run(&worker_inner, &worker_token))
            .context("failed to spawn compaction thread")?;
        debug!("background compactor started");
        Ok(Self {
            inner,
            token,
            handle: Some(handle),
        })
    }

    /// Cancels a running pass, wakes the thread and joins it.
    pub(crate) fn stop(&mut self) {
        self.token.cancel();
        self.inner.compaction_signal.wake_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("background compactor panicked");
            }
        }
        debug!("background compactor stopped");
    }
}

fn run(inner: &EngineInner, token: &CancellationToken) {
    while inner.compaction_signal.wait_for_request(token) {
        match inner.compact(token) {
            Ok(true) => info!("background compaction reclaimed space"),
            Ok(false) => debug!("background compaction had nothing to do"),
            Err(e) if is_cancelled(&e) => break,
            Err(e) => warn!(error = %e, "background compaction failed"),
        }
    }
}
