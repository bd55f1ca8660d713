//! Pause and cancel signals shared between a run and whoever controls it.
//!
//! Cancellation is one-way and uses a [`CancellationToken`]. Pausing toggles, so it's a
//! `watch` channel. Every wait in a run (requests, throttle, backoff) is raced against both,
//! which means an interruption is noticed as soon as it happens instead of after the wait.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why a run stopped before finishing its pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Paused,
    Cancelled,
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interrupt::Paused => f.write_str("paused"),
            Interrupt::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSignals {
    cancel: CancellationToken,
    pause_tx: Arc<watch::Sender<bool>>,
    pause_rx: watch::Receiver<bool>,
}

impl Default for RunSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSignals {
    pub fn new() -> Self {
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause_tx: Arc::new(pause_tx),
            pause_rx,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn set_paused(&self, paused: bool) {
        self.pause_tx.send_replace(paused);
    }

    /// Flips the pause flag and returns the new value.
    pub fn toggle_pause(&self) -> bool {
        let mut paused = false;
        self.pause_tx.send_modify(|flag| {
            *flag = !*flag;
            paused = *flag;
        });
        paused
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Returns the pending interrupt, if any. Cancellation wins over pausing.
    pub fn checkpoint(&self) -> Result<(), Interrupt> {
        if self.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else if self.is_paused() {
            Err(Interrupt::Paused)
        } else {
            Ok(())
        }
    }

    /// Resolves once the run is cancelled or paused.
    pub async fn interrupted(&self) -> Interrupt {
        let mut pause_rx = self.pause_rx.clone();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Interrupt::Cancelled,
            _ = wait_paused(&mut pause_rx) => Interrupt::Paused,
        }
    }

    /// Runs `fut` to completion unless the run is interrupted first, in which case `fut` is
    /// dropped.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        self.checkpoint()?;
        tokio::select! {
            biased;
            interrupt = self.interrupted() => Err(interrupt),
            output = fut => Ok(output),
        }
    }

    /// Sleeps for `duration`, returning early with the interrupt if one arrives.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupt> {
        self.guard(tokio::time::sleep(duration)).await
    }
}

async fn wait_paused(pause_rx: &mut watch::Receiver<bool>) {
    loop {
        if *pause_rx.borrow_and_update() {
            return;
        }
        if pause_rx.changed().await.is_err() {
            // Sender gone, the flag can't change anymore.
            std::future::pending::<()>().await;
        }
    }
}
