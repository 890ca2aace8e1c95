// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-wide cooperative cancellation.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// The sending half of a cancellation signal. Dropping the source without
/// calling [`CancellationSource::cancel`] leaves its tokens uncancelled
/// forever.
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSource {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Returns a token that observes this source.
    pub fn token(&self) -> Cancellation {
        Cancellation { rx: self.tx.subscribe() }
    }

    /// Signals every token. Returns `false` if the source was already
    /// cancelled.
    pub fn cancel(&self) -> bool {
        self.tx.send_if_modified(|cancelled| {
            let first = !*cancelled;
            *cancelled = true;
            first
        })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A cheaply cloneable token steps poll at their safe points.
#[derive(Clone, Debug)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// A token that is never cancelled, used while unwinding.
    pub fn never() -> Self {
        CancellationSource::new().token()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once the build is cancelled. Never completes for a token
    /// whose source was dropped uncancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Returns `Err(Cancelled)` if the build has been cancelled.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Sleeps for `duration` unless the build is cancelled first.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &Cancellation,
) -> Result<(), Cancelled> {
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
