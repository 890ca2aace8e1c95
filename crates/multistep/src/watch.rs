// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for a remote resource to reach a desired condition.
//!
//! A [`Watch`] consumes a stream of [`Observation`]s of one resource and
//! evaluates a readiness predicate on each observed object, in arrival order.
//! The wait ends when the predicate reports [`Readiness::Ready`], the deadline
//! passes, the build is cancelled, or the stream reports an error, a deletion
//! or its own end. The stream is dropped on every exit path, which tears down
//! whatever subscription produced it.
//!
//! Sources that can only be polled are adapted with [`poll_stream`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::cancel::Cancellation;

/// Identifies the resource being watched, for logs and errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceId {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: None, name: name.into() }
    }

    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// The verdict of a readiness predicate on one observation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness<T> {
    Ready(T),

    /// Not ready yet; the string says why and is logged.
    Pending(String),
}

/// One event delivered by a watch subscription or a poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation<O> {
    /// The resource was added or modified (or polled) and now looks like this.
    Object(O),

    /// The resource no longer exists.
    Deleted,

    /// The subscription or poll failed.
    Error(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("timed out after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    #[error("watch of {resource} failed: {message}")]
    Subscription { resource: String, message: String },

    #[error("watch of {resource} ended before it became ready")]
    Closed { resource: String },

    #[error("wait for {resource} was cancelled")]
    Cancelled { resource: String },
}

/// Lets a caller observe whether a [`Watch`] currently has an active
/// subscription. The flag is true from the moment the wait starts consuming
/// events until it returns, on every exit path.
#[derive(Clone, Debug)]
pub struct WatchObserver {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for WatchObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchObserver {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_watching(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Completes once a wait has started.
    pub async fn established(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|watching| *watching).await;
    }

    fn enter(&self) -> WatchingGuard<'_> {
        self.tx.send_replace(true);
        WatchingGuard(self)
    }
}

struct WatchingGuard<'a>(&'a WatchObserver);

impl Drop for WatchingGuard<'_> {
    fn drop(&mut self) {
        self.0.tx.send_replace(false);
    }
}

/// A bounded wait on one resource.
#[derive(Clone, Debug)]
pub struct Watch {
    resource: ResourceId,
    timeout: Duration,
    observer: Option<WatchObserver>,
}

impl Watch {
    pub fn new(resource: ResourceId, timeout: Duration) -> Self {
        Self { resource, timeout, observer: None }
    }

    pub fn observer(mut self, observer: WatchObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn resource(&self) -> &ResourceId {
        &self.resource
    }

    /// Consumes `events` until `check` reports the resource ready.
    ///
    /// Every observed object is evaluated; events are never coalesced.
    pub async fn wait<O, T, St, F>(
        &self,
        events: St,
        cancel: &Cancellation,
        mut check: F,
    ) -> Result<T, WatchError>
    where
        St: Stream<Item = Observation<O>>,
        F: FnMut(&O) -> Readiness<T>,
    {
        let resource = self.resource.to_string();
        let _watching = self.observer.as_ref().map(WatchObserver::enter);

        futures::pin_mut!(events);
        let start = Instant::now();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        debug!(%resource, timeout = ?self.timeout, "waiting for resource");

        loop {
            let next = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    return Err(WatchError::Cancelled { resource });
                }
                _ = &mut deadline => {
                    return Err(WatchError::Timeout {
                        resource,
                        elapsed: start.elapsed(),
                    });
                }
                next = events.next() => next,
            };

            match next {
                Some(Observation::Object(obj)) => match check(&obj) {
                    Readiness::Ready(value) => {
                        info!(
                            %resource,
                            elapsed = ?start.elapsed(),
                            "resource is ready"
                        );
                        return Ok(value);
                    }
                    Readiness::Pending(reason) => {
                        info!(%resource, %reason, "resource not ready yet");
                    }
                },
                Some(Observation::Deleted) => {
                    return Err(WatchError::Subscription {
                        resource,
                        message: "resource was deleted".to_string(),
                    });
                }
                Some(Observation::Error(message)) => {
                    return Err(WatchError::Subscription { resource, message });
                }
                None => return Err(WatchError::Closed { resource }),
            }
        }
    }
}

/// Turns a fetch function into a stream of observations taken every
/// `interval`. The first fetch happens immediately. A failed fetch yields
/// [`Observation::Error`].
pub fn poll_stream<O, F, Fut>(
    interval: Duration,
    fetch: F,
) -> impl Stream<Item = Observation<O>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<O>>,
{
    let mut ticker =
        tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    stream::unfold((ticker, fetch), |(mut ticker, mut fetch)| async move {
        ticker.tick().await;
        let obs = match fetch().await {
            Ok(obj) => Observation::Object(obj),
            Err(e) => Observation::Error(format!("{e:#}")),
        };
        Some((obs, (ticker, fetch)))
    })
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::channel::mpsc;

    use super::*;
    use crate::cancel::CancellationSource;

    fn vm() -> ResourceId {
        ResourceId::namespaced("VirtualMachine", "ns", "source-vm")
    }

    fn ready_when_positive(v: &i32) -> Readiness<i32> {
        if *v > 0 {
            Readiness::Ready(*v)
        } else {
            Readiness::Pending(format!("value is {v}"))
        }
    }

    /// Collects formatted log output for the current thread.
    #[derive(Clone, Default)]
    struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
        type Writer = LogCapture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn pending_observations_are_logged_before_ready() {
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let events = stream::iter(vec![
            Observation::Object(0),
            Observation::Object(-3),
            Observation::Object(4),
        ]);
        let res = Watch::new(vm(), Duration::from_secs(5))
            .wait(events, &Cancellation::never(), ready_when_positive)
            .await;
        assert_eq!(res, Ok(4));

        let logs = capture.contents();
        let pending = logs.find("resource not ready yet").expect(&logs);
        let ready = logs.find("resource is ready").expect(&logs);
        assert!(pending < ready, "{logs}");
        assert!(logs.contains("value is 0"), "{logs}");
        assert!(logs.contains("value is -3"), "{logs}");
        assert!(logs.contains("VirtualMachine ns/source-vm"), "{logs}");
    }

    #[tokio::test]
    async fn every_event_is_evaluated_until_ready() {
        let seen = AtomicUsize::new(0);
        let events = stream::iter(vec![
            Observation::Object(0),
            Observation::Object(-1),
            Observation::Object(7),
            Observation::Object(9),
        ]);
        let res = Watch::new(vm(), Duration::from_secs(5))
            .wait(events, &Cancellation::never(), |v| {
                seen.fetch_add(1, Ordering::SeqCst);
                ready_when_positive(v)
            })
            .await;
        assert_eq!(res, Ok(7));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_times_out_at_deadline() {
        let timeout = Duration::from_secs(30);
        let start = Instant::now();
        let res = Watch::new(vm(), timeout)
            .wait(
                stream::pending::<Observation<i32>>(),
                &Cancellation::never(),
                ready_when_positive,
            )
            .await;
        match res {
            Err(WatchError::Timeout { resource, elapsed }) => {
                assert_eq!(resource, "VirtualMachine ns/source-vm");
                assert!(elapsed >= timeout);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(start.elapsed() < timeout + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn deletion_and_errors_fail_the_wait() {
        let res = Watch::new(vm(), Duration::from_secs(5))
            .wait(
                stream::iter(vec![Observation::Object(0), Observation::Deleted]),
                &Cancellation::never(),
                ready_when_positive,
            )
            .await;
        assert!(matches!(res, Err(WatchError::Subscription { .. })));

        let res = Watch::new(vm(), Duration::from_secs(5))
            .wait(
                stream::iter(vec![Observation::<i32>::Error(
                    "forbidden".to_string(),
                )]),
                &Cancellation::never(),
                ready_when_positive,
            )
            .await;
        assert_eq!(
            res,
            Err(WatchError::Subscription {
                resource: "VirtualMachine ns/source-vm".to_string(),
                message: "forbidden".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn stream_end_is_closed() {
        let res = Watch::new(vm(), Duration::from_secs(5))
            .wait(
                stream::iter(vec![Observation::Object(0)]),
                &Cancellation::never(),
                ready_when_positive,
            )
            .await;
        assert!(matches!(res, Err(WatchError::Closed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_wait() {
        let source = CancellationSource::new();
        let token = source.token();
        let waiter = tokio::spawn(async move {
            Watch::new(vm(), Duration::from_secs(600))
                .wait(
                    stream::pending::<Observation<i32>>(),
                    &token,
                    ready_when_positive,
                )
                .await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        source.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(WatchError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn observer_tracks_active_subscription() {
        let observer = WatchObserver::new();
        let (tx, rx) = mpsc::unbounded();
        let watch =
            Watch::new(vm(), Duration::from_secs(60)).observer(observer.clone());
        assert!(!observer.is_watching());

        let waiter = tokio::spawn(async move {
            watch
                .wait(rx, &Cancellation::never(), ready_when_positive)
                .await
        });

        observer.established().await;
        assert!(observer.is_watching());
        tx.unbounded_send(Observation::Object(0)).unwrap();
        tx.unbounded_send(Observation::Object(3)).unwrap();

        assert_eq!(waiter.await.unwrap(), Ok(3));
        assert!(!observer.is_watching());
    }

    #[tokio::test]
    async fn observer_is_cleared_on_failure() {
        let observer = WatchObserver::new();
        let res = Watch::new(vm(), Duration::from_secs(5))
            .observer(observer.clone())
            .wait(
                stream::iter(vec![Observation::<i32>::Deleted]),
                &Cancellation::never(),
                ready_when_positive,
            )
            .await;
        assert!(res.is_err());
        assert!(!observer.is_watching());
    }

    #[tokio::test(start_paused = true)]
    async fn polling_fetches_until_ready() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch_calls = calls.clone();
        let events = poll_stream(Duration::from_secs(5), move || {
            let n = fetch_calls.fetch_add(1, Ordering::SeqCst) as i32;
            async move { Ok(n - 2) }
        });

        let start = Instant::now();
        let res = Watch::new(vm(), Duration::from_secs(60))
            .wait(events, &Cancellation::never(), ready_when_positive)
            .await;
        assert_eq!(res, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_error_fails_the_wait() {
        let events = poll_stream(Duration::from_secs(1), || async {
            Err::<i32, _>(anyhow::anyhow!("connection refused"))
        });
        let res = Watch::new(vm(), Duration::from_secs(60))
            .wait(events, &Cancellation::never(), ready_when_positive)
            .await;
        assert!(matches!(
            res,
            Err(WatchError::Subscription { message, .. }) if message == "connection refused"
        ));
    }
}
