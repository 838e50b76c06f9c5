//! Reconnecting watch over the change stream of one target.
//!
//! # How It Works
//!
//! 1. Opens a change stream starting after the last seen resource version
//! 2. Spawns a decode task that reads one JSON event at a time from the stream
//! 3. Forwards every decoded event, or the reason it could not be used, to the output queue
//! 4. When the stream breaks, waits out a backoff interval and reconnects from the
//!    last successfully parsed resource version
//!
//! Reads on the connection cannot be interrupted in place, so cancellation aborts the
//! decode task, which drops the stream and closes the connection. The supervising loop
//! waits on the decode task's completion to tell "cancelled" apart from "stream broke".

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{ByteStream, EndpointClient};
use crate::event::{ChangeEvent, ChangeResult, EventDecoder, ResourceVersion};
use crate::target::Target;

/// Bounds of the reconnect backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffSettings {
    /// First delay after a failure.
    pub min: Duration,
    /// Upper bound for the delay.
    pub max: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(800),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffSettings {
    /// Creates backoff settings with the given bounds.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub(crate) fn builder(self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min)
            .with_max_delay(self.max)
            .with_factor(2.0)
            .with_jitter()
            .without_max_times()
    }

    fn delays(self) -> ExponentialBackoff {
        self.builder().build()
    }
}

/// Keeps one change stream flowing for a target.
pub struct StreamWatcher<C> {
    client: Arc<C>,
    target: Target,
    events: Sender<ChangeResult>,
    backoff: BackoffSettings,
    last_seen: ResourceVersion,
}

impl<C: EndpointClient> StreamWatcher<C> {
    /// Creates a watcher that resumes after `since` and delivers results to `events`.
    #[must_use]
    pub fn new(
        client: Arc<C>,
        target: Target,
        since: ResourceVersion,
        events: Sender<ChangeResult>,
    ) -> Self {
        Self {
            client,
            target,
            events,
            backoff: BackoffSettings::default(),
            last_seen: since,
        }
    }

    /// Sets the reconnect backoff bounds.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    /// Spawns the watch loop in the background.
    ///
    /// The loop runs until the returned handle is cancelled or dropped, or the
    /// receiving end of the output queue is closed.
    #[must_use]
    pub fn start(self) -> WatchHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        WatchHandle { cancel, task }
    }

    /// Runs the reconnect loop until `cancel` fires.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let mut delays = self.backoff.delays();

        tracing::debug!(
            "Starting endpoint watch for {} from resourceVersion {}",
            self.target,
            self.last_seen
        );

        while !cancel.is_cancelled() && !self.events.is_closed() {
            let connect = self.client.start_change_stream(&self.target, self.last_seen);
            let connected = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                connected = connect => connected,
            };

            match connected {
                Ok(stream) => match self.proxy_events(stream, &cancel).await {
                    StreamEnd::Stopped => break,
                    StreamEnd::Broken { decoded } => {
                        if decoded {
                            delays = self.backoff.delays();
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        service = %self.target,
                        resource_version = self.last_seen,
                        "failed to start watch stream: {e}"
                    );
                }
            }

            let delay = delays.next().unwrap_or(self.backoff.max);
            tracing::debug!(
                service = %self.target,
                backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "reconnecting watch stream after backoff"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("Stopped endpoint watch for {}", self.target);
    }

    /// Reads events from one connection until it breaks or the watch is cancelled.
    async fn proxy_events(&mut self, stream: ByteStream, cancel: &CancellationToken) -> StreamEnd {
        let decode = DecodeLoop {
            decoder: EventDecoder::new(stream),
            events: self.events.clone(),
            last_seen: self.last_seen,
            decoded: false,
        };

        let mut task = tokio::spawn(decode.run());

        let joined = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                task.abort();
                return StreamEnd::Stopped;
            }
            joined = &mut task => joined,
        };

        match joined {
            Ok(summary) => {
                self.last_seen = summary.last_seen;
                if summary.receiver_gone {
                    tracing::debug!("result queue closed, stopping endpoint watch");
                    StreamEnd::Stopped
                } else {
                    StreamEnd::Broken {
                        decoded: summary.decoded,
                    }
                }
            }
            Err(e) => {
                tracing::error!(service = %self.target, "watch stream decode task failed: {e}");
                StreamEnd::Broken { decoded: false }
            }
        }
    }
}

/// How a connected phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    Stopped,
    Broken { decoded: bool },
}

/// State handed back by the decode task when it finishes.
struct DecodeSummary {
    last_seen: ResourceVersion,
    decoded: bool,
    receiver_gone: bool,
}

/// The decode task for one connection.
struct DecodeLoop {
    decoder: EventDecoder<ByteStream>,
    events: Sender<ChangeResult>,
    last_seen: ResourceVersion,
    decoded: bool,
}

impl DecodeLoop {
    async fn run(mut self) -> DecodeSummary {
        loop {
            let frame = match self.decoder.next_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("watch stream ended: {e}");
                    let receiver_gone = self.events.send(Err(e)).await.is_err();
                    return self.finish(receiver_gone);
                }
            };

            let result = match ChangeEvent::from_frame(frame) {
                Ok(event) => self.track(event),
                Err(e) => Err(e),
            };

            // Only usable events count towards resetting the backoff.
            if result.is_ok() {
                self.decoded = true;
            }

            if self.events.send(result).await.is_err() {
                return self.finish(true);
            }
        }
    }

    /// Advances the resume position past `event`.
    fn track(&mut self, event: ChangeEvent) -> ChangeResult {
        // Status objects on ERROR events normally carry no version.
        if matches!(event, ChangeEvent::Error(_)) && event.raw_resource_version().is_empty() {
            return Ok(event);
        }

        let version = event.resource_version()?;
        if version < self.last_seen {
            tracing::debug!(
                resource_version = version,
                last_seen = self.last_seen,
                "received event older than last seen resourceVersion"
            );
        }

        self.last_seen = self.last_seen.max(version);
        Ok(event)
    }

    fn finish(self, receiver_gone: bool) -> DecodeSummary {
        DecodeSummary {
            last_seen: self.last_seen,
            decoded: self.decoded,
            receiver_gone,
        }
    }
}

/// Handle to a running [`StreamWatcher`]. Dropping it stops the watch.
#[derive(Debug)]
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Stops the watch and closes its connection. Calling this more than once has no effect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once the watch loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
