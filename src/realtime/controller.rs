use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::envelope::Event;
use super::read_loop::{EventSink, ReadLoop, deadline_passed, earliest};
use super::subscription::{SubscriptionSet, UsageError};
use super::{ErrorClass, StreamError};

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub stop_deadline: Option<Instant>,
    pub reconnect: bool,
    pub reconnect_delay: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub include_control: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            stop_deadline: None,
            reconnect: true,
            reconnect_delay: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            include_control: false,
        }
    }
}

impl StreamOptions {
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.reconnect && self.reconnect_delay.is_zero() {
            return Err(UsageError::Invalid(
                "--reconnect-delay must be greater than zero".to_string(),
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(UsageError::Invalid(
                "--handshake-timeout must be greater than zero".to_string(),
            ));
        }
        if self.idle_timeout.is_some_and(|idle| idle.is_zero()) {
            return Err(UsageError::Invalid(
                "--idle-timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a finished session did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    /// Connections that got as far as reading.
    pub connects: u32,
    pub events: u64,
}

enum State {
    Connecting,
    Subscribing(Connection),
    Reading(Connection),
    /// Recoverable failure; the connection, if any, is already closed.
    Disconnected(StreamError),
    Stopped,
    Failed(StreamError),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Connecting => "connecting",
            State::Subscribing(_) => "subscribing",
            State::Reading(_) => "reading",
            State::Disconnected(_) => "disconnected",
            State::Stopped => "stopped",
            State::Failed(_) => "failed",
        }
    }
}

/// Drives one streaming session from first connect to a terminal state.
pub struct Controller {
    base_url: String,
    token: String,
    subscriptions: SubscriptionSet,
    options: StreamOptions,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        subscriptions: SubscriptionSet,
        options: StreamOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            subscriptions,
            options,
            cancel,
        }
    }

    /// Runs until the stop deadline passes, the session is cancelled, or an
    /// error that reconnecting cannot fix.
    pub async fn run<S>(&self, sink: &mut S) -> Result<SessionReport, StreamError>
    where
        S: EventSink + ?Sized,
    {
        self.options.validate()?;

        let mut report = SessionReport::default();
        let mut sink = Counting {
            inner: sink,
            forwarded: 0,
        };
        let mut attempt = 0u32;
        let mut state = State::Connecting;

        let outcome = loop {
            debug!(state = state.name(), "event stream state");
            state = match state {
                State::Connecting => self.connect().await,
                State::Subscribing(connection) => {
                    let next = self.subscribe(connection).await;
                    if matches!(next, State::Reading(_)) {
                        report.connects += 1;
                        attempt = 0;
                    }
                    next
                }
                State::Reading(connection) => self.read(connection, &mut sink).await,
                State::Disconnected(error) => {
                    attempt += 1;
                    self.back_off(attempt, error).await
                }
                State::Stopped => break Ok(()),
                State::Failed(error) => break Err(error),
            };
        };

        report.events = sink.forwarded;
        info!(
            connects = report.connects,
            events = report.events,
            "event stream session finished"
        );
        outcome.map(|()| report)
    }

    async fn connect(&self) -> State {
        if self.should_stop() {
            return State::Stopped;
        }

        let open = Connection::open(&self.base_url, &self.token, self.options.handshake_timeout);
        match self.suspend(open).await {
            None => State::Stopped,
            Some(Ok(connection)) => State::Subscribing(connection),
            Some(Err(error)) => self.after_failure(error),
        }
    }

    async fn subscribe(&self, connection: Connection) -> State {
        let deadline = earliest(
            self.options.stop_deadline,
            Some(Instant::now() + self.options.handshake_timeout),
        );
        let sent = self
            .suspend(connection.set_subscriptions(None, &self.subscriptions, deadline))
            .await;
        match sent {
            Some(Ok(request_id)) => {
                debug!(
                    %request_id,
                    wildcard = self.subscriptions.is_wildcard(),
                    chats = ?self.subscriptions.chat_ids(),
                    "subscription set sent"
                );
                State::Reading(connection)
            }
            None => {
                close(connection).await;
                State::Stopped
            }
            Some(Err(error)) => {
                close(connection).await;
                self.after_failure(error)
            }
        }
    }

    async fn read<S>(&self, connection: Connection, sink: &mut S) -> State
    where
        S: EventSink + ?Sized,
    {
        let read_loop = ReadLoop::new(
            self.options.stop_deadline,
            self.options.include_control,
            self.cancel.clone(),
        )
        .with_idle_timeout(self.options.idle_timeout);
        let result = read_loop.run(&connection, sink).await;
        close(connection).await;

        let Err(error) = result else {
            return State::Stopped;
        };
        if error.is_stream_closed() && !self.options.reconnect {
            info!(%error, "event stream ended");
            return State::Stopped;
        }
        match error.class() {
            ErrorClass::Cancelled => State::Stopped,
            ErrorClass::Closed => State::Disconnected(error),
            ErrorClass::Capability | ErrorClass::Authentication | ErrorClass::Usage | ErrorClass::Sink => {
                State::Failed(error)
            }
            ErrorClass::Timeout | ErrorClass::Transient if self.options.reconnect => {
                State::Disconnected(error)
            }
            ErrorClass::Timeout | ErrorClass::Transient => State::Failed(error),
        }
    }

    /// Handles a failure to open or subscribe.
    fn after_failure(&self, error: StreamError) -> State {
        match error.class() {
            ErrorClass::Capability | ErrorClass::Authentication | ErrorClass::Usage | ErrorClass::Sink => {
                State::Failed(error)
            }
            ErrorClass::Cancelled => State::Stopped,
            _ if self.should_stop() => State::Stopped,
            _ if !self.options.reconnect => State::Failed(error),
            _ => State::Disconnected(error),
        }
    }

    async fn back_off(&self, attempt: u32, error: StreamError) -> State {
        if self.should_stop() {
            return State::Stopped;
        }

        let delay = self.options.reconnect_delay;
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "event stream interrupted, reconnecting"
        );
        let wake = earliest(Some(Instant::now() + delay), self.options.stop_deadline)
            .unwrap_or_else(|| Instant::now() + delay);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return State::Stopped,
            _ = sleep_until(wake) => {}
        }

        if self.should_stop() {
            State::Stopped
        } else {
            State::Connecting
        }
    }

    /// Awaits one suspension point. `None` means the stop deadline passed or
    /// the session was cancelled first.
    async fn suspend<F: Future>(&self, future: F) -> Option<F::Output> {
        let stop = async {
            match self.options.stop_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = stop => None,
            output = future => Some(output),
        }
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || deadline_passed(self.options.stop_deadline)
    }
}

async fn close(connection: Connection) {
    if let Err(error) = connection.close().await {
        debug!(%error, "error closing event stream");
    }
}

struct Counting<'a, S: ?Sized> {
    inner: &'a mut S,
    forwarded: u64,
}

impl<S> EventSink for Counting<'_, S>
where
    S: EventSink + ?Sized,
{
    fn emit(&mut self, event: &Event) -> io::Result<()> {
        self.inner.emit(event)?;
        self.forwarded += 1;
        Ok(())
    }
}
