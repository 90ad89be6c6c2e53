use std::io;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::connection::Connection;
use super::envelope::Event;
use super::StreamError;

/// Receives forwarded events, one at a time, in arrival order.
pub trait EventSink {
    fn emit(&mut self, event: &Event) -> io::Result<()>;
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: &Event) -> io::Result<()> {
        self.push(event.clone());
        Ok(())
    }
}

/// Pulls events off one connection until the stop deadline, cancellation or
/// an error ends it.
#[derive(Debug, Clone)]
pub struct ReadLoop {
    stop_deadline: Option<Instant>,
    idle_timeout: Option<Duration>,
    include_control: bool,
    cancel: CancellationToken,
}

impl ReadLoop {
    pub fn new(stop_deadline: Option<Instant>, include_control: bool, cancel: CancellationToken) -> Self {
        Self {
            stop_deadline,
            idle_timeout: None,
            include_control,
            cancel,
        }
    }

    /// Bounds each receive. Expiry before the stop deadline is an error.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Returns `Ok` only once the stop deadline has been reached.
    ///
    /// A receive timeout that is not the stop deadline is returned as an
    /// error: the websocket cannot resume a read that was abandoned midway, so
    /// the caller has to reconnect.
    pub async fn run<S>(&self, connection: &Connection, sink: &mut S) -> Result<(), StreamError>
    where
        S: EventSink + ?Sized,
    {
        let mut last_sequence = None;

        loop {
            if deadline_passed(self.stop_deadline) {
                return Ok(());
            }

            let receive_deadline = earliest(
                self.stop_deadline,
                self.idle_timeout.map(|idle| Instant::now() + idle),
            );
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
                received = connection.receive_event(receive_deadline) => received,
            };

            let event = match received {
                Ok(event) => event,
                Err(error) if error.is_timeout() && deadline_passed(self.stop_deadline) => return Ok(()),
                Err(error) => return Err(error),
            };

            note_sequence(&mut last_sequence, &event);
            if event.is_control() && !self.include_control {
                debug!(kind = event.kind.as_str(), "suppressing control event");
                continue;
            }
            sink.emit(&event).map_err(StreamError::Sink)?;
        }
    }
}

fn note_sequence(last: &mut Option<u64>, event: &Event) {
    let Some(sequence) = event.sequence else {
        return;
    };
    if let Some(previous) = *last {
        if sequence <= previous {
            debug!(previous, sequence, "event sequence went backwards");
        } else if sequence > previous.saturating_add(1) {
            debug!(previous, sequence, missed = sequence - previous - 1, "event sequence gap");
        }
    }
    *last = Some(sequence);
}

pub(super) fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

pub(super) fn earliest(left: Option<Instant>, right: Option<Instant>) -> Option<Instant> {
    match (left, right) {
        (Some(left), Some(right)) => Some(left.min(right)),
        (left, right) => left.or(right),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::realtime::envelope::EventKind;
    use crate::realtime::test_server::{Script, Step, TestServer};

    async fn open(server: &TestServer) -> Connection {
        Connection::open(&server.base_url, "token", Duration::from_secs(5))
            .await
            .expect("open")
    }

    #[test]
    fn earliest_prefers_the_sooner_deadline() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest(Some(now), Some(later)), Some(now));
        assert_eq!(earliest(None, Some(later)), Some(later));
        assert_eq!(earliest(Some(now), None), Some(now));
        assert_eq!(earliest(None, None), None);
    }

    #[tokio::test]
    async fn elapsed_stop_deadline_returns_before_receiving() {
        let connection = Connection::unopened();
        let read_loop = ReadLoop::new(Some(Instant::now()), false, CancellationToken::new());
        let mut sink = Vec::new();

        read_loop.run(&connection, &mut sink).await.expect("stopped");
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn control_events_are_suppressed_by_default() {
        let server = TestServer::spawn(|_| {
            Script::Accept(vec![
                Step::Send(json!({ "type": "ready" })),
                Step::Send(json!({ "type": "message.upserted", "chatID": "c1", "seq": 1 })),
                Step::Hold,
            ])
        })
        .await;
        let connection = open(&server).await;
        let stop = Instant::now() + Duration::from_millis(200);
        let mut sink = Vec::new();

        ReadLoop::new(Some(stop), false, CancellationToken::new())
            .run(&connection, &mut sink)
            .await
            .expect("stopped at deadline");

        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].kind, EventKind::Domain("message.upserted".to_string()));
        assert!(Instant::now() >= stop);
        connection.close().await.expect("close");
    }

    #[tokio::test]
    async fn control_events_pass_when_requested() {
        let server = TestServer::spawn(|_| {
            Script::Accept(vec![
                Step::Send(json!({ "type": "ready" })),
                Step::Send(json!({ "type": "message.upserted" })),
                Step::Hold,
            ])
        })
        .await;
        let connection = open(&server).await;
        let stop = Instant::now() + Duration::from_millis(200);
        let mut sink = Vec::new();

        ReadLoop::new(Some(stop), true, CancellationToken::new())
            .run(&connection, &mut sink)
            .await
            .expect("stopped at deadline");

        let kinds: Vec<_> = sink.iter().map(|event| event.kind.as_str().to_string()).collect();
        assert_eq!(kinds, vec!["ready", "message.upserted"]);
        connection.close().await.expect("close");
    }

    #[tokio::test]
    async fn idle_timeout_before_stop_is_an_error() {
        let server = TestServer::spawn(|_| Script::Accept(vec![Step::Hold])).await;
        let connection = open(&server).await;
        let stop = Instant::now() + Duration::from_secs(5);

        let error = ReadLoop::new(Some(stop), false, CancellationToken::new())
            .with_idle_timeout(Some(Duration::from_millis(30)))
            .run(&connection, &mut Vec::new())
            .await
            .expect_err("idle timeout");
        assert!(error.is_timeout());
        connection.close().await.expect("close");
    }

    #[tokio::test]
    async fn server_close_is_propagated() {
        let server = TestServer::spawn(|_| {
            Script::Accept(vec![
                Step::Send(json!({ "type": "message.upserted" })),
                Step::Drop,
            ])
        })
        .await;
        let connection = open(&server).await;
        let mut sink = Vec::new();

        let error = ReadLoop::new(None, false, CancellationToken::new())
            .run(&connection, &mut sink)
            .await
            .expect_err("closed");
        assert!(error.is_stream_closed(), "unexpected error: {error}");
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_receive() {
        let server = TestServer::spawn(|_| Script::Accept(vec![Step::Hold])).await;
        let connection = open(&server).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let error = ReadLoop::new(None, false, cancel)
            .run(&connection, &mut Vec::new())
            .await
            .expect_err("cancelled");
        assert!(matches!(error, StreamError::Cancelled));
        connection.close().await.expect("close");
    }

    struct FailingSink;

    impl EventSink for FailingSink {
        fn emit(&mut self, _event: &Event) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdout closed"))
        }
    }

    #[tokio::test]
    async fn sink_failures_stop_the_loop() {
        let server = TestServer::spawn(|_| {
            Script::Accept(vec![Step::Send(json!({ "type": "message.upserted" })), Step::Hold])
        })
        .await;
        let connection = open(&server).await;

        let error = ReadLoop::new(None, false, CancellationToken::new())
            .run(&connection, &mut FailingSink)
            .await
            .expect_err("sink error");
        assert!(matches!(error, StreamError::Sink(_)));
        connection.close().await.expect("close");
    }
}
