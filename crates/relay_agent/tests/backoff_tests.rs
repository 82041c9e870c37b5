//! Reconnect timing, on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_agent::{
    events::{AgentEvent, EventBus},
    pickup::{BackoffPolicy, ReconnectAction, ReconnectBackoffManager},
    AgentError, Shutdown,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

const CONNECTION: &str = "conn-1";

/// Reports when it ran; fails the first `failures` attempts.
struct AttemptRecorder {
    ran: mpsc::UnboundedSender<Instant>,
    failures: parking_lot::Mutex<usize>,
}

#[async_trait]
impl ReconnectAction for AttemptRecorder {
    async fn reconnect(&self) -> Result<(), AgentError> {
        let _ = self.ran.send(Instant::now());
        let mut failures = self.failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(AgentError::Transport("still down".into()));
        }
        Ok(())
    }
}

fn closed() -> AgentEvent {
    AgentEvent::OutboundSessionClosed {
        endpoint: "wss://mediator.example".into(),
        connection_id: Some(CONNECTION.into()),
    }
}

fn opened() -> AgentEvent {
    AgentEvent::OutboundSessionOpened {
        endpoint: "wss://mediator.example".into(),
        connection_id: Some(CONNECTION.into()),
    }
}

fn start(failures: usize) -> (EventBus, Shutdown, mpsc::UnboundedReceiver<Instant>, tokio::task::JoinHandle<()>) {
    let events = EventBus::new(16);
    let shutdown = Shutdown::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let action = Arc::new(AttemptRecorder {
        ran: tx,
        failures: parking_lot::Mutex::new(failures),
    });
    let handle = ReconnectBackoffManager::new(
        CONNECTION,
        BackoffPolicy {
            base: Duration::from_secs(2),
            max: Duration::from_secs(10),
        },
        events.clone(),
        action,
        shutdown.clone(),
    )
    .spawn();
    (events, shutdown, rx, handle)
}

#[tokio::test(start_paused = true)]
async fn consecutive_failures_double_up_to_the_cap() {
    let (events, shutdown, mut ran, handle) = start(usize::MAX);

    let closed_at = Instant::now();
    events.emit(closed());
    let mut attempts = Vec::new();
    for _ in 0..5 {
        attempts.push(ran.recv().await.unwrap());
    }

    let gaps: Vec<u64> = std::iter::once(closed_at)
        .chain(attempts.iter().copied())
        .collect::<Vec<_>>()
        .windows(2)
        .map(|w| (w[1] - w[0]).as_secs())
        .collect();
    assert_eq!(gaps, vec![2, 4, 8, 10, 10]);

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn open_resets_the_interval() {
    let (events, shutdown, mut ran, handle) = start(0);

    let t0 = Instant::now();
    events.emit(closed());
    let first = ran.recv().await.unwrap();
    assert_eq!(first - t0, Duration::from_secs(2));

    // No open in between: the next wait doubles.
    let t1 = Instant::now();
    events.emit(closed());
    let second = ran.recv().await.unwrap();
    assert_eq!(second - t1, Duration::from_secs(4));

    events.emit(opened());
    let t2 = Instant::now();
    events.emit(closed());
    let third = ran.recv().await.unwrap();
    assert_eq!(third - t2, Duration::from_secs(2));

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn other_connections_are_ignored_and_shutdown_stops_waiting() {
    let (events, shutdown, mut ran, handle) = start(0);

    events.emit(AgentEvent::OutboundSessionClosed {
        endpoint: "wss://elsewhere.example".into(),
        connection_id: Some("conn-2".into()),
    });
    events.emit(closed());
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.trigger();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("manager stops on shutdown")
        .unwrap();
    assert!(ran.try_recv().is_err());
}
