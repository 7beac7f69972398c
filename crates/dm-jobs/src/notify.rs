//! Notification sinks. Observers subscribe; the core never reads them back.
//!
//! Publishing is fire-and-forget: a sink that fails logs a warning and the
//! operation that produced the event carries on.

use dm_core::events::Notification;
use tokio::sync::broadcast;
use tracing::{info, warn};

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Clone)]
pub enum Notifier {
    /// In-process fan-out. Lagging receivers lose the oldest events.
    Broadcast(broadcast::Sender<Notification>),
    /// Structured log line per event
    Log,
    #[cfg(feature = "nats")]
    Nats(crate::nats::NatsClient),
    /// Every sink in turn
    Fanout(Vec<Notifier>),
}

impl Notifier {
    /// A broadcast notifier and its first receiver.
    pub fn broadcast() -> (Self, broadcast::Receiver<Notification>) {
        let (tx, rx) = broadcast::channel(BROADCAST_CAPACITY);
        (Notifier::Broadcast(tx), rx)
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<Notification>> {
        match self {
            Notifier::Broadcast(tx) => Some(tx.subscribe()),
            Notifier::Fanout(sinks) => sinks.iter().find_map(Notifier::subscribe),
            _ => None,
        }
    }

    pub async fn publish(&self, event: Notification) {
        let mut sinks = Vec::new();
        self.leaves(&mut sinks);
        for sink in sinks {
            sink.publish_one(&event).await;
        }
    }

    fn leaves<'a>(&'a self, out: &mut Vec<&'a Notifier>) {
        match self {
            Notifier::Fanout(sinks) => sinks.iter().for_each(|s| s.leaves(out)),
            leaf => out.push(leaf),
        }
    }

    async fn publish_one(&self, event: &Notification) {
        match self {
            Notifier::Broadcast(tx) => {
                // no receivers is not an error
                let _ = tx.send(event.clone());
            }
            Notifier::Log => log_event(event),
            #[cfg(feature = "nats")]
            Notifier::Nats(client) => {
                if let Err(e) = client.publish_event(event).await {
                    warn!(event_type = event.event_type(), "NATS publish failed: {e}");
                }
            }
            Notifier::Fanout(_) => {}
        }
    }
}

fn log_event(event: &Notification) {
    match event {
        Notification::JobFailed { job_id, error } => {
            warn!(event = event.event_type(), job_id, error, "job failed");
        }
        Notification::HashesCommitted { count } => {
            info!(event = event.event_type(), count, "hashes committed");
        }
        other => match serde_json::to_string(other) {
            Ok(json) => info!(event = other.event_type(), job_id = other.job_id(), %json, "event"),
            Err(e) => warn!(event = other.event_type(), "unserializable event: {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_core::types::JobStatus;

    #[tokio::test]
    async fn broadcast_delivers_to_every_subscriber() {
        let (notifier, mut rx1) = Notifier::broadcast();
        let mut rx2 = notifier.subscribe().unwrap();

        let event = Notification::JobUpdate {
            job_id: "j1".into(),
            status: JobStatus::InProgress,
        };
        notifier.publish(event.clone()).await;

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn fanout_reaches_nested_broadcast() {
        let (broadcast, mut rx) = Notifier::broadcast();
        let notifier = Notifier::Fanout(vec![Notifier::Log, broadcast]);
        assert!(notifier.subscribe().is_some());

        notifier
            .publish(Notification::HashesCommitted { count: 3 })
            .await;
        assert_eq!(
            rx.recv().await.unwrap(),
            Notification::HashesCommitted { count: 3 }
        );
    }

    #[tokio::test]
    async fn publishing_without_receivers_is_fine() {
        let (notifier, rx) = Notifier::broadcast();
        drop(rx);
        notifier
            .publish(Notification::HashesCommitted { count: 0 })
            .await;
        assert!(Notifier::Log.subscribe().is_none());
    }
}
