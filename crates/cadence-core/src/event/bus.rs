//! Broadcast bus for `PipelineEvent`s.
//!
//! Built on `tokio::sync::broadcast`: the engine publishes without waiting and
//! events published while nobody listens are dropped. Observers interested in
//! a single run use [`EventBus::subscribe_run`], which also follows runs forked
//! from it.

use std::collections::HashSet;

use cadence_types::event::PipelineEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use uuid::Uuid;

/// Multi-consumer event bus. Clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// `capacity` bounds how far a slow subscriber may fall behind before it
    /// starts missing events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Events of `run_id` and of any run forked from it, published from now on.
    pub fn subscribe_run(&self, run_id: Uuid) -> RunEvents {
        RunEvents {
            receiver: self.sender.subscribe(),
            runs: HashSet::from([run_id]),
        }
    }

    pub fn publish(&self, event: PipelineEvent) {
        // Err only means there are no subscribers.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A subscription narrowed to one run and its forks.
pub struct RunEvents {
    receiver: broadcast::Receiver<PipelineEvent>,
    runs: HashSet<Uuid>,
}

impl RunEvents {
    /// Next event for a followed run. Lagging is reported, not skipped silently.
    pub async fn recv(&mut self) -> Result<PipelineEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.follows(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<PipelineEvent, TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.follows(&event) {
                return Ok(event);
            }
        }
    }

    fn follows(&mut self, event: &PipelineEvent) -> bool {
        if let PipelineEvent::RunForked {
            parent_run_id,
            run_id,
            ..
        } = event
        {
            if self.runs.contains(parent_run_id) {
                self.runs.insert(*run_id);
                return true;
            }
        }
        self.runs.contains(&event.run_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(run_id: Uuid) -> PipelineEvent {
        PipelineEvent::RunStarted {
            run_id,
            pipeline: "article".to_string(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let run_id = Uuid::now_v7();

        bus.clone().publish(started(run_id));

        assert_eq!(first.recv().await.unwrap().run_id(), run_id);
        assert_eq!(second.recv().await.unwrap().run_id(), run_id);
    }

    #[test]
    fn publishing_without_subscribers_is_dropped() {
        let bus = EventBus::new(8);
        bus.publish(started(Uuid::now_v7()));
        assert_eq!(bus.subscriber_count(), 0);
        assert!(format!("{bus:?}").contains("subscribers: 0"));
    }

    #[tokio::test]
    async fn run_subscription_skips_other_runs() {
        let bus = EventBus::new(8);
        let mine = Uuid::now_v7();
        let mut events = bus.subscribe_run(mine);

        bus.publish(started(Uuid::now_v7()));
        bus.publish(started(mine));

        assert_eq!(events.recv().await.unwrap().run_id(), mine);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn run_subscription_follows_forks() {
        let bus = EventBus::new(8);
        let parent = Uuid::now_v7();
        let child = Uuid::now_v7();
        let mut events = bus.subscribe_run(parent);

        bus.publish(PipelineEvent::RunForked {
            parent_run_id: parent,
            run_id: child,
            from_stage: "draft".to_string(),
        });
        bus.publish(PipelineEvent::RunCancelled { run_id: child });

        assert!(matches!(events.try_recv(), Ok(PipelineEvent::RunForked { .. })));
        assert!(matches!(events.try_recv(), Ok(PipelineEvent::RunCancelled { .. })));
    }

    #[test]
    fn slow_subscriber_learns_it_lagged() {
        let bus = EventBus::new(1);
        let run_id = Uuid::now_v7();
        let mut events = bus.subscribe_run(run_id);

        bus.publish(started(run_id));
        bus.publish(started(run_id));

        assert!(matches!(events.try_recv(), Err(TryRecvError::Lagged(1))));
        assert!(events.try_recv().is_ok());
    }
}
