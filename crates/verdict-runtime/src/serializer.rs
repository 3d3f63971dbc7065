//! Per-workflow serialiser.
//!
//! A keyed actor map guarantees at most one in-flight handler per
//! `workflow_id` while handlers for different workflows run in parallel up
//! to the worker cap. Each live workflow owns a tokio task pulling from a
//! bounded FIFO queue; overflow surfaces as backpressure to ingress.
//!
//! The actor registry is a `DashMap` keyed by workflow id. Sends happen
//! through an entry guard and retirement through `remove_if`, both of which
//! hold the map's shard lock, so an actor retires only after verifying,
//! mutually excluded against every sender, that its queue is empty. No
//! event can race past a retiring actor.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, trace, warn};

use verdict_types::{EventEnvelope, WorkflowId};

use crate::handler::{ActorHandler, HandlerOutcome};

/// Pause between in-place retries of a failed event.
const RETRY_PAUSE: Duration = Duration::from_millis(50);

//─────────────────────────────
//  Actor map
//─────────────────────────────

pub(crate) enum ActorInput {
    Event(EventEnvelope),
    SignalsTick,
}

/// Result of handing an event to the serialiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The event was queued in arrival order.
    Enqueued,
    /// The workflow's queue is full; the caller should retry later.
    Backpressure,
}

type ActorMap = DashMap<WorkflowId, mpsc::Sender<ActorInput>>;

/// Keyed actor map with bounded per-workflow queues.
pub(crate) struct Serializer {
    actors: Arc<ActorMap>,
    permits: Arc<Semaphore>,
    queue_depth: usize,
    idle_ttl: Duration,
    max_attempts: u32,
    handler: Arc<dyn ActorHandler>,
}

impl Serializer {
    pub(crate) fn new(
        handler: Arc<dyn ActorHandler>,
        worker_cap: usize,
        queue_depth: usize,
        idle_ttl: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            actors: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(worker_cap.max(1))),
            queue_depth: queue_depth.max(1),
            idle_ttl,
            max_attempts: max_attempts.max(1),
            handler,
        }
    }

    /// Enqueue an event for its workflow's actor, spawning one if needed.
    pub(crate) fn enqueue(&self, event: EventEnvelope) -> EnqueueOutcome {
        let workflow_id = event.workflow_id.clone();
        let mut pending = event;

        let rx = match self.actors.entry(workflow_id.clone()) {
            Entry::Occupied(mut occupied) => {
                match occupied.get().try_send(ActorInput::Event(pending)) {
                    Ok(()) => return EnqueueOutcome::Enqueued,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        return EnqueueOutcome::Backpressure
                    }
                    Err(mpsc::error::TrySendError::Closed(input)) => {
                        // Retirement removes the entry under this shard lock
                        // first, so a closed channel means the actor task
                        // ended without retiring. Replace it in place.
                        match input {
                            ActorInput::Event(event) => pending = event,
                            ActorInput::SignalsTick => {
                                occupied.remove();
                                return EnqueueOutcome::Enqueued;
                            }
                        }
                        let (tx, rx) = mpsc::channel(self.queue_depth);
                        if tx.try_send(ActorInput::Event(pending)).is_err() {
                            occupied.remove();
                            return EnqueueOutcome::Backpressure;
                        }
                        occupied.insert(tx);
                        rx
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(self.queue_depth);
                if tx.try_send(ActorInput::Event(pending)).is_err() {
                    return EnqueueOutcome::Backpressure;
                }
                vacant.insert(tx);
                rx
            }
        };

        let actor = Actor {
            workflow_id,
            actors: Arc::clone(&self.actors),
            permits: Arc::clone(&self.permits),
            idle_ttl: self.idle_ttl,
            max_attempts: self.max_attempts,
            handler: Arc::clone(&self.handler),
        };
        tokio::spawn(actor.run(rx));
        EnqueueOutcome::Enqueued
    }

    /// Number of live actors, for observability.
    pub(crate) fn live_actors(&self) -> usize {
        self.actors.len()
    }
}

//─────────────────────────────
//  Per-workflow actor
//─────────────────────────────

struct Actor {
    workflow_id: WorkflowId,
    actors: Arc<ActorMap>,
    permits: Arc<Semaphore>,
    idle_ttl: Duration,
    max_attempts: u32,
    handler: Arc<dyn ActorHandler>,
}

impl Actor {
    async fn run(self, mut rx: mpsc::Receiver<ActorInput>) {
        let mut retry: Option<(EventEnvelope, u32)> = None;
        let mut tick_at: Option<Instant> = None;

        loop {
            let input = if let Some((event, _)) = &retry {
                ActorInput::Event(event.clone())
            } else {
                let idle_deadline = Instant::now() + self.idle_ttl;
                let deadline = tick_at.map_or(idle_deadline, |t| t.min(idle_deadline));
                let received = timeout_at(deadline, rx.recv()).await;
                match received {
                    Ok(Some(input)) => input,
                    Ok(None) => break,
                    Err(_) => {
                        if let Some(at) = tick_at {
                            if Instant::now() >= at {
                                tick_at = None;
                                ActorInput::SignalsTick
                            } else {
                                continue;
                            }
                        } else {
                            match self.try_retire(&mut rx) {
                                Some(input) => input,
                                None => break,
                            }
                        }
                    }
                }
            };

            let Ok(_permit) = self.permits.acquire().await else {
                break;
            };

            let outcome = match &input {
                ActorInput::Event(event) => self.handler.handle_event(event).await,
                ActorInput::SignalsTick => self.handler.handle_tick(&self.workflow_id).await,
            };

            match outcome {
                HandlerOutcome::Done { arm_signals_tick } => {
                    retry = None;
                    tick_at = arm_signals_tick.map(|delay| Instant::now() + delay);
                }
                HandlerOutcome::Retry(reason) => {
                    if let ActorInput::Event(event) = input {
                        let attempts = retry.take().map_or(0, |(_, n)| n) + 1;
                        if attempts >= self.max_attempts {
                            self.handler.dead_letter(&event, attempts, &reason).await;
                        } else {
                            debug!(
                                workflow_id = %self.workflow_id,
                                event_id = %event.event_id,
                                attempts,
                                reason = %reason,
                                "retrying event in place"
                            );
                            retry = Some((event, attempts));
                            sleep(RETRY_PAUSE * attempts).await;
                        }
                    }
                }
                HandlerOutcome::Failed(reason) => {
                    if let ActorInput::Event(event) = input {
                        let attempts = retry.take().map_or(0, |(_, n)| n) + 1;
                        self.handler.dead_letter(&event, attempts, &reason).await;
                    } else {
                        warn!(workflow_id = %self.workflow_id, reason = %reason, "tick handling failed");
                    }
                    retry = None;
                }
            }
        }
        trace!(workflow_id = %self.workflow_id, "actor stopped");
    }

    /// Retire if the queue is verifiably empty.
    ///
    /// `remove_if` evaluates its predicate under the map's shard lock, the
    /// same lock every sender's entry guard takes, so an empty queue
    /// observed here cannot gain an event before the entry is removed. A
    /// non-empty queue hands its head back for processing instead.
    fn try_retire(&self, rx: &mut mpsc::Receiver<ActorInput>) -> Option<ActorInput> {
        let mut head = None;
        let removed = self.actors.remove_if(&self.workflow_id, |_, _| match rx.try_recv() {
            Ok(input) => {
                head = Some(input);
                false
            }
            Err(_) => true,
        });
        if removed.is_some() {
            debug!(workflow_id = %self.workflow_id, "idle actor released");
        }
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use verdict_types::{CorrelationId, EventId, EventKind, SelfiePayload, TenantId};

    fn envelope(workflow: &str, event_id: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: EventId::new(event_id),
            workflow_id: WorkflowId::new(workflow),
            tenant_id: TenantId::new("acme"),
            correlation_id: CorrelationId::new(event_id),
            timestamp: Utc::now(),
            kind: EventKind::SelfieUploaded(SelfiePayload {
                liveness_score: 0.85,
                confidence: 0.9,
                face_centered: true,
                face_size: 0.4,
            }),
        }
    }

    /// Handler that blocks until released, recording processing order.
    struct GatedHandler {
        gate: Notify,
        processed: Mutex<Vec<String>>,
        in_flight: AtomicU32,
        max_in_flight_per_key: AtomicU32,
    }

    impl GatedHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                processed: Mutex::new(Vec::new()),
                in_flight: AtomicU32::new(0),
                max_in_flight_per_key: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ActorHandler for GatedHandler {
        async fn handle_event(&self, event: &EventEnvelope) -> HandlerOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight_per_key.fetch_max(now, Ordering::SeqCst);
            self.gate.notified().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.processed.lock().unwrap().push(event.event_id.to_string());
            HandlerOutcome::Done { arm_signals_tick: None }
        }

        async fn handle_tick(&self, _workflow_id: &WorkflowId) -> HandlerOutcome {
            HandlerOutcome::Done { arm_signals_tick: None }
        }

        async fn dead_letter(&self, _event: &EventEnvelope, _attempts: u32, _reason: &str) {}
    }

    /// Handler that always reports a retriable failure.
    struct FailingHandler {
        attempts_seen: AtomicU32,
        dead_lettered: Mutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl ActorHandler for FailingHandler {
        async fn handle_event(&self, _event: &EventEnvelope) -> HandlerOutcome {
            self.attempts_seen.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Retry("store unavailable".to_owned())
        }

        async fn handle_tick(&self, _workflow_id: &WorkflowId) -> HandlerOutcome {
            HandlerOutcome::Done { arm_signals_tick: None }
        }

        async fn dead_letter(&self, event: &EventEnvelope, attempts: u32, _reason: &str) {
            self.dead_lettered.lock().unwrap().push((event.event_id.to_string(), attempts));
        }
    }

    #[tokio::test]
    async fn overflow_returns_backpressure_without_enqueueing() {
        let handler = GatedHandler::new();
        let serializer = Serializer::new(handler.clone(), 4, 1, Duration::from_secs(30), 3);

        // First event is pulled into processing and parks on the gate.
        assert_eq!(serializer.enqueue(envelope("wf-1", "e1")), EnqueueOutcome::Enqueued);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Queue depth 1: one more fits, the next overflows.
        assert_eq!(serializer.enqueue(envelope("wf-1", "e2")), EnqueueOutcome::Enqueued);
        assert_eq!(serializer.enqueue(envelope("wf-1", "e3")), EnqueueOutcome::Backpressure);

        // Releasing the gate drains the queue in FIFO order.
        handler.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handler.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*handler.processed.lock().unwrap(), vec!["e1".to_owned(), "e2".to_owned()]);
    }

    #[tokio::test]
    async fn one_handler_per_workflow_at_a_time() {
        let handler = GatedHandler::new();
        let serializer = Serializer::new(handler.clone(), 8, 8, Duration::from_secs(30), 3);

        for i in 0..4 {
            serializer.enqueue(envelope("wf-1", &format!("e{i}")));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for _ in 0..4 {
            handler.gate.notify_one();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Only one handler was ever in flight for the single workflow.
        assert_eq!(handler.max_in_flight_per_key.load(Ordering::SeqCst), 1);
        assert_eq!(handler.processed.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn retriable_failures_dead_letter_after_max_attempts() {
        let handler = Arc::new(FailingHandler {
            attempts_seen: AtomicU32::new(0),
            dead_lettered: Mutex::new(Vec::new()),
        });
        let serializer = Serializer::new(handler.clone(), 4, 8, Duration::from_secs(30), 3);

        serializer.enqueue(envelope("wf-1", "e1"));
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(handler.attempts_seen.load(Ordering::SeqCst), 3);
        assert_eq!(*handler.dead_lettered.lock().unwrap(), vec![("e1".to_owned(), 3)]);
    }

    #[tokio::test]
    async fn idle_actors_retire_and_respawn_on_reentry() {
        let handler = GatedHandler::new();
        let serializer = Serializer::new(handler.clone(), 4, 8, Duration::from_millis(50), 3);

        serializer.enqueue(envelope("wf-1", "e1"));
        handler.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(serializer.live_actors(), 0);

        assert_eq!(serializer.enqueue(envelope("wf-1", "e2")), EnqueueOutcome::Enqueued);
        assert_eq!(serializer.live_actors(), 1);
        handler.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.processed.lock().unwrap().len(), 2);
    }
}
