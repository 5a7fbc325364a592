//! Core actor framework types and traits.
//!
//! Provides the fundamental building blocks for the actor system:
//! - `Actor` trait for defining actor behavior
//! - `ActorContext` giving a running actor access to its own mailbox
//! - `Supervisor` for managing actor lifecycles
//! - `ActorHandle` for sending messages to actors

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `true` to continue, `false` to stop. Failures belong to the
    /// actor's own state and are reported from there.
    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext<Self::Message>) -> bool;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self::Message>) {}

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {
        // Default: no cleanup
    }
}

/// Context provided to actors during message handling.
pub struct ActorContext<M> {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Message counter.
    pub messages_processed: u64,

    /// Last time a message was taken from the mailbox.
    pub last_message_at: Option<Instant>,

    /// Current actor state (for introspection).
    pub state: ActorState,

    /// Shutdown signal receiver.
    shutdown: watch::Receiver<bool>,

    /// The actor's own mailbox.
    mailbox: mpsc::UnboundedReceiver<M>,
}

impl<M: Message> ActorContext<M> {
    fn new(
        actor_id: String,
        shutdown: watch::Receiver<bool>,
        mailbox: mpsc::UnboundedReceiver<M>,
    ) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
            last_message_at: None,
            state: ActorState::Starting,
            shutdown,
            mailbox,
        }
    }

    /// Check if shutdown has been signaled.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Take the next message that is already waiting, without blocking.
    ///
    /// Lets an actor fold messages that arrived while it was busy into the
    /// work it is currently doing.
    pub fn try_next(&mut self) -> Option<M> {
        let msg = self.mailbox.try_recv().ok()?;
        self.record_message();
        Some(msg)
    }

    fn record_message(&mut self) {
        self.messages_processed += 1;
        self.last_message_at = Some(Instant::now());
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Actor is starting up.
    Starting,
    /// Actor is running and processing messages.
    Running,
    /// Actor is stopping.
    Stopping,
    /// Actor has stopped.
    Stopped,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from talking to an actor.
#[derive(Debug, Error)]
pub enum ActorError {
    /// The actor has stopped and dropped its mailbox.
    #[error("actor stopped")]
    ActorStopped,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
///
/// Mailboxes are unbounded: sending never waits on the actor, which may be
/// busy with slow device I/O for a long time.
#[derive(Debug)]
pub struct ActorHandle<M: Message> {
    /// Sender for the actor's mailbox.
    tx: mpsc::UnboundedSender<M>,

    /// Actor ID for logging.
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor.
    pub fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).map_err(|_| ActorError::ActorStopped)
    }

    /// Returns true once the actor has dropped its mailbox.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Type-erased actor reference for supervision.
pub struct ActorRef {
    /// Actor ID.
    pub actor_id: String,

    /// Actor type name.
    pub actor_type: String,

    /// Task handle.
    task_handle: tokio::task::JoinHandle<()>,

    /// Shutdown sender.
    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if the actor task is still running.
    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Abort the actor task immediately.
    pub fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// How long a stopping actor may take to finish its current message.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Supervisor for managing actor lifecycles.
#[derive(Default)]
pub struct Supervisor {
    /// Supervised actors.
    children: HashMap<String, ActorRef>,
}

impl Supervisor {
    /// Create a new supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn and supervise an actor.
    pub fn spawn<A>(&mut self, actor: A) -> ActorHandle<A::Message>
    where
        A: Actor,
    {
        let actor_id = format!("{}_{}", actor.name(), generate_actor_id());
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let actor_type = actor.name().to_string();
        let ctx = ActorContext::new(actor_id.clone(), shutdown_rx, rx);

        let task_handle = tokio::spawn(run_actor_loop(actor, ctx));

        self.children.insert(
            actor_id.clone(),
            ActorRef {
                actor_id: actor_id.clone(),
                actor_type: actor_type.clone(),
                task_handle,
                shutdown_tx,
            },
        );

        info!(actor_id = %actor_id, actor_type = %actor_type, "Spawned actor");

        ActorHandle { tx, actor_id }
    }

    /// Stop a single actor and wait for it to finish.
    ///
    /// Returns false if no such actor is supervised.
    pub async fn stop(&mut self, actor_id: &str) -> bool {
        let Some(child) = self.children.remove(actor_id) else {
            return false;
        };

        child.stop();
        wait_for_stop(std::slice::from_ref(&child)).await;
        true
    }

    /// Stop all supervised actors.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");

        let children: Vec<ActorRef> = self.children.drain().map(|(_, child)| child).collect();
        for child in &children {
            child.stop();
        }

        wait_for_stop(&children).await;
    }

    /// Get count of running actors.
    pub fn running_count(&self) -> usize {
        self.children
            .values()
            .filter(|c| c.is_running())
            .count()
    }
}

async fn wait_for_stop(children: &[ActorRef]) {
    // Wait for all to finish with timeout
    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        if children.iter().all(|c| !c.is_running()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Force abort any remaining
    for child in children {
        if child.is_running() {
            warn!(actor_id = %child.actor_id, actor_type = %child.actor_type, "Force aborting actor");
            child.abort();
        }
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

enum Next<M> {
    Shutdown,
    Message(M),
    Closed,
}

/// Run the main actor loop.
async fn run_actor_loop<A: Actor>(mut actor: A, mut ctx: ActorContext<A::Message>) {
    let actor_id = ctx.actor_id.clone();

    actor.on_start(&mut ctx).await;

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "Actor started");

    loop {
        let next = tokio::select! {
            biased;

            // Check shutdown first
            changed = ctx.shutdown.changed() => {
                match changed {
                    Ok(()) if !*ctx.shutdown.borrow() => continue,
                    // A dropped sender means the supervisor is gone
                    _ => Next::Shutdown,
                }
            }

            msg = ctx.mailbox.recv() => match msg {
                Some(msg) => Next::Message(msg),
                None => Next::Closed,
            },
        };

        match next {
            Next::Shutdown => {
                info!(actor_id = %actor_id, "Actor received shutdown signal");
                break;
            }
            Next::Closed => {
                debug!(actor_id = %actor_id, "Actor mailbox closed");
                break;
            }
            Next::Message(msg) => {
                ctx.record_message();

                if !actor.handle(msg, &mut ctx).await {
                    info!(actor_id = %actor_id, "Actor requested stop");
                    break;
                }
            }
        }
    }

    ctx.state = ActorState::Stopping;
    actor.on_stop(&mut ctx).await;
    ctx.state = ActorState::Stopped;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct Note(u32);

    /// Records every batch it handles: the triggering message plus whatever
    /// was already waiting in the mailbox.
    struct Batcher {
        batches: Arc<Mutex<Vec<Vec<u32>>>>,
    }

    #[async_trait]
    impl Actor for Batcher {
        type Message = Note;

        fn name(&self) -> &str {
            "batcher"
        }

        async fn handle(&mut self, msg: Note, ctx: &mut ActorContext<Note>) -> bool {
            let mut batch = vec![msg.0];
            while let Some(Note(n)) = ctx.try_next() {
                batch.push(n);
            }
            self.batches.lock().unwrap().push(batch);
            true
        }
    }

    #[tokio::test]
    async fn test_actor_handle_send() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Note>();
        let handle = ActorHandle {
            tx,
            actor_id: "test".to_string(),
        };

        handle.send(Note(7)).unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.0, 7);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (tx, rx) = mpsc::unbounded_channel::<Note>();
        let handle = ActorHandle {
            tx,
            actor_id: "test".to_string(),
        };
        drop(rx);

        assert!(handle.is_closed());
        assert!(matches!(handle.send(Note(1)), Err(ActorError::ActorStopped)));
    }

    #[tokio::test]
    async fn test_waiting_messages_are_batched() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let mut supervisor = Supervisor::new();
        let handle = supervisor.spawn(Batcher {
            batches: Arc::clone(&batches),
        });

        // All three are queued before the actor task gets to run
        for n in 1..=3 {
            handle.send(Note(n)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3]]);
        supervisor.stop_all().await;
    }

    /// Stops itself on the first message.
    struct OneShot;

    #[async_trait]
    impl Actor for OneShot {
        type Message = Note;

        fn name(&self) -> &str {
            "one_shot"
        }

        async fn handle(&mut self, _msg: Note, _ctx: &mut ActorContext<Note>) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_handler_can_stop_actor() {
        let mut supervisor = Supervisor::new();
        let handle = supervisor.spawn(OneShot);

        handle.send(Note(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handle.is_closed());
        assert_eq!(supervisor.running_count(), 0);
        assert!(matches!(handle.send(Note(2)), Err(ActorError::ActorStopped)));
    }

    #[tokio::test]
    async fn test_stop_single_actor() {
        let mut supervisor = Supervisor::new();
        let handle = supervisor.spawn(Batcher {
            batches: Arc::new(Mutex::new(Vec::new())),
        });
        assert_eq!(supervisor.running_count(), 1);

        assert!(supervisor.stop(handle.actor_id()).await);
        assert_eq!(supervisor.running_count(), 0);
        assert!(!supervisor.stop(handle.actor_id()).await);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_closed());
    }
}
