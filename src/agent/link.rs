use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::{OutboundBody, OutboundMessage};

use super::{AgentEvent, AgentId};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(25_000);
pub const DEFAULT_LOST_GRACE: Duration = Duration::from_millis(1_000);

/// Invoked with the browser's answer to a message sent with a callback.
pub type ResponseCallback = Box<dyn FnOnce(Result<Value, String>) + Send>;

#[derive(Default)]
struct LinkState {
    outbox: VecDeque<OutboundMessage>,
    message_seq: u64,
    callbacks: HashMap<u64, ResponseCallback>,
    poll: Option<(u64, oneshot::Sender<()>)>,
    poll_generation: u64,
    last_open: Option<Instant>,
    last_close: Option<Instant>,
    timer_generation: u64,
    timer_armed: bool,
    lost: bool,
    terminated: bool,
}

/// The long-poll side of an agent: outbound queue, held poll, response
/// callbacks, connection timestamps and the lost-connection timer.
///
/// Shared between the runner registry, the HTTP handlers and the parking
/// lot, so all state sits behind one mutex that is never held across an
/// await.
pub struct AgentLink {
    agent_id: AgentId,
    poll_timeout: Duration,
    lost_grace: Duration,
    events: mpsc::UnboundedSender<AgentEvent>,
    state: Mutex<LinkState>,
}

impl AgentLink {
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        poll_timeout: Duration,
        lost_grace: Duration,
        events: mpsc::UnboundedSender<AgentEvent>,
    ) -> Self {
        Self {
            agent_id,
            poll_timeout,
            lost_grace,
            events,
            state: Mutex::new(LinkState::default()),
        }
    }

    #[must_use]
    pub const fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Queues a message, stamping it with the next `seq`.
    ///
    /// With `at_front` the message jumps ahead of anything not yet
    /// delivered. A callback marks the message `responseRequired`. A held
    /// poll is released so the message goes out right away.
    pub fn send_message(
        &self,
        body: OutboundBody,
        at_front: bool,
        callback: Option<ResponseCallback>,
    ) -> u64 {
        let mut state = self.lock();
        state.message_seq = state.message_seq.saturating_add(1);
        let seq = state.message_seq;
        let message = OutboundMessage {
            seq: Some(seq),
            response_required: callback.is_some(),
            body,
        };
        debug!(agent = self.agent_id, seq, kind = message.body.kind_name(), "Queued message");
        if at_front {
            state.outbox.push_front(message);
        } else {
            state.outbox.push_back(message);
        }
        if let Some(callback) = callback {
            state.callbacks.insert(seq, callback);
        }
        if let Some((_, waker)) = state.poll.take()
            && waker.send(()).is_err()
        {
            debug!(agent = self.agent_id, "Held poll already went away");
        }
        seq
    }

    /// Resolves with every queued message as soon as at least one exists,
    /// or with whatever accumulated once the poll timeout elapses.
    ///
    /// A newer poll supersedes an older one; the older one resolves empty.
    pub async fn get_messages(&self) -> Vec<OutboundMessage> {
        let (generation, waiter) = {
            let mut state = self.lock();
            if !state.outbox.is_empty() {
                state.last_close = Some(Instant::now());
                return state.outbox.drain(..).collect();
            }
            state.poll_generation = state.poll_generation.wrapping_add(1);
            let generation = state.poll_generation;
            let (waker, waiter) = oneshot::channel();
            state.poll = Some((generation, waker));
            (generation, waiter)
        };

        let woke = tokio::time::timeout(self.poll_timeout, waiter).await;

        let mut state = self.lock();
        if state
            .poll
            .as_ref()
            .is_some_and(|(current, _)| *current == generation)
        {
            state.poll = None;
        }
        state.last_close = Some(Instant::now());
        match woke {
            Ok(Ok(())) | Err(_) => state.outbox.drain(..).collect(),
            Ok(Err(_)) => Vec::new(),
        }
    }

    /// Marks an incoming poll and cancels a pending lost-connection timer.
    pub fn on_connection_open(&self) {
        let mut state = self.lock();
        state.last_open = Some(Instant::now());
        state.timer_armed = false;
    }

    /// The browser hung up while its poll was held: release the poll
    /// without delivering anything and start the grace timer.
    pub fn connection_dropped(self: &Arc<Self>) {
        let generation = {
            let mut state = self.lock();
            state.poll = None;
            state.last_close = Some(Instant::now());
            state.timer_generation = state.timer_generation.wrapping_add(1);
            state.timer_armed = true;
            state.timer_generation
        };
        debug!(agent = self.agent_id, "Connection dropped");
        let link = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(link.lost_grace).await;
            link.grace_elapsed(generation);
        });
    }

    fn grace_elapsed(&self, generation: u64) {
        let fire = {
            let mut state = self.lock();
            if !state.timer_armed || state.timer_generation != generation {
                return;
            }
            state.timer_armed = false;
            if state.lost || state.terminated {
                false
            } else {
                state.lost = true;
                true
            }
        };
        if fire {
            self.emit(AgentEvent::LostConnection {
                agent_id: self.agent_id,
            });
        }
    }

    /// Cancels an armed grace timer, returning whether one was pending.
    /// Called before a re-registration so that listeners can clean up the
    /// previous connection first.
    pub fn take_armed_timer(&self) -> bool {
        let mut state = self.lock();
        std::mem::replace(&mut state.timer_armed, false)
    }

    /// Clears the fired lost-connection flag for a fresh registration.
    pub fn reset_lost(&self) {
        self.lock().lost = false;
    }

    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lock().lost
    }

    pub fn mark_terminated(&self) {
        self.lock().terminated = true;
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    /// Time since the connection closed, when it closed after it last
    /// opened.
    #[must_use]
    pub fn closed_for(&self) -> Option<Duration> {
        let state = self.lock();
        let closed = state.last_close?;
        match state.last_open {
            Some(opened) if opened >= closed => None,
            Some(_) | None => Some(closed.elapsed()),
        }
    }

    /// Runs and forgets the callback registered for `response_seq`.
    pub fn resolve_response(&self, response_seq: u64, value: Value, error: Option<String>) {
        let callback = self.lock().callbacks.remove(&response_seq);
        let Some(callback) = callback else {
            debug!(agent = self.agent_id, response_seq, "No callback for response");
            return;
        };
        callback(error.map_or(Ok(value), Err));
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().outbox.len()
    }

    pub fn emit(&self, event: AgentEvent) {
        if self.events.send(event).is_err() {
            warn!(agent = self.agent_id, "Runner event loop is gone");
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
