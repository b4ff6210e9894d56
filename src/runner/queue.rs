use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

use crate::agent::AgentId;
use crate::error::RunnerError;
use crate::protocol::{InboundBody, InboundMessage};

use super::state::{QueueItem, Validated};
use super::{ReportEvent, Runner};

impl Runner {
    /// Queues a validated batch behind everything queued earlier.
    ///
    /// With a chunk size set the batch is split so that one agent's burst
    /// cannot hold the queue for long. The returned receiver resolves once
    /// the whole batch was processed.
    pub(super) fn queue_messages(
        &self,
        agent_id: AgentId,
        messages: Vec<Validated>,
    ) -> oneshot::Receiver<()> {
        let (done, receiver) = oneshot::channel();
        let size = match self.settings.message_chunk_size {
            0 => messages.len().max(1),
            size => size,
        };
        {
            let mut state = self.lock();
            let mut pending = messages.into_iter().peekable();
            while pending.peek().is_some() {
                let chunk: Vec<Validated> = pending.by_ref().take(size).collect();
                debug!(agent = agent_id, len = chunk.len(), "Queued message chunk");
                state.queue.push_back(QueueItem::Chunk {
                    agent_id,
                    messages: chunk,
                });
            }
            state.queue.push_back(QueueItem::Done(done));
        }
        self.pump.notify_one();
        receiver
    }

    /// Resolves once everything queued so far was processed.
    ///
    /// # Errors
    ///
    /// Returns an error when the runner was destroyed before the queue
    /// drained.
    pub async fn settle(&self) -> Result<(), RunnerError> {
        let (done, receiver) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.destroyed {
                return Err(RunnerError::Destroyed);
            }
            state.queue.push_back(QueueItem::Done(done));
        }
        self.pump.notify_one();
        if receiver.await.is_err() {
            return Err(RunnerError::QueueClosed);
        }
        Ok(())
    }

    async fn drain_queue(&self) {
        loop {
            let item = {
                let mut state = self.lock();
                let item = state.queue.pop_front();
                state.processing = matches!(item, Some(QueueItem::Chunk { .. }));
                item
            };
            match item {
                None => break,
                Some(QueueItem::Chunk { agent_id, messages }) => {
                    self.process_chunk(agent_id, messages).await;
                }
                Some(QueueItem::Done(done)) => {
                    if done.send(()).is_err() {
                        debug!("Queue waiter went away");
                    }
                }
                Some(QueueItem::RemoveAgent(agent_id)) => {
                    self.with_state(|state| Self::remove_agent_now(state, agent_id));
                }
            }
        }
    }

    /// Reports and dispatches each message of a chunk in order, then sends
    /// the responses of every handler that had to answer.
    async fn process_chunk(&self, agent_id: AgentId, messages: Vec<Validated>) {
        let link = self
            .lock()
            .agents
            .get(&agent_id)
            .map(|agent| Arc::clone(agent.link()));
        let Some(link) = link else {
            debug!(agent = agent_id, "Skipping messages of a removed agent");
            return;
        };

        let mut responses = Vec::new();
        for message in messages {
            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    warn!(agent = agent_id, "Dropping invalid message: {}", err);
                    continue;
                }
            };
            if !self.accept(agent_id, &message) {
                continue;
            }
            let response = self.lock().agents.get_mut(&agent_id).and_then(|agent| {
                agent.dispatch(&message, &self.dispatch)
            });
            if let Some(response) = response {
                responses.push(response);
            }
        }

        for body in join_all(responses).await {
            link.send_message(body, false, None);
        }
    }

    /// Checks the sequence number and hands the message to reporters.
    fn accept(&self, agent_id: AgentId, message: &InboundMessage) -> bool {
        self.with_state(|state| {
            let Some(agent) = state.agents.get_mut(&agent_id) else {
                return false;
            };
            if let Some(seq) = message.seq
                && let Err(err) = agent.validate_sequence(seq)
            {
                warn!(agent = agent_id, kind = %message.kind(), "{}", err);
                return false;
            }
            let finished_group = if matches!(message.body, InboundBody::TestRunFinished(_)) {
                agent.group_id.filter(|_| !agent.is_remote())
            } else {
                None
            };
            state.report(agent_id, ReportEvent::Inbound(message.body.clone()));
            if let Some(group_id) = finished_group {
                self.on_local_run_finished(state, group_id);
            }
            true
        })
    }
}

pub(super) async fn run_pump(runner: Weak<Runner>, pump: Arc<Notify>) {
    loop {
        pump.notified().await;
        let Some(runner) = runner.upgrade() else {
            break;
        };
        runner.drain_queue().await;
        if runner.lock().destroyed {
            break;
        }
    }
    debug!("Message pump stopped");
}
