//! Holding area for browsers that are no longer part of a run but can be
//! reused instead of launching a new process.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::agent::{AgentId, AgentLink};
use crate::browser::UserAgent;
use crate::protocol::{OutboundBody, RedirectTarget};

pub const DEFAULT_PARKING_PAGE: &str = "/~testrelay/parked.html";

/// A browser sent to the parking lot, together with the link its page
/// keeps polling on.
#[derive(Clone)]
pub struct ParkedAgent {
    pub agent_id: AgentId,
    pub user_agent: Option<UserAgent>,
    pub address: Option<String>,
    link: Arc<AgentLink>,
}

impl ParkedAgent {
    #[must_use]
    pub const fn new(
        agent_id: AgentId,
        user_agent: Option<UserAgent>,
        address: Option<String>,
        link: Arc<AgentLink>,
    ) -> Self {
        Self {
            agent_id,
            user_agent,
            address,
            link,
        }
    }

    pub fn redirect_to(&self, target: RedirectTarget) {
        self.link
            .send_message(OutboundBody::Redirect(target), false, None);
    }

    /// A parked browser that lost its connection cannot be reused.
    #[must_use]
    pub fn destroyed(&self) -> bool {
        self.link.is_lost() || self.link.is_terminated()
    }

    #[must_use]
    pub const fn link(&self) -> &Arc<AgentLink> {
        &self.link
    }
}

pub trait ParkingLot: Send + Sync {
    /// Port of the parking page, used to redirect unknown agents.
    fn port(&self) -> Option<u16>;

    fn park(&self, agent: ParkedAgent);

    /// Takes out a live parked browser with the same user agent.
    fn unpark(&self, user_agent: &UserAgent) -> Option<ParkedAgent>;

    /// The link of a parked agent, so its polls can still be answered.
    fn parked_link(&self, agent_id: AgentId) -> Option<Arc<AgentLink>>;
}

/// Parking lot that keeps agents in memory and sends them to a parking
/// page served by the same process.
pub struct InMemoryParkingLot {
    port: Option<u16>,
    page: String,
    parked: Mutex<Vec<ParkedAgent>>,
}

impl InMemoryParkingLot {
    #[must_use]
    pub fn new(port: Option<u16>, page: impl Into<String>) -> Self {
        Self {
            port,
            page: page.into(),
            parked: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ParkedAgent>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ParkingLot for InMemoryParkingLot {
    fn port(&self) -> Option<u16> {
        self.port
    }

    fn park(&self, agent: ParkedAgent) {
        agent.redirect_to(RedirectTarget {
            url: None,
            port: self.port,
            page: Some(self.page.clone()),
        });
        info!(agent = agent.agent_id, "Parked agent");
        let mut parked = self.lock();
        parked.retain(|existing| existing.agent_id != agent.agent_id);
        parked.push(agent);
    }

    fn unpark(&self, user_agent: &UserAgent) -> Option<ParkedAgent> {
        let mut parked = self.lock();
        parked.retain(|agent| !agent.destroyed());
        let position = parked.iter().position(|agent| {
            agent
                .user_agent
                .as_ref()
                .is_some_and(|candidate| candidate.raw() == user_agent.raw())
        })?;
        let agent = parked.remove(position);
        debug!(agent = agent.agent_id, "Unparked agent");
        Some(agent)
    }

    fn parked_link(&self, agent_id: AgentId) -> Option<Arc<AgentLink>> {
        self.lock()
            .iter()
            .find(|agent| agent.agent_id == agent_id)
            .map(|agent| Arc::clone(&agent.link))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::agent::{DEFAULT_LOST_GRACE, DEFAULT_POLL_TIMEOUT};

    const CHROME: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/51.0.2704.103 Safari/537.36";

    fn parked(id: AgentId, raw: &str) -> ParkedAgent {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = Arc::new(AgentLink::new(id, DEFAULT_POLL_TIMEOUT, DEFAULT_LOST_GRACE, tx));
        ParkedAgent::new(id, Some(UserAgent::parse(raw)), None, link)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn parking_redirects_and_unparks_by_user_agent() -> Result<(), String> {
        let lot = InMemoryParkingLot::new(Some(7071), DEFAULT_PARKING_PAGE);
        lot.park(parked(1, CHROME));
        lot.park(parked(2, "Firefox/47.0"));

        let Some(link) = lot.parked_link(1) else {
            return Err("Expected agent 1 to be parked".to_owned());
        };
        let messages = link.get_messages().await;
        let expected = OutboundBody::Redirect(RedirectTarget::page(7071, DEFAULT_PARKING_PAGE));
        if messages.first().map(|message| &message.body) != Some(&expected) {
            return Err(format!("Unexpected redirect {messages:?}"));
        }

        let agent = lot
            .unpark(&UserAgent::parse(CHROME))
            .ok_or_else(|| "Expected a matching parked agent".to_owned())?;
        if agent.agent_id != 1 || lot.len() != 1 {
            return Err(format!("Unexpected unpark result {}", agent.agent_id));
        }
        if lot.unpark(&UserAgent::parse(CHROME)).is_some() {
            return Err("Agent must only be unparked once".to_owned());
        }
        Ok(())
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn destroyed_agents_are_not_unparked() -> Result<(), String> {
        let lot = InMemoryParkingLot::new(None, DEFAULT_PARKING_PAGE);
        let agent = parked(3, CHROME);
        let link = Arc::clone(agent.link());
        lot.park(agent);
        link.connection_dropped();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        if lot.unpark(&UserAgent::parse(CHROME)).is_some() {
            return Err("Lost agent must not be reused".to_owned());
        }
        if !lot.is_empty() {
            return Err("Destroyed agents should be pruned".to_owned());
        }
        Ok(())
    }
}
