use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::browser::BrowserSession;
use crate::error::FarmError;
use crate::tasks::TaskManager;

use super::{Farm, FarmSettings, Tunnel};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
struct Hub {
    client: Client,
    base: String,
    username: Option<String>,
    access_key: Option<String>,
}

impl Hub {
    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => builder.basic_auth(user, self.access_key.as_deref()),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        context: &'static str,
    ) -> Result<Value, FarmError> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|source| FarmError::Request { context, source })?;
        read_json(response, context).await
    }
}

async fn read_json(response: Response, context: &'static str) -> Result<Value, FarmError> {
    let status = response.status();
    if !status.is_success() {
        return Err(FarmError::Status {
            context,
            status: status.as_u16(),
        });
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|source| FarmError::Request { context, source })?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// A farm reached through a Selenium/WebDriver hub.
pub struct WebDriverFarm {
    settings: FarmSettings,
    hub: Hub,
    tunnel: Tunnel,
}

impl WebDriverFarm {
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn new(settings: FarmSettings, tasks: Arc<TaskManager>) -> Result<Self, FarmError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| FarmError::Request {
                context: "client setup",
                source,
            })?;
        let hub = Hub {
            client,
            base: settings.hub_url(),
            username: settings.username.clone(),
            access_key: settings.access_key.clone(),
        };
        let tunnel = Tunnel::new(settings.name.clone(), settings.tunnel.clone(), tasks);
        Ok(Self {
            settings,
            hub,
            tunnel,
        })
    }

    #[must_use]
    pub const fn settings(&self) -> &FarmSettings {
        &self.settings
    }
}

#[async_trait]
impl Farm for WebDriverFarm {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn session_limit(&self) -> usize {
        self.settings.session_limit
    }

    fn auto_start_tunnel(&self) -> bool {
        self.settings.auto_start_tunnel
    }

    async fn start(&self) -> Result<(), FarmError> {
        if self.settings.tunnel.is_none() {
            return Ok(());
        }
        self.tunnel.start().await
    }

    async fn stop(&self) {
        self.tunnel.stop().await;
    }

    async fn open_session(
        &self,
        capabilities: &Map<String, Value>,
        url: &str,
    ) -> Result<Arc<dyn BrowserSession>, FarmError> {
        let hub = &self.hub;
        let created = hub
            .send(
                hub.client
                    .post(format!("{}/session", hub.base))
                    .json(&json!({ "desiredCapabilities": capabilities })),
                "session create",
            )
            .await?;
        let session_id = session_id_of(&created).ok_or(FarmError::MissingSessionId)?;
        info!(farm = %self.settings.name, session = %session_id, "Opened remote session");

        let session = WebDriverSession {
            hub: hub.clone(),
            session_id,
            description: format!("{} session", self.settings.name),
        };
        if let Err(err) = session.navigate(url).await {
            session.close().await;
            return Err(err);
        }
        Ok(Arc::new(session))
    }
}

/// Accepts both the legacy JSON wire shape (`sessionId` at the top) and the
/// W3C shape (`value.sessionId`).
fn session_id_of(created: &Value) -> Option<String> {
    created
        .get("sessionId")
        .or_else(|| created.get("value").and_then(|value| value.get("sessionId")))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

/// One remote browser opened through a [`WebDriverFarm`].
pub struct WebDriverSession {
    hub: Hub,
    session_id: String,
    description: String,
}

impl WebDriverSession {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/session/{}{}", self.hub.base, self.session_id, path)
    }

    async fn navigate(&self, url: &str) -> Result<(), FarmError> {
        self.hub
            .send(
                self.hub
                    .client
                    .post(self.endpoint("/url"))
                    .json(&json!({ "url": url })),
                "navigate",
            )
            .await
            .map(|_| ())
    }

    async fn close(&self) {
        let request = self.hub.client.delete(self.endpoint(""));
        if let Err(err) = self.hub.send(request, "session delete").await {
            debug!(session = %self.session_id, "Failed to close session: {}", err);
        }
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    fn describe(&self) -> String {
        format!("{} {}", self.description, self.session_id)
    }

    async fn screenshot(&self) -> Result<Option<String>, FarmError> {
        let body = self
            .hub
            .send(
                self.hub.client.get(self.endpoint("/screenshot")),
                "screenshot",
            )
            .await?;
        let Some(value) = body.get("value").filter(|value| !value.is_null()) else {
            return Ok(None);
        };
        value
            .as_str()
            .map(|data| Some(data.to_owned()))
            .ok_or(FarmError::MissingScreenshot)
    }

    async fn terminate(&self) -> Result<(), FarmError> {
        self.hub
            .send(self.hub.client.delete(self.endpoint("")), "session delete")
            .await
            .map(|_| ())
    }
}
