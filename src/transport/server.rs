use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::agent::AgentLink;
use crate::error::ProtocolError;
use crate::runner::{PollOutcome, PollRequest, ROUTE_PREFIX, RegisterRequest, Runner};
use crate::shutdown::ShutdownReceiver;

use super::http::{
    HttpError, HttpRequest, read_http_request, write_error_response, write_json_response,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Register,
    Messages,
    Updates,
}

impl Route {
    fn parse(path: &str) -> Option<Self> {
        match path.strip_prefix(ROUTE_PREFIX)? {
            "/register" => Some(Self::Register),
            "/messages" => Some(Self::Messages),
            "/updates" => Some(Self::Updates),
            _ => None,
        }
    }
}

/// Serves the agent long-poll routes of one runner.
pub struct LongPollServer {
    listener: TcpListener,
    runner: Arc<Runner>,
}

impl LongPollServer {
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound.
    pub async fn bind(host: &str, port: u16, runner: Arc<Runner>) -> Result<Self, ProtocolError> {
        let addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProtocolError::Bind { addr, source })?;
        Ok(Self { listener, runner })
    }

    /// # Errors
    ///
    /// Returns an error when the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        self.listener
            .local_addr()
            .map_err(|source| ProtocolError::Io {
                context: "reading listener address",
                source,
            })
    }

    /// Accepts connections until shutdown is signalled.
    pub async fn serve(self, mut shutdown: ShutdownReceiver) {
        if let Ok(addr) = self.local_addr() {
            info!("Listening for agents on http://{}{}", addr, ROUTE_PREFIX);
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (socket, peer) = match accepted {
                Ok(result) => result,
                Err(err) => {
                    warn!("Failed to accept agent connection: {}", err);
                    continue;
                }
            };
            let runner = Arc::clone(&self.runner);
            tokio::spawn(async move {
                handle_connection(socket, peer, &runner).await;
            });
        }
        debug!("Long-poll server stopped");
    }
}

async fn handle_connection(mut socket: TcpStream, peer: SocketAddr, runner: &Runner) {
    let result = match read_http_request(&mut socket).await {
        Ok(request) => route_request(&mut socket, peer, runner, request).await,
        Err(err) => write_error_response(&mut socket, err.status, &err.message).await,
    };
    if let Err(err) = result {
        warn!(peer = %peer, "Failed to write agent response: {}", err);
    }
}

async fn route_request(
    socket: &mut TcpStream,
    peer: SocketAddr,
    runner: &Runner,
    request: HttpRequest,
) -> Result<(), ProtocolError> {
    let Some(route) = Route::parse(&request.path) else {
        return write_error_response(socket, 404, "Not found").await;
    };
    debug!(peer = %peer, method = %request.method, ?route, "Agent request");
    match route {
        Route::Register => match register_request(&request, peer) {
            Ok(register) => write_json_response(socket, 200, &runner.register(register)).await,
            Err(err) => write_error_response(socket, err.status, &err.message).await,
        },
        Route::Messages => match poll_request(request) {
            Ok(poll) => match runner.messages(&poll) {
                PollOutcome::Reply(reply) => write_json_response(socket, 200, &reply).await,
                PollOutcome::Hold(link) => hold_poll(socket, &link).await,
            },
            Err(err) => write_error_response(socket, err.status, &err.message).await,
        },
        Route::Updates => match poll_request(request) {
            Ok(poll) => write_json_response(socket, 200, &runner.updates(&poll)).await,
            Err(err) => write_error_response(socket, err.status, &err.message).await,
        },
    }
}

fn register_request(request: &HttpRequest, peer: SocketAddr) -> Result<RegisterRequest, HttpError> {
    Ok(RegisterRequest {
        agent_id: request.numeric_param("agentId")?,
        session_id: request.param("sessionId").map(str::to_owned),
        runner_id: request.param("runnerId").map(str::to_owned),
        user_agent: request.header("user-agent").unwrap_or_default().to_owned(),
        address: Some(peer.ip().to_string()),
        is_local: peer.ip().is_loopback(),
    })
}

fn poll_request(request: HttpRequest) -> Result<PollRequest, HttpError> {
    Ok(PollRequest {
        agent_id: request.numeric_param("agentId")?,
        proxy_id: request.param("proxyId").map(str::to_owned),
        run_id: request.numeric_param("runId")?,
        body: request.body,
    })
}

/// Holds the request until the link has messages; a browser that hangs up
/// first starts the link's lost-connection grace timer.
async fn hold_poll(socket: &mut TcpStream, link: &Arc<AgentLink>) -> Result<(), ProtocolError> {
    let delivered = tokio::select! {
        messages = link.get_messages() => Some(messages),
        () = wait_for_hangup(&mut *socket) => None,
    };
    let Some(messages) = delivered else {
        link.connection_dropped();
        return Ok(());
    };
    let result = write_json_response(socket, 200, &messages).await;
    if result.is_err() && !messages.is_empty() {
        warn!(
            agent = link.agent_id(),
            lost = messages.len(),
            "Poll closed before messages were delivered"
        );
    }
    result
}

async fn wait_for_hangup<R>(reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 512];
    loop {
        match reader.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_live_under_the_prefix() -> Result<(), String> {
        let cases = [
            ("/~testrelay/register", Some(Route::Register)),
            ("/~testrelay/messages", Some(Route::Messages)),
            ("/~testrelay/updates", Some(Route::Updates)),
            ("/register", None),
            ("/~testrelay/page.html", None),
        ];
        for (path, expected) in cases {
            if Route::parse(path) != expected {
                return Err(format!("Unexpected route for {}", path));
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn hangup_is_seen_after_trailing_bytes() -> Result<(), String> {
        let mut reader: &[u8] = b"stray bytes";
        tokio::time::timeout(std::time::Duration::from_secs(1), wait_for_hangup(&mut reader))
            .await
            .map_err(|err| format!("Reader at EOF should count as a hangup: {err}"))
    }
}
