//! Request router for model completions.
//!
//! `LmHandler` owns a default [`ModelClient`] plus a table of named clients
//! and serves the wire protocol over TCP. Every accepted connection gets its
//! own task, so a slow completion never holds up other connections. The
//! orchestration loop skips the network and calls [`LmHandler::completion`]
//! directly; code inside execution environments connects to the advertised
//! address.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt;
use rlm_core::{CostSummary, HandlerError, ModelClient, Prompt, ProtocolError, ProviderError};
use rlm_protocol::{CompletionRequest, CompletionResponse, read_frame, write_frame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Default client plus name → client mapping.
struct ClientTable {
    default: Arc<dyn ModelClient>,
    named: HashMap<String, Arc<dyn ModelClient>>,
}

impl ClientTable {
    fn resolve(&self, name: Option<&str>) -> Arc<dyn ModelClient> {
        name.and_then(|n| self.named.get(n))
            .unwrap_or(&self.default)
            .clone()
    }
}

type SharedTable = Arc<RwLock<ClientTable>>;

struct Running {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

/// The request router.
///
/// Lifecycle is explicit: construct, [`start`](Self::start),
/// [`stop`](Self::stop). Dropping a started handler aborts its accept loop.
pub struct LmHandler {
    host: String,
    port: u16,
    request_timeout: Duration,
    clients: SharedTable,
    server: Mutex<Option<Running>>,
}

impl LmHandler {
    pub fn new(default_client: Arc<dyn ModelClient>) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: 0,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            clients: Arc::new(RwLock::new(ClientTable {
                default: default_client,
                named: HashMap::new(),
            })),
            server: Mutex::new(None),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Port 0 lets the OS pick one; read it back from `start()`.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bound on reading a request and on the client call it triggers.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Add or replace the client served for `name`.
    pub fn register_client(&self, name: impl Into<String>, client: Arc<dyn ModelClient>) {
        let name = name.into();
        debug!(name = %name, model = %client.model_name(), "Registering model client");
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .named
            .insert(name, client);
    }

    /// The client registered for `name`, else the default client.
    pub fn resolve_client(&self, name: Option<&str>) -> Arc<dyn ModelClient> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(name)
    }

    pub fn default_client(&self) -> Arc<dyn ModelClient> {
        self.resolve_client(None)
    }

    /// Bind and begin accepting connections. Calling it again while running
    /// returns the existing address.
    pub async fn start(&self) -> Result<SocketAddr, HandlerError> {
        let mut server = self.server.lock().await;
        if let Some(running) = server.as_ref() {
            if !running.accept_task.is_finished() {
                return Ok(running.addr);
            }
        }

        let bind_addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| HandlerError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| HandlerError::Bind {
            addr: bind_addr,
            source,
        })?;

        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.clients.clone(),
            self.request_timeout,
        ));
        *server = Some(Running { addr, accept_task });

        info!(addr = %addr, "Request router listening");
        Ok(addr)
    }

    /// Stop accepting and release the listener. Connections already accepted
    /// run to completion on their own tasks. `start()` may be called again.
    pub async fn stop(&self) {
        let running = self.server.lock().await.take();
        if let Some(running) = running {
            running.accept_task.abort();
            let _ = running.accept_task.await;
            info!(addr = %running.addr, "Request router stopped");
        }
    }

    /// The bound address while running.
    pub async fn address(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|r| r.addr)
    }

    /// In-process shortcut that bypasses the transport.
    pub async fn completion(
        &self,
        prompt: &Prompt,
        model: Option<&str>,
    ) -> Result<String, ProviderError> {
        self.resolve_client(model).completion(prompt, None).await
    }

    /// Usage totals keyed by model name (default client) or registration name.
    pub fn cost_summaries(&self) -> BTreeMap<String, CostSummary> {
        let table = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        let mut summaries = BTreeMap::new();
        summaries.insert(
            table.default.model_name().to_string(),
            table.default.cost_summary(),
        );
        for (name, client) in &table.named {
            summaries.insert(name.clone(), client.cost_summary());
        }
        summaries
    }
}

impl Drop for LmHandler {
    fn drop(&mut self) {
        if let Some(running) = self.server.get_mut().take() {
            running.accept_task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, clients: SharedTable, request_timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                tokio::spawn(handle_connection(socket, clients.clone(), request_timeout));
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_connection(mut socket: TcpStream, clients: SharedTable, request_timeout: Duration) {
    let response = match tokio::time::timeout(request_timeout, read_frame(&mut socket)).await {
        Err(_) => CompletionResponse::error(ProtocolError::Timeout(request_timeout).to_string()),
        Ok(Ok(None)) | Ok(Err(ProtocolError::ConnectionClosed)) => {
            debug!("Peer closed before sending a request");
            return;
        }
        Ok(Err(e)) => CompletionResponse::error(e.to_string()),
        Ok(Ok(Some(payload))) => dispatch(payload, &clients, request_timeout).await,
    };

    if let Err(e) = write_frame(&mut socket, &response.to_value()).await {
        debug!(error = %e, "Failed to send response");
    }
}

async fn dispatch(
    payload: serde_json::Value,
    clients: &SharedTable,
    request_timeout: Duration,
) -> CompletionResponse {
    let request = match CompletionRequest::from_value(payload) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Rejected request");
            return CompletionResponse::error(e.to_string());
        }
    };

    let client = clients
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .resolve(request.model.as_deref());

    let call = AssertUnwindSafe(client.completion(&request.prompt, None)).catch_unwind();
    match tokio::time::timeout(request_timeout, call).await {
        Ok(Ok(Ok(content))) => CompletionResponse::success(content),
        Ok(Ok(Err(e))) => {
            warn!(model = %client.model_name(), error = %e, "Completion failed");
            CompletionResponse::error(e.to_string())
        }
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            warn!(model = %client.model_name(), error = %message, "Model client panicked");
            CompletionResponse::error(format!("Model client panicked: {message}"))
        }
        Err(_) => {
            let e = ProviderError::Timeout(format!("no completion within {request_timeout:?}"));
            warn!(model = %client.model_name(), error = %e, "Completion timed out");
            CompletionResponse::error(e.to_string())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rlm_core::CostTracker;
    use rlm_protocol::{DEFAULT_TIMEOUT, encode_frame, send_request_async};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Replies `"{name}:{prompt}"` and counts calls.
    struct TaggedClient {
        name: String,
        calls: AtomicUsize,
        costs: CostTracker,
    }

    impl TaggedClient {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: AtomicUsize::new(0),
                costs: CostTracker::new(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for TaggedClient {
        fn model_name(&self) -> &str {
            &self.name
        }

        async fn completion(
            &self,
            prompt: &Prompt,
            _model: Option<&str>,
        ) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.costs.record(1, 1, 0.0);
            match prompt {
                Prompt::Text(t) if t == "fail" => Err(ProviderError::Network("upstream down".into())),
                Prompt::Text(t) if t == "panic" => panic!("client exploded"),
                Prompt::Text(t) => Ok(format!("{}:{}", self.name, t)),
                Prompt::Messages(m) => Ok(format!("{}:{} turns", self.name, m.len())),
            }
        }

        fn cost_summary(&self) -> CostSummary {
            self.costs.snapshot()
        }
    }

    async fn raw_exchange(addr: SocketAddr, frame: &[u8]) -> serde_json::Value {
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(frame).await.unwrap();
        read_frame(&mut socket).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn serves_default_client_over_tcp() {
        let client = TaggedClient::new("default");
        let handler = LmHandler::new(client.clone());
        let addr = handler.start().await.unwrap();

        let response = send_request_async(addr, &CompletionRequest::new("hi"), DEFAULT_TIMEOUT).await;
        assert_eq!(response, CompletionResponse::success("default:hi"));
        assert_eq!(client.calls(), 1);
        handler.stop().await;
    }

    #[tokio::test]
    async fn model_field_selects_registered_client() {
        let handler = LmHandler::new(TaggedClient::new("default"));
        handler.register_client("gpt-4o", TaggedClient::new("gpt-4o"));
        let addr = handler.start().await.unwrap();

        let named = send_request_async(
            addr,
            &CompletionRequest::new("q").with_model("gpt-4o"),
            DEFAULT_TIMEOUT,
        )
        .await;
        assert_eq!(named.content(), Some("gpt-4o:q"));

        let unknown = send_request_async(
            addr,
            &CompletionRequest::new("q").with_model("nope"),
            DEFAULT_TIMEOUT,
        )
        .await;
        assert_eq!(unknown.content(), Some("default:q"));
        handler.stop().await;
    }

    #[tokio::test]
    async fn resolve_is_pure_lookup() {
        let handler = LmHandler::new(TaggedClient::new("default"));
        handler.register_client("a", TaggedClient::new("a"));
        assert_eq!(handler.resolve_client(Some("a")).model_name(), "a");
        assert_eq!(handler.resolve_client(Some("b")).model_name(), "default");
        assert_eq!(handler.resolve_client(None).model_name(), "default");
        handler.register_client("a", TaggedClient::new("a2"));
        assert_eq!(handler.resolve_client(Some("a")).model_name(), "a2");
    }

    #[tokio::test]
    async fn malformed_payloads_never_reach_a_client() {
        let client = TaggedClient::new("default");
        let handler = LmHandler::new(client.clone());
        let addr = handler.start().await.unwrap();

        let mut not_json = 4u32.to_be_bytes().to_vec();
        not_json.extend_from_slice(b"nope");
        let frames = vec![
            encode_frame(&json!(["not", "an", "object"])).unwrap(),
            encode_frame(&json!({"model": "x"})).unwrap(),
            encode_frame(&json!({"prompt": ""})).unwrap(),
            not_json,
        ];
        for frame in frames {
            let reply = raw_exchange(addr, &frame).await;
            assert!(reply.get("error").is_some(), "reply: {reply}");
            assert!(reply.get("content").is_none());
        }
        assert_eq!(client.calls(), 0);
        handler.stop().await;
    }

    #[tokio::test]
    async fn client_failures_are_contained() {
        let handler = LmHandler::new(TaggedClient::new("default"));
        let addr = handler.start().await.unwrap();

        let failed = send_request_async(addr, &CompletionRequest::new("fail"), DEFAULT_TIMEOUT).await;
        assert!(failed.into_result().unwrap_err().contains("upstream down"));

        let panicked = send_request_async(addr, &CompletionRequest::new("panic"), DEFAULT_TIMEOUT).await;
        assert!(panicked.into_result().unwrap_err().contains("client exploded"));

        let ok = send_request_async(addr, &CompletionRequest::new("after"), DEFAULT_TIMEOUT).await;
        assert_eq!(ok.content(), Some("default:after"));
        handler.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_and_restartable() {
        let handler = LmHandler::new(TaggedClient::new("default"));
        let first = handler.start().await.unwrap();
        let again = handler.start().await.unwrap();
        assert_eq!(first, again);
        assert_eq!(handler.address().await, Some(first));

        handler.stop().await;
        assert_eq!(handler.address().await, None);

        let restarted = handler.start().await.unwrap();
        let response = send_request_async(restarted, &CompletionRequest::new("x"), DEFAULT_TIMEOUT).await;
        assert!(response.is_success());
        handler.stop().await;
    }

    #[tokio::test]
    async fn stopped_router_refuses_connections() {
        let handler = LmHandler::new(TaggedClient::new("default"));
        let addr = handler.start().await.unwrap();
        handler.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let handler = LmHandler::new(TaggedClient::new("default")).with_port(port);
        let err = handler.start().await.unwrap_err();
        assert!(matches!(err, HandlerError::Bind { .. }));
    }

    #[tokio::test]
    async fn idle_connection_gets_timeout_error() {
        let handler = LmHandler::new(TaggedClient::new("default"))
            .with_request_timeout(Duration::from_millis(100));
        let addr = handler.start().await.unwrap();
        let mut socket = TcpStream::connect(addr).await.unwrap();
        let reply = read_frame(&mut socket).await.unwrap().unwrap();
        assert!(reply["error"].as_str().unwrap().contains("Timed out"));
        let mut rest = Vec::new();
        socket.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        handler.stop().await;
    }

    #[tokio::test]
    async fn in_process_completion_and_costs() {
        let handler = LmHandler::new(TaggedClient::new("default"));
        handler.register_client("other", TaggedClient::new("other"));
        let text = handler.completion(&Prompt::from("p"), Some("other")).await.unwrap();
        assert_eq!(text, "other:p");

        let costs = handler.cost_summaries();
        assert_eq!(costs["other"].total_calls, 1);
        assert_eq!(costs["default"].total_calls, 0);
    }
}
