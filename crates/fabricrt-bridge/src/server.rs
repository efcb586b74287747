//! The HTTP front end: accepts requests, runs the prepare/send/wait
//! pipeline (spec.md §4.4 "Processing task"), and turns replies (or
//! failures) back into HTTP responses.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;
use tracing::{error, warn};
use uuid::Uuid;

use fabricrt_messaging::MessagingError;

use crate::backend::MessagingBackend;
use crate::envelope::{self, HeaderKv, HttpRequestMetadata};
use crate::error::BridgeError;
use crate::format::{ErrorFormatter, JsonErrorFormatter};
use crate::registry::RequestRegistry;
use crate::token;

#[derive(Clone)]
pub struct BridgeConfig {
    pub listen_addr: SocketAddr,
    pub token_cookie_names: HashSet<String>,
    pub token_type_default: String,
    pub token_data_default: String,
    pub request_timeout: Duration,
    pub server_authentication_required: bool,
    pub expected_security_id: Option<String>,
    pub log_unauthorized_messages: bool,
    pub target_peer_id: String,
    /// Bounded retry for `TargetPeerNotFound` (spec.md §7, §9): the test
    /// scaffolding uses ~2000 attempts at 200 ms, but production deployments
    /// should size this explicitly rather than inherit that default.
    pub target_peer_retry_max: u32,
    pub target_peer_retry_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            listen_addr: "127.0.0.1:8080".parse().unwrap(),
            token_cookie_names: HashSet::new(),
            token_type_default: String::new(),
            token_data_default: String::new(),
            request_timeout: Duration::from_secs(120),
            server_authentication_required: false,
            expected_security_id: None,
            log_unauthorized_messages: false,
            target_peer_id: String::new(),
            target_peer_retry_max: 5,
            target_peer_retry_backoff: Duration::from_millis(200),
        }
    }
}

pub struct HttpBridge {
    config: BridgeConfig,
    registry: Arc<RequestRegistry>,
    backend: Arc<dyn MessagingBackend>,
    formatter: Arc<dyn ErrorFormatter>,
}

impl HttpBridge {
    pub fn new(config: BridgeConfig, backend: Arc<dyn MessagingBackend>) -> Arc<Self> {
        Self::with_formatter(config, backend, Arc::new(JsonErrorFormatter))
    }

    pub fn with_formatter(
        config: BridgeConfig,
        backend: Arc<dyn MessagingBackend>,
        formatter: Arc<dyn ErrorFormatter>,
    ) -> Arc<Self> {
        Arc::new(HttpBridge {
            config,
            registry: Arc::new(RequestRegistry::new()),
            backend,
            formatter,
        })
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    /// Feeds an inbound block from the messaging backend into the bridge
    /// (spec.md §4.4 "Inbound dispatch"). Wired as the `InboundHandler`
    /// passed to `MessagingClient::spawn`.
    pub fn on_inbound_block(self: &Arc<Self>, block: fabricrt_messaging::Block) {
        let doc = match envelope::parse_metadata(&block) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, "dropping inbound block with unparsable envelope");
                return;
            }
        };

        if self.config.server_authentication_required {
            let sid = doc
                .principal_identity_info
                .as_ref()
                .map(|info| info.security_principal.sid.as_str());
            match sid {
                None => {
                    if self.config.log_unauthorized_messages {
                        warn!(conversation_id = %doc.conversation_id, "dropping reply with no principal");
                    }
                    return;
                }
                Some(sid) => {
                    if let Some(expected) = &self.config.expected_security_id {
                        if !sid.eq_ignore_ascii_case(expected) {
                            if self.config.log_unauthorized_messages {
                                warn!(conversation_id = %doc.conversation_id, sid, "dropping reply with mismatched sid");
                            }
                            return;
                        }
                    }
                }
            }
        }

        self.registry.complete_request(doc.conversation_id, block);
    }

    /// Runs the pruning (5 s) and cancel-drain (200 ms) background timers.
    /// Intended to be spawned once alongside the HTTP server.
    pub async fn run_timers(self: Arc<Self>) {
        let mut prune = tokio::time::interval(Duration::from_secs(5));
        let mut cancel_drain = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = prune.tick() => {
                    self.registry.prune_expired(self.config.request_timeout);
                    if !self.backend.is_connected() {
                        warn!("messaging backend disconnected; pruning will keep draining stale waiters");
                    }
                }
                _ = cancel_drain.tick() => {
                    self.registry.drain_cancel_list();
                }
            }
        }
    }

    /// Binds `config.listen_addr` and serves HTTP/1.1 connections until the
    /// process is torn down. Spawns `run_timers` alongside it.
    pub async fn serve(self: Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        tokio::spawn(Arc::clone(&self).run_timers());

        loop {
            let (stream, _peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let bridge = Arc::clone(&self);
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req| {
                    let bridge = Arc::clone(&bridge);
                    async move { Ok::<_, std::convert::Infallible>(bridge.handle(req).await) }
                });
                if let Err(err) = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    error!(%err, "connection error");
                }
            });
        }
    }

    async fn handle(self: &Arc<Self>, req: Request<Incoming>) -> Response<Full<Bytes>> {
        match self.process(req).await {
            Ok(response) => response,
            Err(err) => self.error_response(&err),
        }
    }

    fn error_response(&self, err: &BridgeError) -> Response<Full<Bytes>> {
        let (status, content_type, body) = self.formatter.format(err);
        Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
            .header(http::header::CONTENT_TYPE, content_type)
            .body(Full::new(Bytes::from(body)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
    }

    /// Prepare → Send → Wait, expressed as a single async chain (spec.md
    /// §4.4's three-stage continuation, realized as sequential `.await`s
    /// rather than explicit queue tasks — see DESIGN.md). Generic over the
    /// body type so tests can drive it with a boxed body instead of a real
    /// `hyper::body::Incoming`, which only hyper's own connection driver
    /// can construct.
    async fn process<B>(
        self: &Arc<Self>,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>, BridgeError>
    where
        B: hyper::body::Body,
        B::Error: std::fmt::Display,
    {
        let cookie_header = req
            .headers()
            .get(http::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let (token_type, token_data) = token::extract_token(
            cookie_header.as_deref(),
            &self.config.token_cookie_names,
            &self.config.token_type_default,
            &self.config.token_data_default,
        )?;

        let method = req.method().to_string();
        let url_path = req.uri().path().to_string();
        let headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| HeaderKv {
                    name: name.as_str().to_string(),
                    value: v.to_string(),
                })
            })
            .collect();

        let body_bytes = req
            .into_body()
            .collect()
            .await
            .map_err(|err| BridgeError::Protocol(format!("failed to read request body: {err}")))?
            .to_bytes();

        // Prepare.
        let conversation_id = Uuid::new_v4();
        let block = envelope::build_request_block(
            &body_bytes,
            conversation_id,
            token_type,
            token_data,
            HttpRequestMetadata {
                method,
                url_path,
                headers,
            },
        )?;

        // Wait: register the waiter before sending, so a fast reply can
        // never race ahead of the registry entry.
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.registry.register_request(
            conversation_id,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        // Send, with bounded retry on TargetPeerNotFound (spec.md §7, §9:
        // broker-side routing failure is retried at the task boundary
        // rather than surfaced on the first attempt).
        let mut attempt = 0u32;
        loop {
            let (send_tx, send_rx) = tokio::sync::oneshot::channel();
            self.backend.push_block(
                block.clone(),
                Box::new(move |result| {
                    let _ = send_tx.send(result);
                }),
            );
            let send_result = send_rx
                .await
                .map_err(|_| BridgeError::Internal("send callback dropped".to_string()))?;
            match send_result {
                Ok(()) => break,
                Err(MessagingError::PeerNotFound(_)) if attempt < self.config.target_peer_retry_max => {
                    attempt += 1;
                    tokio::time::sleep(self.config.target_peer_retry_backoff).await;
                    continue;
                }
                Err(err) => {
                    self.registry.close_request(conversation_id);
                    return Err(BridgeError::Protocol(err.to_string()));
                }
            }
        }

        let reply = rx
            .await
            .map_err(|_| BridgeError::Internal("waiter dropped before completion".to_string()))?;
        let reply_block = reply?;

        let doc = envelope::parse_metadata(&reply_block)?;
        let response_meta = envelope::response_metadata(&doc);

        let mut builder = Response::builder().status(
            response_meta
                .map(|m| m.http_status_code)
                .unwrap_or(200),
        );
        let content_type = response_meta
            .map(|m| m.content_type.clone())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        builder = builder.header(http::header::CONTENT_TYPE, content_type);
        if let Some(meta) = response_meta {
            for header in &meta.headers {
                if header.name.eq_ignore_ascii_case("content-type") {
                    continue;
                }
                builder = builder.header(header.name.as_str(), header.value.as_str());
            }
        }
        builder
            .body(Full::new(Bytes::copy_from_slice(reply_block.body())))
            .map_err(|err| BridgeError::Internal(format!("failed to build response: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{self, HeaderKv, HttpResponseMetadata, PassThroughUserData};
    use fabricrt_messaging::{Block, CompletionCallback};
    use http_body_util::Empty;
    use std::sync::Mutex as StdMutex;

    /// Replies after `reply_delay` by feeding the built response block back
    /// through `HttpBridge::on_inbound_block`, exactly as a real
    /// `MessagingClient` inbound handler would, so the bridge's own
    /// authentication gate is exercised rather than bypassed.
    struct FakeBackend {
        bridge: StdMutex<Option<Arc<HttpBridge>>>,
        reply_delay: Duration,
        reply_with_principal: bool,
    }

    impl FakeBackend {
        fn new(reply_delay: Duration, reply_with_principal: bool) -> Arc<Self> {
            Arc::new(FakeBackend {
                bridge: StdMutex::new(None),
                reply_delay,
                reply_with_principal,
            })
        }

        fn attach(&self, bridge: Arc<HttpBridge>) {
            *self.bridge.lock().unwrap() = Some(bridge);
        }
    }

    impl MessagingBackend for FakeBackend {
        fn push_block(&self, block: Block, cb: CompletionCallback) {
            cb(Ok(()));
            let bridge = self.bridge.lock().unwrap().clone().unwrap();
            let delay = self.reply_delay;
            let with_principal = self.reply_with_principal;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let doc = envelope::parse_metadata(&block).unwrap();
                let body = b"world".to_vec();
                let principal_identity_info = with_principal.then(|| {
                    crate::envelope::PrincipalIdentityInfo {
                        security_principal: crate::envelope::SecurityPrincipal {
                            sid: "S-1-TEST".to_string(),
                        },
                    }
                });
                let reply_doc = crate::envelope::BrokerProtocolDocument {
                    message_type: envelope::MessageType::AsyncRpcDispatch,
                    conversation_id: doc.conversation_id,
                    message_id: uuid::Uuid::new_v4(),
                    token_type: doc.token_type,
                    token_data: None,
                    principal_identity_info,
                    pass_through_user_data: Some(PassThroughUserData::Response {
                        http_response_metadata: HttpResponseMetadata {
                            http_status_code: 201,
                            content_type: "text/plain".to_string(),
                            headers: vec![HeaderKv {
                                name: "X-Conv".to_string(),
                                value: doc.conversation_id.to_string(),
                            }],
                        },
                    }),
                };
                let metadata = serde_json::to_vec(&reply_doc).unwrap();
                let mut data = bytes::BytesMut::with_capacity(body.len() + metadata.len());
                data.extend_from_slice(&body);
                let offset1 = data.len();
                data.extend_from_slice(&metadata);
                bridge.on_inbound_block(Block::new(data, offset1));
            });
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn empty_body_request(cookie: &str) -> Request<http_body_util::Empty<Bytes>> {
        Request::builder()
            .method("POST")
            .uri("/x")
            .header(http::header::COOKIE, cookie)
            .body(Empty::<Bytes>::new())
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn happy_path_matches_conversation_and_status() {
        let backend = FakeBackend::new(Duration::from_millis(100), false);
        let mut config = BridgeConfig::default();
        config.token_cookie_names.insert("AUTH".to_string());
        let bridge = HttpBridge::new(config, backend.clone());
        backend.attach(Arc::clone(&bridge));

        let req = empty_body_request("AUTH=abc");
        let response = bridge
            .process(req)
            .await
            .expect("happy path should succeed");
        assert_eq!(response.status(), StatusCode::from_u16(201).unwrap());
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert!(response.headers().get("X-Conv").is_some());
        assert!(bridge.registry().is_empty());
    }

    /// spec.md §8 scenario 6: with `serverAuthenticationRequired` set, a
    /// reply that arrives with no principal is dropped by
    /// `on_inbound_block` rather than completing the waiter, so the
    /// request instead runs out the clock on `requestTimeout` and
    /// surfaces `OperationAborted`.
    #[tokio::test(flavor = "multi_thread")]
    async fn auth_required_drops_reply_without_principal() {
        let backend = FakeBackend::new(Duration::from_millis(20), false);
        let mut config = BridgeConfig::default();
        config.server_authentication_required = true;
        config.request_timeout = Duration::from_millis(80);
        let bridge = HttpBridge::new(config, backend.clone());
        backend.attach(Arc::clone(&bridge));

        let prune_bridge = Arc::clone(&bridge);
        let prune_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(10));
            loop {
                ticker.tick().await;
                prune_bridge
                    .registry
                    .prune_expired(prune_bridge.config.request_timeout);
            }
        });

        let req = empty_body_request("");
        let result = tokio::time::timeout(Duration::from_millis(500), bridge.process(req)).await;
        prune_task.abort();
        match result {
            Ok(Ok(_)) => panic!("reply without a principal must not complete the waiter"),
            Ok(Err(BridgeError::Aborted { .. })) => {}
            Ok(Err(other)) => panic!("unexpected error: {other}"),
            Err(_) => panic!("process() should have timed out via the prune timer, not hung"),
        }
    }
}
