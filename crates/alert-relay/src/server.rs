// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Arc;

use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::AppConfig;
use crate::event::Event;
use crate::http_utils::{
    create_json_response, log_and_create_http_response, verify_request_content_length,
    HttpResponse,
};
use crate::queue::QueueSender;
use crate::stats::{PipelineStats, StatsSource};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const STATS_ENDPOINT_PATH: &str = "/stats";

/// Request handling settings taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub url_path: String,
    pub max_request_content_length: usize,
    pub supported_message_types: Vec<String>,
}

impl From<&AppConfig> for EndpointSettings {
    fn from(config: &AppConfig) -> Self {
        EndpointSettings {
            url_path: config.webhook.url_path.clone(),
            max_request_content_length: config.server.max_request_content_length,
            supported_message_types: config.supported_message_types.clone(),
        }
    }
}

/// The receiving side of the pipeline: validates pushed alerts and puts them on the ingestion
/// queue.
pub struct WebhookServer {
    settings: EndpointSettings,
    event_tx: QueueSender<Event>,
    stats: Arc<PipelineStats>,
    stats_source: StatsSource,
}

impl WebhookServer {
    pub fn new(
        settings: EndpointSettings,
        event_tx: QueueSender<Event>,
        stats: Arc<PipelineStats>,
        stats_source: StatsSource,
    ) -> Self {
        WebhookServer {
            settings,
            event_tx,
            stats,
            stats_source,
        }
    }

    pub async fn bind(host: &str, port: u16) -> io::Result<TcpListener> {
        let listener = TcpListener::bind((host, port)).await?;
        debug!("Webhook server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accepts connections until `cancel_token` fires, terminating TLS first when an acceptor is
    /// given. Connection level errors, failed handshakes and panics are logged and do not stop the
    /// loop.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        cancel_token: CancellationToken,
    ) -> io::Result<()> {
        let handler = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            // called for each http request
            let handler = Arc::clone(&handler);
            async move { handler.handle(req).await }
        });

        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let conn = tokio::select! {
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
                _ = cancel_token.cancelled() => {
                    debug!("Webhook server shutting down");
                    joinset.abort_all();
                    return Ok(());
                }
            };
            let server = server.clone();
            let service = service.clone();
            let tls = tls.clone();
            joinset.spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(conn).await {
                        Ok(stream) => server.serve_connection(TokioIo::new(stream), service).await,
                        Err(e) => {
                            debug!("TLS handshake failed: {e}");
                            return;
                        }
                    },
                    None => server.serve_connection(TokioIo::new(conn), service).await,
                };
                if let Err(e) = result {
                    error!("Connection error: {e}");
                }
            });
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        match (req.method(), req.uri().path()) {
            (&Method::POST, path) if path == self.settings.url_path => {
                self.alert_handler(req).await
            }
            (&Method::GET, STATS_ENDPOINT_PATH) => {
                create_json_response(&self.stats_source.snapshot(), StatusCode::OK)
            }
            _ => {
                let mut not_found = Response::default();
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Ok(not_found)
            }
        }
    }

    async fn alert_handler<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        self.stats.record_request();
        let (parts, body) = req.into_parts();

        if let Some(response) = verify_request_content_length(
            &parts.headers,
            self.settings.max_request_content_length,
            "Error processing alert",
        ) {
            self.stats.record_rejected();
            return response;
        }

        // chunked bodies skip the header check, so the read itself is bounded
        let body = match Limited::new(body, self.settings.max_request_content_length)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                self.stats.record_rejected();
                return log_and_create_http_response(
                    "Error processing alert: Payload too large",
                    StatusCode::PAYLOAD_TOO_LARGE,
                );
            }
            Err(e) => {
                self.stats.record_rejected();
                return log_and_create_http_response(
                    &format!("Error reading request body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let event = match Event::from_json(&body, &self.settings.supported_message_types) {
            Ok(event) => event,
            Err(e) => {
                self.stats.record_rejected();
                warn!("Rejected alert: {e}");
                return create_json_response(
                    &json!({ "status": "ERROR", "message": e.to_string() }),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        debug!(
            "Received alert sid={} from {}",
            event.rule.sid,
            event.source_label()
        );
        if self.event_tx.send(event).is_err() {
            return log_and_create_http_response(
                "Error processing alert: ingestion queue is closed",
                StatusCode::SERVICE_UNAVAILABLE,
            );
        }
        create_json_response(&json!({ "status": "OK" }), StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::AggregationStore;
    use crate::queue::{self, QueueReceiver};
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::body::Frame;
    use hyper::header;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    const PATH: &str = "/webhook/s3cret";

    fn server() -> (WebhookServer, QueueReceiver<Event>, Arc<PipelineStats>) {
        let (event_tx, event_rx) = queue::unbounded();
        let stats = Arc::new(PipelineStats::default());
        let stats_source = StatsSource::new(
            Arc::clone(&stats),
            Arc::new(AggregationStore::new()),
            event_tx.depth_gauge(),
            event_tx.depth_gauge(),
        );
        let settings = EndpointSettings {
            url_path: PATH.to_string(),
            max_request_content_length: 4096,
            supported_message_types: vec!["alert".to_string()],
        };
        (
            WebhookServer::new(settings, event_tx, Arc::clone(&stats), stats_source),
            event_rx,
            stats,
        )
    }

    fn post(path: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: HttpResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn alert_body(sid: u64) -> String {
        json!({
            "type": "alert",
            "flow_id": "f1",
            "flow_url": "https://nad.example.com/#/flows/f1",
            "ts_start": "2024-05-01T10:00:00Z",
            "src": {"ip": "10.0.0.1", "port": 51000},
            "dst": {"ip": "10.0.0.2", "port": 443},
            "alert": {
                "s_id": sid,
                "s_msg": "PTsecurity test rule",
                "s_pr": 1,
                "ts": "2024-05-01T10:00:05Z"
            }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_valid_alert_is_queued() {
        let (server, mut rx, stats) = server();
        let response = server.handle(post(PATH, &alert_body(1001))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "OK"}));

        let event = rx.try_recv().expect("event queued");
        assert_eq!(event.rule.sid, 1001);
        assert_eq!(event.source_label(), "nad.example.com");
        assert_eq!(stats.snapshot().requests_received, 1);
    }

    #[tokio::test]
    async fn test_invalid_alert_is_rejected_with_message() {
        let (server, mut rx, stats) = server();

        let response = server.handle(post(PATH, "{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], "ERROR");

        let unsupported = json!({"type": "heartbeat"}).to_string();
        let response = server.handle(post(PATH, &unsupported)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"status": "ERROR", "message": "Unsupported message type"})
        );

        assert!(rx.try_recv().is_none());
        let counters = stats.snapshot();
        assert_eq!(counters.requests_received, 2);
        assert_eq!(counters.events_rejected, 2);
    }

    #[tokio::test]
    async fn test_missing_content_length() {
        let (server, _rx, _) = server();
        let request = Request::builder()
            .method(Method::POST)
            .uri(PATH)
            .body(Full::new(Bytes::from(alert_body(1))))
            .unwrap();
        let response = server.handle(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::LENGTH_REQUIRED);
    }

    #[tokio::test]
    async fn test_unknown_routes_are_not_found() {
        let (server, _rx, _) = server();
        let response = server
            .handle(post("/webhook/wrong", &alert_body(1)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let get = Request::builder()
            .method(Method::GET)
            .uri(PATH)
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(
            server.handle(get).await.unwrap().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (server, _rx, _) = server();
        server.handle(post(PATH, &alert_body(7))).await.unwrap();

        let get = Request::builder()
            .method(Method::GET)
            .uri(STATS_ENDPOINT_PATH)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = server.handle(get).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats = body_json(response).await;
        assert_eq!(stats["requests_received"], 1);
        assert_eq!(stats["ingest_queue_depth"], 1);
    }

    #[tokio::test]
    async fn test_serve_over_tcp_until_cancelled() {
        let (server, mut rx, _) = server();
        let listener = WebhookServer::bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(Arc::new(server).serve(listener, None, cancel_token.clone()));

        let response = reqwest::Client::new()
            .post(format!("http://{addr}{PATH}"))
            .body(alert_body(42))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap().rule.sid, 42);

        cancel_token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_over_tls() {
        let (server, mut rx, _) = server();
        let acceptor = crate::tls::load_acceptor(
            &crate::tls::fixtures::cert_path(),
            &crate::tls::fixtures::key_path(),
        )
        .unwrap();
        let listener = WebhookServer::bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel_token = CancellationToken::new();
        let task = tokio::spawn(Arc::new(server).serve(
            listener,
            Some(acceptor),
            cancel_token.clone(),
        ));

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();
        let response = client
            .post(format!("https://{addr}{PATH}"))
            .body(alert_body(43))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap().rule.sid, 43);

        // plaintext requests never reach the handler
        assert!(reqwest::Client::new()
            .post(format!("http://{addr}{PATH}"))
            .body(alert_body(44))
            .send()
            .await
            .is_err());
        assert!(rx.try_recv().is_none());

        cancel_token.cancel();
        task.await.unwrap().unwrap();
    }

    /// Streams `chunks` frames of `CHUNK_SIZE` bytes and counts how many bytes were pulled.
    struct ChunkedBody {
        chunks: usize,
        pulled: Arc<AtomicUsize>,
    }

    const CHUNK_SIZE: usize = 64 * 1024;

    impl Body for ChunkedBody {
        type Data = Bytes;
        type Error = std::convert::Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
            if self.chunks == 0 {
                return Poll::Ready(None);
            }
            self.chunks -= 1;
            self.pulled.fetch_add(CHUNK_SIZE, Ordering::Relaxed);
            Poll::Ready(Some(Ok(Frame::data(Bytes::from(vec![b'x'; CHUNK_SIZE])))))
        }
    }

    #[tokio::test]
    async fn test_chunked_body_over_limit_stops_reading() {
        let (server, mut rx, stats) = server();
        let pulled = Arc::new(AtomicUsize::new(0));
        let request = Request::builder()
            .method(Method::POST)
            .uri(PATH)
            .header(header::TRANSFER_ENCODING, "chunked")
            .body(ChunkedBody {
                chunks: 1024,
                pulled: Arc::clone(&pulled),
            })
            .unwrap();

        let response = server.handle(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        // the limit is 4096, so reading stops at the first oversized frame
        assert_eq!(pulled.load(Ordering::Relaxed), CHUNK_SIZE);
        assert!(rx.try_recv().is_none());
        assert_eq!(stats.snapshot().events_rejected, 1);
    }
}
