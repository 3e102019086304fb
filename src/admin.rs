//! Read-only administrative endpoint
//!
//! Serves statistics, the in-memory message history, the effective
//! configuration and a cache summary over HTTP/1. Nothing here mutates the
//! engine.

use crate::message_ring::MessageRing;
use crate::server_context::ServerContext;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::Method;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";
const PLAIN_TEXT: &str = "text/plain; charset=utf-8";
const JSON: &str = "application/json";

#[derive(Clone)]
struct AdminState {
    server: Arc<ServerContext>,
    messages: Option<MessageRing>,
}

pub struct AdminEndpoint {
    state: AdminState,
    addr: SocketAddr,
}

#[derive(Serialize)]
struct TierSummary {
    name: &'static str,
    healthy: bool,
}

#[derive(Serialize)]
struct CacheSummary {
    tiers: Vec<TierSummary>,
    invalidation_timestamp_ms: i64,
    idle_drivers: usize,
    stats: crate::stats::StatsSnapshot,
}

impl AdminEndpoint {
    pub fn new(server: Arc<ServerContext>, addr: SocketAddr) -> Self {
        Self {
            state: AdminState {
                server,
                messages: None,
            },
            addr,
        }
    }

    /// Expose `messages` at `/pagespeed_admin/message_history`
    pub fn with_messages(mut self, messages: MessageRing) -> Self {
        self.state.messages = Some(messages);
        self
    }

    /// Bind the configured address and serve until the process exits
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Admin endpoint listening on http://{}", self.addr);
        self.serve(listener).await
    }

    /// Serve connections accepted from `listener`
    pub async fn serve(self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let state = self.state.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let state = state.clone();
                    async move { handle_request(req, state).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving admin connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: AdminState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Ok(respond(
            StatusCode::METHOD_NOT_ALLOWED,
            PLAIN_TEXT,
            "Admin pages are read-only\n".to_string(),
        ));
    }
    Ok(route(req.uri().path(), &state))
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json<T: Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string_pretty(value) {
        Ok(body) => respond(StatusCode::OK, JSON, body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            PLAIN_TEXT,
            format!("Failed to encode: {}\n", e),
        ),
    }
}

fn route(path: &str, state: &AdminState) -> Response<Full<Bytes>> {
    let server = &state.server;
    match path.trim_end_matches('/') {
        "/pagespeed_admin/statistics" => match server.stats().encode_text() {
            Ok(body) => respond(StatusCode::OK, PROMETHEUS_TEXT, body),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                PLAIN_TEXT,
                format!("Failed to encode statistics: {}\n", e),
            ),
        },
        "/pagespeed_admin/message_history" => {
            let mut body = String::new();
            for line in state.messages.iter().flat_map(MessageRing::messages) {
                body.push_str(&line);
                body.push('\n');
            }
            respond(StatusCode::OK, PLAIN_TEXT, body)
        }
        "/pagespeed_admin/config" => json(server.config()),
        "/pagespeed_admin/cache" => json(&CacheSummary {
            tiers: server
                .cache_tiers()
                .into_iter()
                .map(|(name, healthy)| TierSummary { name, healthy })
                .collect(),
            invalidation_timestamp_ms: server.clock().current(),
            idle_drivers: server.idle_drivers(),
            stats: server.stats().snapshot(),
        }),
        "/health" => respond(StatusCode::OK, PLAIN_TEXT, "OK\n".to_string()),
        "" | "/pagespeed_admin" => respond(
            StatusCode::OK,
            PLAIN_TEXT,
            "Pagespeed admin\n\n\
             /pagespeed_admin/statistics\n\
             /pagespeed_admin/message_history\n\
             /pagespeed_admin/config\n\
             /pagespeed_admin/cache\n\
             /health\n"
                .to_string(),
        ),
        _ => respond(StatusCode::NOT_FOUND, PLAIN_TEXT, "Not found\n".to_string()),
    }
}
