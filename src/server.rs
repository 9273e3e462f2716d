use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, LengthLimitError, Limited};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use crate::{config::Config, error::StoreError, record::RequestRecord, store::Store};

const SESSIONS_PATH_PREFIX: &str = "/api/sessions/";
const LOG_PATH_PREFIX: &str = "/api/log/";

#[derive(Debug)]
pub struct ServerHandle {
    pub listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

struct ServerState {
    store: Store,
    max_body_bytes: usize,
}

#[derive(Debug, Serialize)]
struct SessionCreatedResponse<'a> {
    session: &'a str,
}

#[derive(Debug, Serialize)]
struct RequestLoggedResponse<'a> {
    session: &'a str,
    recorded: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

/// Binds `config.server.listen` and serves the session and logging routes until
/// [`ServerHandle::shutdown`] is called.
pub async fn serve(config: &Config, store: Store) -> anyhow::Result<ServerHandle> {
    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("bind {}", config.server.listen))?;
    let listen_addr = listener.local_addr().context("get local_addr")?;

    let state = Arc::new(ServerState {
        store,
        max_body_bytes: config.server.max_body_bytes,
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| handler(req, Arc::clone(&state)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle {
        listen_addr,
        shutdown_tx,
        join,
    })
}

async fn handler(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let response = route(req, &path, &state).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "request handled"
    );
    Ok(response)
}

async fn route(req: Request<Incoming>, path: &str, state: &ServerState) -> Response<Full<Bytes>> {
    if let Some(session_id) = parse_session_path(path, SESSIONS_PATH_PREFIX) {
        if !matches!(*req.method(), Method::POST | Method::PUT) {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        return create_session(state, session_id).await;
    }

    if let Some(session_id) = parse_session_path(path, LOG_PATH_PREFIX) {
        return log_request(req, state, session_id).await;
    }

    error_response(StatusCode::NOT_FOUND, "not found")
}

fn parse_session_path<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let session_id = path.strip_prefix(prefix)?;
    let session_id = session_id.strip_suffix('/').unwrap_or(session_id);
    if session_id.is_empty() || session_id.contains('/') {
        return None;
    }
    Some(session_id)
}

async fn create_session(state: &ServerState, session_id: &str) -> Response<Full<Bytes>> {
    match state.store.insert_session(session_id).await {
        Ok(()) => json_response(
            StatusCode::CREATED,
            &SessionCreatedResponse {
                session: session_id,
            },
        ),
        Err(err) => store_error_response(err),
    }
}

async fn log_request(
    req: Request<Incoming>,
    state: &ServerState,
    session_id: &str,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, state.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "request body exceeds {} bytes",
                    state.max_body_bytes
                ),
            );
        }
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {err}"),
            );
        }
    };

    let payload = match RequestRecord::from_parts(&parts, &body).to_json() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!("{err:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode request");
        }
    };

    match state.store.insert_request(session_id, &payload).await {
        Ok(()) => json_response(
            StatusCode::OK,
            &RequestLoggedResponse {
                session: session_id,
                recorded: true,
            },
        ),
        Err(err) => store_error_response(err),
    }
}

/// Business-rule errors are reported verbatim. Infrastructure errors only
/// reach the log; the client gets a generic message.
fn store_error_response(err: StoreError) -> Response<Full<Bytes>> {
    let (status, message) = match &err {
        StoreError::SessionAlreadyExists(_) => (StatusCode::CONFLICT, err.to_string()),
        StoreError::SessionNotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        _ => {
            tracing::error!(code = err.code(), "{err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal storage error".to_owned(),
            )
        }
    };
    let payload = ErrorResponse {
        error: message,
        code: Some(err.code()),
    };
    json_response(status, &payload)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ErrorResponse {
            error: message.into(),
            code: None,
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(payload) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => {
            tracing::debug!("failed to serialize JSON response: {err}");
            let mut response = Response::new(Full::new(Bytes::from_static(
                b"failed to serialize response",
            )));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}
