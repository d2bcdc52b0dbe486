//! HTTP binding.
//!
//! # Responsibilities
//! - Expose a [`Server`] binder as an axum route
//! - Call remote instances with reqwest as a [`RoundTrip`]
//! - JSON codecs, request-id propagation and error-to-status mapping
//!
//! # Design Decisions
//! - Bodies are buffered (bounded by [`MAX_BODY_BYTES`]) before decoding,
//!   so codecs stay synchronous
//! - Error responses carry `{"error", "kind"}` with the kind's own status
//! - Instance addresses without a scheme get `http://`; an empty path
//!   falls back to the binding's default path

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use url::Url;

use crate::discovery::endpointer::{Closer, Factory};
use crate::endpoint::{Context, Endpoint, X_REQUEST_ID};
use crate::error::{Error, ErrorKind, Result};
use crate::lifecycle::Shutdown;
use crate::transport::{Client, RoundTrip, Server};

/// Largest request body a route will buffer.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// A buffered HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Path and query. Empty on the client side means the binding's path.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            uri: String::new(),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// A buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn json(status: StatusCode, body: Vec<u8>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

impl IntoResponse for HttpResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

/// Server binder speaking buffered HTTP.
pub type HttpServer<Req, Resp> = Server<HttpRequest, HttpResponse, Req, Resp>;

/// Error body written by [`encode_error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

/// Decode a JSON request body.
pub fn decode_json_request<T: DeserializeOwned>(_ctx: &Context, req: HttpRequest) -> Result<T> {
    serde_json::from_slice(&req.body).map_err(Error::decode)
}

/// Encode a value as a `200 OK` JSON response.
pub fn encode_json_response<T: Serialize>(_ctx: &Context, resp: T) -> Result<HttpResponse> {
    let body = serde_json::to_vec(&resp).map_err(Error::encode)?;
    Ok(HttpResponse::json(StatusCode::OK, body))
}

/// Map an error to its status with a JSON body.
pub fn encode_error(_ctx: &Context, err: &Error) -> HttpResponse {
    let kind = err.kind();
    let status = status_for(kind);
    let body = ErrorBody {
        error: err.to_string(),
        kind: kind.as_str().to_string(),
    };
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    HttpResponse::json(status, bytes)
}

/// Copy the `x-request-id` header into the context.
pub fn request_id_from_header(ctx: Context, req: &HttpRequest) -> Context {
    match req.headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
        Some(id) if !id.is_empty() => ctx.with_request_id(id),
        _ => ctx,
    }
}

/// Echo the context's request id on the response.
pub fn request_id_to_header(ctx: &Context, resp: &mut HttpResponse) {
    if let Ok(v) = HeaderValue::from_str(ctx.request_id()) {
        resp.headers.insert(X_REQUEST_ID, v);
    }
}

/// JSON server with request-id propagation.
pub fn json_server<Req, Resp>(endpoint: Endpoint<Req, Resp>) -> HttpServer<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    Server::new(endpoint, decode_json_request::<Req>, encode_json_response::<Resp>, encode_error)
        .before(request_id_from_header)
        .after(request_id_to_header)
}

/// Mount `server` at `path` for every method.
pub fn route<Req, Resp>(router: Router, path: &str, server: HttpServer<Req, Resp>) -> Router
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let server = Arc::new(server);
    router.route(
        path,
        axum::routing::any(move |req: Request| {
            let server = server.clone();
            async move { handle(server.as_ref(), req).await }
        }),
    )
}

async fn handle<Req, Resp>(server: &HttpServer<Req, Resp>, req: Request) -> HttpResponse
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    let (parts, body) = req.into_parts();
    let wire_body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => return server.encode_error(&Context::background(), &Error::decode(e)),
    };
    let wire = HttpRequest {
        method: parts.method,
        uri: parts.uri.to_string(),
        headers: parts.headers,
        body: wire_body,
    };
    // Dropping this future (client went away) drops the in-flight call.
    server.serve(Context::background(), wire).await
}

/// Apply the standard HTTP layers: request ids and request tracing.
pub fn with_layers(router: Router) -> Router {
    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Serve `router` until `shutdown` fires.
pub async fn serve(listener: TcpListener, router: Router, shutdown: &Shutdown) -> std::io::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    tracing::info!(address = %addr, "HTTP binding starting");

    axum::serve(listener, with_layers(router))
        .with_graceful_shutdown(shutdown.signalled())
        .await?;

    tracing::info!(address = %addr, "HTTP binding stopped");
    Ok(())
}

/// Normalise an instance address into a request URL.
///
/// `host:port` gains an `http://` scheme; a missing or root path becomes
/// `default_path`.
pub fn instance_url(instance: &str, default_path: &str) -> Result<Url> {
    let with_scheme = if instance.contains("://") {
        instance.to_string()
    } else {
        format!("http://{instance}")
    };
    let mut url = Url::parse(&with_scheme).map_err(|e| Error::Factory {
        instance: instance.to_string(),
        reason: e.to_string(),
    })?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(default_path);
    }
    Ok(url)
}

/// reqwest-backed transport to a single instance.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    target: Url,
}

impl HttpClient {
    pub fn new(client: reqwest::Client, instance: &str, default_path: &str) -> Result<Self> {
        Ok(Self {
            client,
            target: instance_url(instance, default_path)?,
        })
    }

    pub fn target(&self) -> &Url {
        &self.target
    }
}

impl RoundTrip<HttpRequest, HttpResponse> for HttpClient {
    fn round_trip(&self, _ctx: &Context, wire: HttpRequest) -> BoxFuture<'static, Result<HttpResponse>> {
        let url = if wire.uri.is_empty() {
            Ok(self.target.clone())
        } else {
            self.target.join(&wire.uri).map_err(Error::encode)
        };
        let client = self.client.clone();

        async move {
            let url = url?;
            let resp = client
                .request(wire.method, url)
                .headers(wire.headers)
                .body(wire.body)
                .send()
                .await
                .map_err(Error::transport)?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let body = resp.bytes().await.map_err(Error::transport)?;
            Ok(HttpResponse { status, headers, body })
        }
        .boxed()
    }
}

/// Encode a JSON request body for `method`.
pub fn encode_json_request<T: Serialize>(method: Method) -> impl Fn(&Context, T) -> Result<HttpRequest> + Send + Sync + Clone {
    move |_ctx: &Context, req: T| {
        let body = serde_json::to_vec(&req).map_err(Error::encode)?;
        let mut wire = HttpRequest::new(method.clone(), body);
        wire.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(wire)
    }
}

/// Decode a JSON response, mapping non-2xx statuses to errors.
pub fn decode_json_response<T: DeserializeOwned>(_ctx: &Context, resp: HttpResponse) -> Result<T> {
    if resp.status.is_success() {
        return serde_json::from_slice(&resp.body).map_err(Error::decode);
    }
    let detail = serde_json::from_slice::<ErrorBody>(&resp.body)
        .map(|b| b.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(&resp.body).into_owned());
    Err(match resp.status {
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited,
        StatusCode::BAD_REQUEST => Error::Decode(detail),
        status => Error::Transport(format!("{status}: {detail}")),
    })
}

/// Send the context's request id upstream.
pub fn request_id_header(ctx: &Context, req: &mut HttpRequest) {
    if let Ok(v) = HeaderValue::from_str(ctx.request_id()) {
        req.headers.insert(X_REQUEST_ID, v);
    }
}

/// JSON client endpoint for one instance.
pub fn json_client<Req, Resp>(
    client: reqwest::Client,
    instance: &str,
    method: Method,
    default_path: &str,
) -> Result<Endpoint<Req, Resp>>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    let transport: Arc<dyn RoundTrip<HttpRequest, HttpResponse>> =
        Arc::new(HttpClient::new(client, instance, default_path)?);
    Ok(Client::new(transport, encode_json_request::<Req>(method), decode_json_response::<Resp>)
        .before(request_id_header)
        .endpoint())
}

/// Endpointer factory building a [`json_client`] per instance. All
/// instances share one connection pool.
pub fn json_factory<Req, Resp>(method: Method, default_path: &str) -> Factory<Req, Resp>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    let client = reqwest::Client::new();
    let default_path = default_path.to_string();
    Arc::new(move |instance: &str| -> Result<(Endpoint<Req, Resp>, Option<Box<dyn Closer>>)> {
        let endpoint = json_client(client.clone(), instance, method.clone(), &default_path)?;
        Ok((endpoint, None))
    })
}

/// Status reported for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    StatusCode::from_u16(kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
