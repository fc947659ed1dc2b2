use crate::error::ProxyError;
use crate::gemini::engine::{sse_channel, SseWriter};
use crate::gemini::{continuation_headers, google_status, is_stream_generate_request};
use crate::proxy::context::{
    apply_cors, full_body, log_request_headers, preflight_response, stream_to_body, BoxBody,
    ChannelBody, RequestContext,
};
use crate::proxy::ws;
use crate::routing::{self, Resolution, RouteDescriptor, RouteError, GEMINI_ROUTE_IDS};
use crate::server::GatewayState;
use crate::transport::{filter_headers, RequestEnvelope, TargetUrl, UpstreamResponse};
use bytes::Bytes;
use http::header::{HeaderName, CONNECTION, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Handle one incoming request end to end:
///
/// 1. CORS preflight short-circuit
/// 2. route resolution + authentication (path grammar)
/// 3. WebSocket upgrade → relay
/// 4. Gemini streaming → continuation engine
/// 5. everything else → transparent pass-through
///
/// Every exit passes through the bottom of this function, where the access
/// log line and request metrics are recorded exactly once.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());

    // Trust a front proxy's X-Forwarded-For left-most entry when present,
    // otherwise fall back to the TCP peer address.
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let mut ctx = RequestContext::new(
        req.method().as_str().to_owned(),
        path_and_query.clone(),
        client_ip,
    );

    if state.config.debug_mode {
        log_request_headers(req.headers());
    }

    let response = match dispatch(req, &state, &mut ctx, &path_and_query).await {
        Ok(resp) => resp,
        Err(e) => failure_response(&ctx, e),
    };

    let status = response.status().as_u16();
    ctx.count_request(status);
    ctx.log_access(status);
    Ok(response)
}

async fn dispatch(
    req: Request<Incoming>,
    state: &GatewayState,
    ctx: &mut RequestContext,
    path_and_query: &str,
) -> Result<Response<BoxBody>, ProxyError> {
    if req.method() == Method::OPTIONS {
        return Ok(preflight_response());
    }

    let resolution = match routing::resolve(&state.routes, &state.config, path_and_query) {
        Ok(r) => r,
        Err(RouteError::Unauthorized) => {
            return Ok(ctx.error_response(StatusCode::UNAUTHORIZED, "unauthorized", None));
        }
        Err(RouteError::Malformed(msg)) => {
            return Ok(ctx.error_response(StatusCode::BAD_REQUEST, msg, None));
        }
    };

    match resolution {
        Resolution::Landing => Ok(landing_response()),
        Resolution::Probe => Ok(probe_response()),
        Resolution::Preset { route, rest, .. } => {
            ctx.route_id = route.id.clone();
            proxy_preset(req, state, ctx, route, &rest).await
        }
        Resolution::Generic { target } => {
            ctx.route_id = "generic".to_string();
            proxy_generic(req, state, ctx, target).await
        }
    }
}

async fn proxy_preset(
    req: Request<Incoming>,
    state: &GatewayState,
    ctx: &RequestContext,
    route: Arc<RouteDescriptor>,
    rest: &str,
) -> Result<Response<BoxBody>, ProxyError> {
    let targets: Vec<TargetUrl> = route
        .upstreams
        .iter()
        .map(|base| TargetUrl::parse(base).map(|b| b.join(rest)))
        .collect::<Result<_, _>>()?;
    let primary = targets
        .first()
        .cloned()
        .ok_or_else(|| ProxyError::Internal(format!("route {} has no upstreams", route.id)))?;

    if ws::is_websocket_upgrade(req.headers()) {
        return ws::relay(req, primary, state.selector.raw_transport()).await;
    }

    let (parts, body) = req.into_parts();
    let body_bytes = collect_body(body).await?;

    let gemini_eligible = GEMINI_ROUTE_IDS.contains(&route.id.as_str())
        && state.config.gemini_special_handling
        && is_stream_generate_request(&parts.method, &primary.path_and_query);
    if gemini_eligible {
        if let Ok(json) = serde_json::from_slice::<Value>(&body_bytes) {
            if json.get("contents").map(Value::is_array).unwrap_or(false) {
                return gemini_stream(
                    state,
                    route.prefer_fetch,
                    primary,
                    &parts.headers,
                    body_bytes,
                    json,
                )
                .await;
            }
        }
        debug!(route = %route.id, "gemini: body is not a contents request, proxying transparently");
    }

    pass_through(
        state,
        ctx,
        route.prefer_fetch,
        targets,
        parts.method,
        &parts.headers,
        body_bytes,
    )
    .await
}

async fn proxy_generic(
    req: Request<Incoming>,
    state: &GatewayState,
    ctx: &RequestContext,
    target: TargetUrl,
) -> Result<Response<BoxBody>, ProxyError> {
    if ws::is_websocket_upgrade(req.headers())
        || matches!(target.scheme.as_str(), "ws" | "wss")
    {
        return ws::relay(req, target, state.selector.raw_transport()).await;
    }

    let (parts, body) = req.into_parts();
    let body_bytes = collect_body(body).await?;

    pass_through(
        state,
        ctx,
        state.config.force_fetch_default,
        vec![target],
        parts.method,
        &parts.headers,
        body_bytes,
    )
    .await
}

async fn collect_body(body: Incoming) -> Result<Bytes, ProxyError> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ProxyError::BadRequest(format!("failed to read request body: {}", e)))
}

/// Transparent proxy: dispatch through the transport selector and stream
/// the upstream body back unchanged. Additional upstream bases act as
/// failover targets.
async fn pass_through(
    state: &GatewayState,
    ctx: &RequestContext,
    prefer_fetch: bool,
    targets: Vec<TargetUrl>,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response<BoxBody>, ProxyError> {
    let headers = filter_headers(headers);
    let body = if body.is_empty() { None } else { Some(body) };

    let mut last_err: Option<ProxyError> = None;
    for target in targets {
        let envelope = RequestEnvelope {
            method: method.clone(),
            target,
            headers: headers.clone(),
            body: body.clone(),
        };
        match state.selector.send(&envelope, prefer_fetch).await {
            Ok(upstream) => return Ok(build_downstream_response(upstream)),
            Err(e) => {
                warn!(route = %ctx.route_id, error = %e, "proxy: upstream attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ProxyError::Internal("no upstream configured".into())))
}

/// Initial Gemini dispatch plus engine handoff. The downstream status is
/// committed here: 200 on a 2xx initial response, a Google-style JSON
/// error otherwise.
async fn gemini_stream(
    state: &GatewayState,
    prefer_fetch: bool,
    target: TargetUrl,
    headers: &HeaderMap,
    body: Bytes,
    original_json: Value,
) -> Result<Response<BoxBody>, ProxyError> {
    let envelope = RequestEnvelope {
        method: Method::POST,
        target,
        headers: continuation_headers(headers),
        body: Some(body),
    };

    let initial = match state.selector.send(&envelope, prefer_fetch).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "gemini: initial upstream request failed");
            return Ok(google_error_response(
                502,
                &format!("Failed to reach upstream: {}", e),
                None,
            ));
        }
    };

    if !initial.is_success() {
        let status = initial.status;
        warn!(status, "gemini: initial upstream response not ok");
        let detail = initial
            .collect_body()
            .await
            .ok()
            .and_then(|b| serde_json::from_slice::<Value>(&b).ok());
        return Ok(google_error_response(
            status,
            "Upstream returned an error for the initial request.",
            detail,
        ));
    }

    let (writer, rx) = sse_channel(32);
    spawn_engine(state, writer, initial, original_json, envelope, prefer_fetch);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream; charset=utf-8")
        .header("cache-control", "no-cache")
        .header("access-control-allow-origin", "*")
        .body(receiver_body(rx))
        .unwrap())
}

fn spawn_engine(
    state: &GatewayState,
    writer: SseWriter,
    initial: UpstreamResponse,
    original_json: Value,
    template: RequestEnvelope,
    prefer_fetch: bool,
) {
    let engine = state.engine.clone();
    tokio::spawn(async move {
        // The writer is owned by this task; whatever path `run` exits by
        // (including panic unwinding), dropping it closes the downstream
        // stream.
        engine
            .run(writer, initial, original_json, template, prefer_fetch)
            .await;
    });
}

fn receiver_body(rx: mpsc::Receiver<Bytes>) -> BoxBody {
    BodyExt::boxed(ChannelBody::new(rx))
}

/// Relay an upstream response downstream: status and headers verbatim
/// minus hop-by-hop framing, CORS always applied, body streamed.
fn build_downstream_response(upstream: UpstreamResponse) -> Response<BoxBody> {
    let status =
        StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers.iter() {
        if is_hop_header(name) {
            continue;
        }
        builder = builder.header(name, value);
    }

    let mut response = builder
        .body(stream_to_body(upstream.body))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .body(full_body(r#"{"error":"invalid upstream response"}"#))
                .unwrap()
        });

    apply_cors(response.headers_mut());
    response
}

fn is_hop_header(name: &HeaderName) -> bool {
    name == CONNECTION
        || name == TRANSFER_ENCODING
        || matches!(
            name.as_str(),
            "keep-alive" | "proxy-authenticate" | "proxy-authorization" | "te" | "trailers"
                | "upgrade"
        )
}

/// Google-style error payload for the Gemini route, mirroring what the
/// upstream itself would produce.
fn google_error_response(status: u16, message: &str, details: Option<Value>) -> Response<BoxBody> {
    let mut payload = serde_json::json!({
        "error": {
            "code": status,
            "status": google_status(status),
            "message": message,
        }
    });
    if let Some(details) = details {
        payload["error"]["details"] = serde_json::json!([details]);
    }
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY))
        .header("content-type", "application/json; charset=utf-8")
        .header("x-proxy-error", "true")
        .header("access-control-allow-origin", "*")
        .body(full_body(payload.to_string()))
        .unwrap()
}

/// Map a dispatch failure onto the standard JSON error envelope.
fn failure_response(ctx: &RequestContext, e: ProxyError) -> Response<BoxBody> {
    match e {
        ProxyError::BadRequest(msg) => {
            ctx.error_response(StatusCode::BAD_REQUEST, &msg, None)
        }
        ProxyError::Timeout => {
            ctx.error_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out", None)
        }
        ProxyError::BadGateway(records) => {
            let details: Vec<Value> = records
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "transport": r.transport,
                        "message": r.message,
                        "duration_ms": r.elapsed.as_millis() as u64,
                    })
                })
                .collect();
            ctx.error_response(
                StatusCode::BAD_GATEWAY,
                "all transports failed",
                Some(Value::Array(details)),
            )
        }
        ProxyError::UpgradeRejected(status, reason) => ctx.error_response(
            StatusCode::BAD_GATEWAY,
            &format!("upstream refused websocket upgrade: {} {}", status, reason),
            None,
        ),
        ProxyError::Internal(msg) => {
            error!(error = %msg, "proxy: internal failure");
            ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error", None)
        }
        other => ctx.error_response(StatusCode::BAD_GATEWAY, &other.to_string(), None),
    }
}

const LANDING_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>LLM API Gateway</title>
  <style>
    body { font-family: system-ui, sans-serif; max-width: 42rem; margin: 4rem auto; color: #24292f; }
    code { background: #f6f8fa; padding: 0.15rem 0.35rem; border-radius: 4px; }
  </style>
</head>
<body>
  <h1>LLM API Gateway</h1>
  <p>The service is running. Requests are forwarded to the configured upstream providers.</p>
  <p>Preset routes: <code>/&lt;provider&gt;/&lt;path&gt;</code>. Generic pass-through:
     <code>/&lt;token&gt;/&lt;scheme&gt;/&lt;host&gt;/&lt;path&gt;</code>.</p>
</body>
</html>
"#;

fn landing_response() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/html; charset=utf-8")
        .header("access-control-allow-origin", "*")
        .body(full_body(LANDING_PAGE))
        .unwrap()
}

fn probe_response() -> Response<BoxBody> {
    let payload = serde_json::json!({
        "status": "ok",
        "service": "iris-gateway",
        "timestamp": humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json; charset=utf-8")
        .header("access-control-allow-origin", "*")
        .body(full_body(payload.to_string()))
        .unwrap()
}
