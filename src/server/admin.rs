use super::GatewayState;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::convert::Infallible;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).boxed()
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => Ok(Response::builder()
            .status(200)
            .body(full_body(format!(
                r#"{{"status":"ready","routes":{}}}"#,
                state.routes.len(),
            )))
            .unwrap()),

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/routes" => {
            let routes: Vec<serde_json::Value> = state
                .routes
                .ids()
                .iter()
                .filter_map(|id| state.routes.get(id))
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "upstreams": r.upstreams,
                        "prefer_fetch": r.prefer_fetch,
                        "force_streaming": r.force_streaming,
                    })
                })
                .collect();
            let body = serde_json::to_string_pretty(&routes).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
