//! Route resolution: preset catalog lookup and the token-gated generic
//! pass-through grammar.
//!
//! Path grammar (after the leading `/`):
//!
//! ```text
//! root           := "" | "test" | TOKEN "/" generic-target | TOKEN "/" preset rest
//!                 | preset rest
//! generic-target := SCHEME "/" HOST [ "/" PATH ]        SCHEME ∈ {http, https, ws, wss}
//! ```

use crate::config::GatewayConfig;
use crate::transport::TargetUrl;
use std::collections::HashMap;
use std::sync::Arc;

/// One preset route: short identifier mapped to upstream base URL(s) and a
/// transport policy. Immutable once the table is built.
#[derive(Debug, Clone)]
pub struct RouteDescriptor {
    pub id: String,
    pub upstreams: Vec<String>,
    /// Skip the raw socket and go straight to the high-level client.
    pub prefer_fetch: bool,
    /// The route's responses are always streamed chunk-by-chunk downstream.
    pub force_streaming: bool,
}

/// Built-in upstream catalog: (id, base URL, prefer_fetch, force_streaming).
const PRESETS: &[(&str, &str, bool, bool)] = &[
    ("openai", "https://api.openai.com", false, false),
    ("claude", "https://api.anthropic.com", false, false),
    ("gemini", "https://generativelanguage.googleapis.com", false, true),
    ("groq", "https://api.groq.com/openai", false, false),
    ("mistral", "https://api.mistral.ai", false, false),
    ("deepseek", "https://api.deepseek.com", false, false),
    ("xai", "https://api.x.ai", false, false),
    ("cohere", "https://api.cohere.ai", false, false),
    ("openrouter", "https://openrouter.ai/api", false, false),
    ("together", "https://api.together.xyz", false, false),
    ("fireworks", "https://api.fireworks.ai/inference", false, false),
    ("perplexity", "https://api.perplexity.ai", false, false),
    ("huggingface", "https://api-inference.huggingface.co", true, false),
    ("telegram", "https://api.telegram.org", true, false),
    ("discord", "https://discord.com/api", true, false),
];

/// Preset routes whose traffic is eligible for the Gemini continuation
/// engine.
pub const GEMINI_ROUTE_IDS: &[&str] = &["gemini"];

/// Process-wide immutable route table, built once at startup.
pub struct RouteTable {
    routes: HashMap<String, Arc<RouteDescriptor>>,
}

impl RouteTable {
    pub fn builtin(config: &GatewayConfig) -> Self {
        let mut routes = HashMap::with_capacity(PRESETS.len() + 1);
        for (id, base, prefer_fetch, force_streaming) in PRESETS {
            routes.insert(
                id.to_string(),
                Arc::new(RouteDescriptor {
                    id: id.to_string(),
                    upstreams: vec![base.to_string()],
                    prefer_fetch: *prefer_fetch,
                    force_streaming: *force_streaming,
                }),
            );
        }
        if let Some(ref url) = config.default_dst_url {
            routes.insert(
                "default".to_string(),
                Arc::new(RouteDescriptor {
                    id: "default".to_string(),
                    upstreams: vec![url.clone()],
                    prefer_fetch: config.force_fetch_default,
                    force_streaming: false,
                }),
            );
        }
        Self { routes }
    }

    /// Build a table from explicit descriptors (admin tooling and tests).
    pub fn from_descriptors(descriptors: Vec<RouteDescriptor>) -> Self {
        let routes = descriptors
            .into_iter()
            .map(|d| (d.id.clone(), Arc::new(d)))
            .collect();
        Self { routes }
    }

    pub fn get(&self, id: &str) -> Option<Arc<RouteDescriptor>> {
        self.routes.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.routes.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug)]
pub enum Resolution {
    /// `/` — public landing page.
    Landing,
    /// `/test` — public liveness probe.
    Probe,
    /// Preset route with the remaining path-and-query to append.
    Preset {
        route: Arc<RouteDescriptor>,
        rest: String,
        /// The caller presented a valid token (relevant for debug logging).
        authenticated: bool,
    },
    /// Fully specified generic pass-through target.
    Generic { target: TargetUrl },
}

#[derive(Debug, PartialEq, Eq)]
pub enum RouteError {
    /// 401 — non-preset path without a valid token, or preset auth enforced.
    Unauthorized,
    /// 400 — token presented but the target is missing or unparseable.
    Malformed(&'static str),
}

/// Resolve a request path (with query) against the table and auth policy.
pub fn resolve(
    table: &RouteTable,
    config: &GatewayConfig,
    path_and_query: &str,
) -> Result<Resolution, RouteError> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };
    let trimmed = path.strip_prefix('/').unwrap_or(path);

    if trimmed.is_empty() {
        return Ok(Resolution::Landing);
    }
    if trimmed == "test" {
        return Ok(Resolution::Probe);
    }

    let (first, rest) = split_segment(trimmed);

    let token_valid = !config.auth_token.is_empty() && first == config.auth_token;
    if token_valid {
        let rest = rest.ok_or(RouteError::Malformed("token without a proxy target"))?;
        let (second, remainder) = split_segment(rest);
        return match second {
            "http" | "https" | "ws" | "wss" => {
                let target = parse_generic_target(second, remainder.unwrap_or(""), query)?;
                Ok(Resolution::Generic { target })
            }
            id => match table.get(id) {
                Some(route) => Ok(Resolution::Preset {
                    route,
                    rest: with_query(remainder.unwrap_or(""), query),
                    authenticated: true,
                }),
                None => Err(RouteError::Malformed("unknown proxy target")),
            },
        };
    }

    match table.get(first) {
        Some(route) => {
            if config.preset_auth_enabled {
                return Err(RouteError::Unauthorized);
            }
            Ok(Resolution::Preset {
                route,
                rest: with_query(rest.unwrap_or(""), query),
                authenticated: false,
            })
        }
        None => Err(RouteError::Unauthorized),
    }
}

fn split_segment(path: &str) -> (&str, Option<&str>) {
    match path.split_once('/') {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    }
}

fn with_query(path: &str, query: Option<&str>) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.is_empty() {
        out.push('/');
        out.push_str(path);
    }
    if let Some(q) = query {
        out.push('?');
        out.push_str(q);
    }
    out
}

fn parse_generic_target(
    scheme: &str,
    remainder: &str,
    query: Option<&str>,
) -> Result<TargetUrl, RouteError> {
    let (authority, tail) = split_segment(remainder);
    if authority.is_empty() {
        return Err(RouteError::Malformed("generic target missing host"));
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => {
            let port = p
                .parse::<u16>()
                .map_err(|_| RouteError::Malformed("bad port in generic target"))?;
            (h, port)
        }
        None => (authority, TargetUrl::default_port(scheme)),
    };
    if host.is_empty() {
        return Err(RouteError::Malformed("generic target missing host"));
    }

    let mut path_and_query = String::from("/");
    if let Some(tail) = tail {
        path_and_query.push_str(tail);
    }
    if let Some(q) = query {
        path_and_query.push('?');
        path_and_query.push_str(q);
    }

    Ok(TargetUrl {
        scheme: scheme.to_string(),
        host: host.to_string(),
        port,
        path_and_query,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(token: &str, preset_auth: bool) -> GatewayConfig {
        GatewayConfig {
            auth_token: token.to_string(),
            preset_auth_enabled: preset_auth,
            ..GatewayConfig::default()
        }
    }

    fn table(cfg: &GatewayConfig) -> RouteTable {
        RouteTable::builtin(cfg)
    }

    #[test]
    fn landing_and_probe_are_public() {
        let cfg = config("tok", true);
        let t = table(&cfg);
        assert!(matches!(resolve(&t, &cfg, "/"), Ok(Resolution::Landing)));
        assert!(matches!(resolve(&t, &cfg, "/test"), Ok(Resolution::Probe)));
    }

    #[test]
    fn preset_public_by_default() {
        let cfg = config("tok", false);
        let t = table(&cfg);
        match resolve(&t, &cfg, "/openai/v1/models?limit=5").unwrap() {
            Resolution::Preset { route, rest, authenticated } => {
                assert_eq!(route.id, "openai");
                assert_eq!(rest, "/v1/models?limit=5");
                assert!(!authenticated);
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn preset_requires_token_when_enabled() {
        let cfg = config("tok", true);
        let t = table(&cfg);
        assert_eq!(
            resolve(&t, &cfg, "/openai/v1/models").unwrap_err(),
            RouteError::Unauthorized
        );
        match resolve(&t, &cfg, "/tok/openai/v1/models").unwrap() {
            Resolution::Preset { route, authenticated, .. } => {
                assert_eq!(route.id, "openai");
                assert!(authenticated);
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn unknown_first_segment_is_unauthorized() {
        let cfg = config("tok", false);
        let t = table(&cfg);
        assert_eq!(
            resolve(&t, &cfg, "/nonsense/path").unwrap_err(),
            RouteError::Unauthorized
        );
    }

    #[test]
    fn token_only_path_is_malformed() {
        let cfg = config("tok", false);
        let t = table(&cfg);
        assert!(matches!(
            resolve(&t, &cfg, "/tok").unwrap_err(),
            RouteError::Malformed(_)
        ));
    }

    #[test]
    fn generic_target_parses_scheme_host_port_path() {
        let cfg = config("tok", false);
        let t = table(&cfg);
        match resolve(&t, &cfg, "/tok/https/api.example.com/v1/x?q=1").unwrap() {
            Resolution::Generic { target } => {
                assert_eq!(target.scheme, "https");
                assert_eq!(target.host, "api.example.com");
                assert_eq!(target.port, 443);
                assert_eq!(target.path_and_query, "/v1/x?q=1");
            }
            other => panic!("unexpected resolution: {:?}", other),
        }

        match resolve(&t, &cfg, "/tok/ws/localhost:9001/feed").unwrap() {
            Resolution::Generic { target } => {
                assert_eq!(target.scheme, "ws");
                assert_eq!(target.port, 9001);
                assert_eq!(target.path_and_query, "/feed");
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn generic_target_requires_host() {
        let cfg = config("tok", false);
        let t = table(&cfg);
        assert!(matches!(
            resolve(&t, &cfg, "/tok/https").unwrap_err(),
            RouteError::Malformed(_)
        ));
        assert!(matches!(
            resolve(&t, &cfg, "/tok/https/").unwrap_err(),
            RouteError::Malformed(_)
        ));
    }

    #[test]
    fn empty_token_disables_generic_path() {
        let cfg = config("", false);
        let t = table(&cfg);
        // Without a configured token nothing matches the token branch; an
        // unknown first segment is a plain 401.
        assert_eq!(
            resolve(&t, &cfg, "/anything/https/example.com").unwrap_err(),
            RouteError::Unauthorized
        );
    }

    #[test]
    fn default_route_backed_by_env_url() {
        let mut cfg = config("tok", false);
        cfg.default_dst_url = Some("https://fallback.example".to_string());
        let t = table(&cfg);
        match resolve(&t, &cfg, "/default/v1/ping").unwrap() {
            Resolution::Preset { route, rest, .. } => {
                assert_eq!(route.upstreams, vec!["https://fallback.example"]);
                assert_eq!(rest, "/v1/ping");
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn token_with_unknown_target_is_malformed() {
        let cfg = config("tok", false);
        let t = table(&cfg);
        assert!(matches!(
            resolve(&t, &cfg, "/tok/ftp/example.com").unwrap_err(),
            RouteError::Malformed(_)
        ));
    }
}
