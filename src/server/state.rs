use crate::config::GatewayConfig;
use crate::gemini::{ContinuationEngine, EngineSettings};
use crate::metrics::Metrics;
use crate::routing::RouteTable;
use crate::transport::TransportSelector;
use std::sync::Arc;

/// Shared gateway state, cheaply cloneable.
///
/// Everything here is immutable after startup: the config is an environment
/// snapshot, the route table is the built-in catalog, and the selector and
/// engine only hold construction-time settings.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub routes: Arc<RouteTable>,
    pub selector: Arc<TransportSelector>,
    pub engine: Arc<ContinuationEngine>,
    pub metrics: Metrics,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, metrics: Metrics) -> Self {
        let config = Arc::new(config);
        let routes = Arc::new(RouteTable::builtin(&config));
        let selector = Arc::new(TransportSelector::new(config.aggressive_fallback));
        let engine = Arc::new(ContinuationEngine::new(
            selector.clone(),
            EngineSettings::from_prompts(config.retry_prompts.clone()),
        ));
        Self {
            config,
            routes,
            selector,
            engine,
            metrics,
        }
    }
}
