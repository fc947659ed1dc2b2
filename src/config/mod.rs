pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

impl GatewayConfig {
    /// Build the configuration snapshot from the process environment.
    ///
    /// Boolean variables compare literally against `"true"`; any other value
    /// (or absence) means `false`. The Gemini handler is the one exception:
    /// it is on unless explicitly set to something other than `"true"`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Environment access is injected so tests can build snapshots without
    /// mutating process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).map(|v| v == "true").unwrap_or(false);

        let mut prompts = RetryPrompts::default();
        if let Some(v) = lookup("GEMINI_RETRY_PROMPT_EN") {
            if !v.is_empty() {
                prompts.en = v;
            }
        }
        if let Some(v) = lookup("GEMINI_RETRY_PROMPT_CN") {
            if !v.is_empty() {
                prompts.zh = v;
            }
        }

        Self {
            auth_token: lookup("AUTH_TOKEN").unwrap_or_default(),
            debug_mode: flag("DEBUG_MODE"),
            preset_auth_enabled: flag("PRESET_AUTH_ENABLED"),
            gemini_special_handling: lookup("GEMINI_SPECIAL_HANDLING_ENABLED")
                .map(|v| v == "true")
                .unwrap_or(true),
            default_dst_url: lookup("DEFAULT_DST_URL").filter(|v| !v.is_empty()),
            force_fetch_default: flag("FORCE_FETCH_DEFAULT"),
            aggressive_fallback: flag("AGGRESSIVE_FALLBACK"),
            retry_prompts: prompts,
        }
    }

    pub fn validate(&self) {
        if self.auth_token.is_empty() {
            tracing::warn!(
                "config: AUTH_TOKEN is not set, generic pass-through is disabled"
            );
        }
        if self.preset_auth_enabled && self.auth_token.is_empty() {
            tracing::warn!(
                "config: PRESET_AUTH_ENABLED=true with empty AUTH_TOKEN locks out all preset routes"
            );
        }
    }
}
