/// Immutable configuration snapshot, built once at startup from the process
/// environment. Request handlers only ever see this struct behind an `Arc`.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Token gating the generic pass-through (and presets when
    /// `preset_auth_enabled`). Empty token disables the generic path.
    pub auth_token: String,
    /// Verbose request/response header logging (with credentials redacted).
    pub debug_mode: bool,
    /// When true, preset routes also require the token prefix.
    pub preset_auth_enabled: bool,
    /// Master switch for the Gemini SSE continuation engine.
    pub gemini_special_handling: bool,
    /// Upstream base URL backing the `default` preset route.
    pub default_dst_url: Option<String>,
    /// Prefer the high-level transport for generic pass-through targets.
    pub force_fetch_default: bool,
    /// Treat every raw-socket failure as fallback-eligible.
    pub aggressive_fallback: bool,
    pub retry_prompts: RetryPrompts,
}

/// Continuation-prompt overrides. English and Chinese are operator-tunable;
/// the remaining languages use built-in prompts (see `gemini::language`).
#[derive(Debug, Clone)]
pub struct RetryPrompts {
    pub en: String,
    pub zh: String,
}

pub const DEFAULT_RETRY_PROMPT_EN: &str =
    "Continue exactly where you left off. Do not repeat any earlier content, \
     do not summarize, and do not add any preamble.";

pub const DEFAULT_RETRY_PROMPT_ZH: &str =
    "请从上次中断的地方继续输出，不要重复之前已经生成的内容，不要总结，不要添加任何开场白。";

impl Default for RetryPrompts {
    fn default() -> Self {
        Self {
            en: DEFAULT_RETRY_PROMPT_EN.to_string(),
            zh: DEFAULT_RETRY_PROMPT_ZH.to_string(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_token: String::new(),
            debug_mode: false,
            preset_auth_enabled: false,
            gemini_special_handling: true,
            default_dst_url: None,
            force_fetch_default: false,
            aggressive_fallback: false,
            retry_prompts: RetryPrompts::default(),
        }
    }
}
