use super::GatewayConfig;
use std::collections::HashMap;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn test_defaults_when_env_empty() {
    let cfg = GatewayConfig::from_lookup(|_| None);
    assert!(cfg.auth_token.is_empty());
    assert!(!cfg.debug_mode);
    assert!(!cfg.preset_auth_enabled);
    assert!(cfg.gemini_special_handling);
    assert!(cfg.default_dst_url.is_none());
    assert!(!cfg.force_fetch_default);
    assert!(!cfg.aggressive_fallback);
}

#[test]
fn test_booleans_compare_literally() {
    let cfg = GatewayConfig::from_lookup(lookup_from(&[
        ("PRESET_AUTH_ENABLED", "true"),
        ("DEBUG_MODE", "TRUE"),
        ("AGGRESSIVE_FALLBACK", "1"),
    ]));
    assert!(cfg.preset_auth_enabled);
    // Only the literal lowercase "true" counts.
    assert!(!cfg.debug_mode);
    assert!(!cfg.aggressive_fallback);
}

#[test]
fn test_gemini_handler_off_only_when_explicit() {
    let on = GatewayConfig::from_lookup(|_| None);
    assert!(on.gemini_special_handling);

    let off = GatewayConfig::from_lookup(lookup_from(&[(
        "GEMINI_SPECIAL_HANDLING_ENABLED",
        "false",
    )]));
    assert!(!off.gemini_special_handling);
}

#[test]
fn test_retry_prompt_overrides() {
    let cfg = GatewayConfig::from_lookup(lookup_from(&[
        ("GEMINI_RETRY_PROMPT_EN", "keep going"),
        ("GEMINI_RETRY_PROMPT_CN", ""),
    ]));
    assert_eq!(cfg.retry_prompts.en, "keep going");
    // Empty override falls back to the built-in prompt.
    assert!(!cfg.retry_prompts.zh.is_empty());
}

#[test]
fn test_auth_token_and_default_dst() {
    let cfg = GatewayConfig::from_lookup(lookup_from(&[
        ("AUTH_TOKEN", "sk-gateway"),
        ("DEFAULT_DST_URL", "https://api.example.com"),
    ]));
    assert_eq!(cfg.auth_token, "sk-gateway");
    assert_eq!(cfg.default_dst_url.as_deref(), Some("https://api.example.com"));
}
