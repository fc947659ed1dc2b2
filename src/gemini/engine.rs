//! Resilient-SSE continuation engine.
//!
//! Consumes an upstream Gemini SSE response, tells a legitimate completion
//! apart from a dropped stream, and transparently re-requests the
//! generation with the already-emitted output spliced back into the
//! conversation, so the downstream client sees one uninterrupted stream.
//!
//! The downstream status line is committed as soon as the initial upstream
//! response is 2xx; every later failure is surfaced as an in-band
//! `event: error` SSE event.

use crate::config::RetryPrompts;
use crate::error::ProxyError;
use crate::gemini::google_status;
use crate::gemini::language::{detect_language, retry_prompt};
use crate::gemini::sse::SseLineStream;
use crate::transport::{Dispatch, RequestEnvelope, UpstreamResponse};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const MAX_CONSECUTIVE_RETRIES: u32 = 5;
pub const MAX_NETWORK_RETRIES: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_millis(750);

/// Upstream statuses that must not be retried on a continuation attempt.
pub const NON_RETRYABLE_STATUSES: &[u16] = &[400, 401, 403, 404, 429];

/// An attempt that saw a bare `STOP` still counts as complete when this
/// much text has accumulated across attempts.
const SUFFICIENT_TEXT_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_consecutive_retries: u32,
    pub max_network_retries: u32,
    pub retry_delay: Duration,
    pub network_backoff_unit: Duration,
    pub network_backoff_cap: Duration,
    pub prompts: RetryPrompts,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_consecutive_retries: MAX_CONSECUTIVE_RETRIES,
            max_network_retries: MAX_NETWORK_RETRIES,
            retry_delay: RETRY_DELAY,
            network_backoff_unit: Duration::from_millis(2000),
            network_backoff_cap: Duration::from_millis(10_000),
            prompts: RetryPrompts::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_prompts(prompts: RetryPrompts) -> Self {
        Self {
            prompts,
            ..Self::default()
        }
    }
}

/// Writer half of the downstream SSE body. Sending fails once the client
/// goes away (the response body stream is dropped), which is the engine's
/// disconnect signal.
#[derive(Clone)]
pub struct SseWriter {
    tx: mpsc::Sender<Bytes>,
}

pub fn sse_channel(buffer: usize) -> (SseWriter, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(buffer);
    (SseWriter { tx }, rx)
}

impl SseWriter {
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), ProxyError> {
        self.tx
            .send(data.into())
            .await
            .map_err(|_| ProxyError::Disconnected)
    }

    /// Forward one upstream line, followed by the blank separator line.
    pub async fn write_line(&self, line: &str) -> Result<(), ProxyError> {
        let mut out = String::with_capacity(line.len() + 2);
        out.push_str(line);
        out.push_str("\n\n");
        self.write(out).await
    }
}

/// Why an attempt ended without completing the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// `STOP` with no substantive output behind it.
    StopWithoutSufficientContent,
    /// A finish reason outside the known-good set.
    FinishAbnormal,
    /// Stream ended with no finish reason at all.
    Drop,
    /// Stream ended mid tool invocation.
    DropDuringToolUse,
    /// Reading the upstream failed.
    FetchError,
}

impl Interruption {
    fn as_str(self) -> &'static str {
        match self {
            Interruption::StopWithoutSufficientContent => "stop_without_content",
            Interruption::FinishAbnormal => "finish_abnormal",
            Interruption::Drop => "drop",
            Interruption::DropDuringToolUse => "drop_during_tool_use",
            Interruption::FetchError => "fetch_error",
        }
    }
}

enum AttemptEnd {
    /// Generation finished; downstream is complete.
    Complete,
    /// Downstream went away; stop silently.
    Disconnected,
    Interrupted(Interruption),
}

/// Per-request session state. Created on the first successful upstream
/// response, destroyed when the downstream writer closes.
struct Session {
    accumulated_text: String,
    consecutive_retries: u32,
    network_retries: u32,
    saw_final_answer_content: bool,
    saw_tool_calls: bool,
    original_body: Value,
}

impl Session {
    fn new(original_body: Value) -> Self {
        Self {
            accumulated_text: String::new(),
            consecutive_retries: 0,
            network_retries: 0,
            saw_final_answer_content: false,
            saw_tool_calls: false,
            original_body,
        }
    }
}

pub struct ContinuationEngine {
    dispatcher: Arc<dyn Dispatch>,
    settings: EngineSettings,
}

impl ContinuationEngine {
    pub fn new(dispatcher: Arc<dyn Dispatch>, settings: EngineSettings) -> Self {
        Self {
            dispatcher,
            settings,
        }
    }

    /// Drive the state machine to completion. The initial upstream response
    /// must already be 2xx — the caller has committed the downstream status
    /// line by the time this runs. Dropping `writer` on return (any path)
    /// closes the downstream body; that drop is the supervisor guarantee.
    pub async fn run(
        &self,
        writer: SseWriter,
        initial: UpstreamResponse,
        original_body: Value,
        retry_template: RequestEnvelope,
        prefer_fetch: bool,
    ) {
        let mut session = Session::new(original_body);
        let mut current = initial;

        loop {
            match self.consume_attempt(&writer, current, &mut session).await {
                AttemptEnd::Complete => {
                    debug!(
                        retries = session.consecutive_retries,
                        accumulated_chars = session.accumulated_text.chars().count(),
                        "gemini: stream completed"
                    );
                    return;
                }
                AttemptEnd::Disconnected => {
                    debug!("gemini: downstream disconnected, abandoning session");
                    return;
                }
                AttemptEnd::Interrupted(kind) => {
                    warn!(
                        kind = kind.as_str(),
                        consecutive_retries = session.consecutive_retries,
                        "gemini: stream interrupted"
                    );
                    metrics::counter!(
                        "gateway_gemini_interruptions_total",
                        "kind" => kind.as_str(),
                    )
                    .increment(1);

                    match self
                        .acquire_continuation(&writer, &mut session, &retry_template, prefer_fetch)
                        .await
                    {
                        Some(next) => current = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Inner loop for one upstream attempt: forward every non-empty line
    /// verbatim, then interpret it.
    async fn consume_attempt(
        &self,
        writer: &SseWriter,
        response: UpstreamResponse,
        session: &mut Session,
    ) -> AttemptEnd {
        session.saw_final_answer_content = false;
        session.saw_tool_calls = false;

        let mut lines = SseLineStream::new(response.body);
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return AttemptEnd::Interrupted(if session.saw_tool_calls {
                        Interruption::DropDuringToolUse
                    } else {
                        Interruption::Drop
                    });
                }
                Err(e) => {
                    warn!(error = %e, "gemini: upstream read failed");
                    return AttemptEnd::Interrupted(Interruption::FetchError);
                }
            };

            if line.is_empty() {
                continue;
            }

            // Forward before interpretation — the client sees raw upstream
            // events, including any interrupted finish reason.
            if writer.write_line(&line).await.is_err() {
                return AttemptEnd::Disconnected;
            }

            let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<Value>(payload) else {
                continue;
            };
            let Some(candidate) = event.get("candidates").and_then(|c| c.get(0)) else {
                continue;
            };

            if let Some(parts) = candidate
                .pointer("/content/parts")
                .and_then(Value::as_array)
            {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        session.accumulated_text.push_str(text);
                        let thought = part
                            .get("thought")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if !thought {
                            session.saw_final_answer_content = true;
                        }
                    }
                    if part.get("functionCall").is_some() || part.get("toolCode").is_some() {
                        session.saw_tool_calls = true;
                    }
                }
            }

            if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
                match reason {
                    "STOP" => {
                        if session.saw_final_answer_content || session.saw_tool_calls {
                            return AttemptEnd::Complete;
                        }
                        if session.accumulated_text.chars().count() > SUFFICIENT_TEXT_CHARS {
                            return AttemptEnd::Complete;
                        }
                        return AttemptEnd::Interrupted(
                            Interruption::StopWithoutSufficientContent,
                        );
                    }
                    // The upstream chose to stop; respect it.
                    "MAX_TOKENS" | "TOOL_CODE" | "SAFETY" | "RECITATION" => {
                        return AttemptEnd::Complete;
                    }
                    other => {
                        debug!(finish_reason = other, "gemini: abnormal finish reason");
                        return AttemptEnd::Interrupted(Interruption::FinishAbnormal);
                    }
                }
            }
        }
    }

    /// Retry procedure: budget check, delay, continuation dispatch with
    /// network backoff. `Some(response)` resumes the inner loop; `None`
    /// means a terminal SSE error was emitted (or downstream is gone).
    async fn acquire_continuation(
        &self,
        writer: &SseWriter,
        session: &mut Session,
        template: &RequestEnvelope,
        prefer_fetch: bool,
    ) -> Option<UpstreamResponse> {
        if session.consecutive_retries >= self.settings.max_consecutive_retries {
            warn!(
                retries = session.consecutive_retries,
                "gemini: retry budget exhausted"
            );
            let _ = writer
                .write(sse_error_event(
                    504,
                    "Stream interrupted and retry budget exhausted.",
                ))
                .await;
            return None;
        }

        tokio::time::sleep(self.settings.retry_delay).await;

        loop {
            let language = detect_language(&session.accumulated_text);
            let prompt = retry_prompt(&self.settings.prompts, language);
            let body =
                build_continuation_body(&session.original_body, &session.accumulated_text, prompt);
            let payload = match serde_json::to_vec(&body) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "gemini: continuation body serialization failed");
                    let _ = writer
                        .write(sse_error_event(500, "Failed to build continuation request."))
                        .await;
                    return None;
                }
            };
            let mut envelope = template.clone();
            envelope.body = Some(Bytes::from(payload));

            metrics::counter!("gateway_gemini_retries_total", "language" => language).increment(1);
            debug!(
                language,
                consecutive = session.consecutive_retries + 1,
                "gemini: dispatching continuation request"
            );

            match self.dispatcher.dispatch(&envelope, prefer_fetch).await {
                Ok(resp) if resp.is_success() => {
                    session.network_retries = 0;
                    session.consecutive_retries += 1;
                    return Some(resp);
                }
                Ok(resp) if NON_RETRYABLE_STATUSES.contains(&resp.status) => {
                    warn!(status = resp.status, "gemini: continuation rejected upstream");
                    let _ = writer
                        .write(sse_error_event(
                            resp.status,
                            "Upstream rejected the continuation request.",
                        ))
                        .await;
                    return None;
                }
                Ok(resp) => {
                    debug!(status = resp.status, "gemini: retryable status on continuation");
                    if !self.note_network_failure(writer, session).await {
                        return None;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "gemini: continuation dispatch failed");
                    if !self.note_network_failure(writer, session).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Count a network-level continuation failure and back off. `false`
    /// once the network budget is spent (a 502 event has been emitted).
    async fn note_network_failure(&self, writer: &SseWriter, session: &mut Session) -> bool {
        session.network_retries += 1;
        if session.network_retries > self.settings.max_network_retries {
            let _ = writer
                .write(sse_error_event(
                    502,
                    "Continuation request failed after repeated network errors.",
                ))
                .await;
            return false;
        }
        let backoff = (self.settings.network_backoff_unit * session.network_retries)
            .min(self.settings.network_backoff_cap);
        tokio::time::sleep(backoff).await;
        true
    }
}

/// Synthesised in-band error event, Google-style payload.
pub fn sse_error_event(code: u16, message: &str) -> String {
    let payload = json!({
        "error": {
            "code": code,
            "status": google_status(code),
            "message": message,
            "details": [],
        }
    });
    format!("event: error\ndata: {}\n\n", payload)
}

/// Deep-copy the original request body and splice the accumulated output
/// back in: a `model` turn carrying everything emitted so far, then a
/// `user` turn with the continuation instruction. Both are inserted right
/// after the last `user` message (appended when there is none).
pub fn build_continuation_body(original: &Value, accumulated: &str, prompt: &str) -> Value {
    let mut body = original.clone();
    let model_turn = json!({"role": "model", "parts": [{"text": accumulated}]});
    let user_turn = json!({"role": "user", "parts": [{"text": prompt}]});

    if let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) {
        let insert_at = contents
            .iter()
            .rposition(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .map(|i| i + 1)
            .unwrap_or(contents.len());
        contents.insert(insert_at, model_turn);
        contents.insert(insert_at + 1, user_turn);
    }
    body
}
