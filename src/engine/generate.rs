use crate::engine::config::GenerationConfig;
use crate::engine::privacy::PrivacyPass;
use crate::engine::store::{Message, message_bytes};
use crate::engine::util::CancelFlag;
use crate::error::GenerateError;
use anyhow::{Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::Value;
use std::env;
use std::thread;
use std::time::Duration;

const APPROX_BYTES_PER_TOKEN: u64 = 4;
const SIGNAL_KEYWORDS: [&str; 5] = ["decision", "question", "announce", "plan", "link"];
const MAX_SIGNAL_LINES: usize = 20;
const MAX_FALLBACK_LINES: usize = 12;

/// Everything the generator may see: sealed messages only. Requiring the
/// pass by reference means the caller proves the batch went through the
/// privacy gate before this request was assembled.
#[derive(Debug)]
pub struct GenerationRequest<'a> {
    pub window_id: &'a str,
    pub messages: &'a [Message],
}

pub trait Generator: Send + Sync {
    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        pass: &PrivacyPass,
    ) -> Result<String, GenerateError>;

    fn label(&self) -> &'static str;
}

fn request_bytes(request: &GenerationRequest<'_>) -> u64 {
    request.messages.iter().map(message_bytes).sum()
}

/// Token estimate for a message slice: the byte heuristic for text-heavy
/// windows, the per-message floor for windows of short or attachment-only
/// messages.
pub fn estimate_tokens(messages: &[Message], cfg: &GenerationConfig) -> u64 {
    let by_bytes = messages.iter().map(message_bytes).sum::<u64>() / APPROX_BYTES_PER_TOKEN;
    let by_count = (messages.len() as u64).saturating_mul(cfg.approx_tokens_per_message);
    by_bytes.max(by_count)
}

/// Budget actually offered to the call, after headroom is carved off for
/// the instruction preamble and response.
pub fn effective_budget_tokens(cfg: &GenerationConfig) -> u64 {
    ((cfg.budget_tokens as f64) * cfg.budget_headroom_ratio).floor() as u64
}

fn check_budget(
    request: &GenerationRequest<'_>,
    cfg: &GenerationConfig,
) -> Result<(), GenerateError> {
    let estimated_tokens = estimate_tokens(request.messages, cfg);
    let effective_budget = effective_budget_tokens(cfg);
    if estimated_tokens > effective_budget {
        return Err(GenerateError::TooLarge {
            estimated_tokens,
            effective_budget,
        });
    }
    Ok(())
}

/// Offline generator for air-gapped runs and tests. Enforces the same
/// budget the remote path would hit so oversized windows still split
/// deterministically without a network call.
pub struct LocalGenerator {
    pub config: GenerationConfig,
}

fn is_signal_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    SIGNAL_KEYWORDS.iter().any(|kw| lower.contains(kw)) || lower.contains("http")
}

impl Generator for LocalGenerator {
    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        _pass: &PrivacyPass,
    ) -> Result<String, GenerateError> {
        check_budget(request, &self.config)?;

        let mut signals: Vec<String> = request
            .messages
            .iter()
            .filter(|m| is_signal_line(&m.text))
            .take(MAX_SIGNAL_LINES)
            .map(|m| format!("{}: {}", m.author, m.text.trim()))
            .collect();
        if signals.is_empty() {
            signals = request
                .messages
                .iter()
                .filter(|m| !m.text.trim().is_empty())
                .take(MAX_FALLBACK_LINES)
                .map(|m| format!("{}: {}", m.author, m.text.trim()))
                .collect();
        }

        let mut out = String::new();
        out.push_str(&format!("## Digest for {}\n", request.window_id));
        out.push_str(&format!("- messages: {}\n", request.messages.len()));
        out.push_str("- highlights:\n");
        if signals.is_empty() {
            out.push_str("  - no textual signals in this window\n");
        }
        for line in signals {
            out.push_str(&format!("  - {line}\n"));
        }
        Ok(out)
    }

    fn label(&self) -> &'static str {
        "local"
    }
}

/// Gemini-backed generator. HTTP failures are classified into the retry
/// taxonomy here so the retry loop never inspects reqwest types.
pub struct RemoteGenerator {
    pub api_key: String,
    pub config: GenerationConfig,
}

fn build_prompt(request: &GenerationRequest<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Write a concise digest of the following pseudonymized conversation window. \
         Group by topic, keep author handles verbatim, never guess real names.\n\n",
    );
    for message in request.messages {
        prompt.push_str(&format!("[{}] {}\n", message.author, message.text));
    }
    prompt
}

fn retry_after_secs(response: &reqwest::blocking::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> GenerateError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return GenerateError::Transient {
            reason: format!("upstream returned {status}"),
            retry_after_secs: retry_after,
        };
    }
    let token_overflow = status == StatusCode::PAYLOAD_TOO_LARGE
        || (status == StatusCode::BAD_REQUEST && body.to_ascii_lowercase().contains("token"));
    if token_overflow {
        // The upstream counted real tokens; report our own estimate so the
        // split loop has numbers to log.
        return GenerateError::TooLarge {
            estimated_tokens: 0,
            effective_budget: 0,
        };
    }
    GenerateError::Fatal {
        reason: format!("upstream returned {status}: {}", body.trim()),
    }
}

impl Generator for RemoteGenerator {
    fn generate(
        &self,
        request: &GenerationRequest<'_>,
        _pass: &PrivacyPass,
    ) -> Result<String, GenerateError> {
        check_budget(request, &self.config)?;

        let prompt = build_prompt(request);
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.config.model, self.api_key
        );
        let payload = serde_json::json!({
            "contents": [
                {
                    "parts": [
                        {"text": prompt}
                    ]
                }
            ]
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .build()
            .map_err(|err| GenerateError::Fatal {
                reason: format!("failed to build http client: {err}"),
            })?;
        let response = client.post(&url).json(&payload).send().map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                GenerateError::Transient {
                    reason: format!("request failed: {err}"),
                    retry_after_secs: None,
                }
            } else {
                GenerateError::Fatal {
                    reason: format!("request failed: {err}"),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().unwrap_or_default();
            let mut err = classify_status(status, retry_after, &body);
            if let GenerateError::TooLarge {
                estimated_tokens,
                effective_budget,
            } = &mut err
            {
                *estimated_tokens = request_bytes(request) / APPROX_BYTES_PER_TOKEN;
                *effective_budget = effective_budget_tokens(&self.config);
            }
            return Err(err);
        }

        let json: Value = response.json().map_err(|err| GenerateError::Transient {
            reason: format!("invalid JSON from upstream: {err}"),
            retry_after_secs: None,
        })?;
        let text = json
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .and_then(|v| v.get("content"))
            .and_then(|v| v.get("parts"))
            .and_then(Value::as_array)
            .and_then(|parts| parts.first())
            .and_then(|v| v.get("text"))
            .and_then(Value::as_str)
            .ok_or_else(|| GenerateError::Fatal {
                reason: "upstream response missing text content".to_string(),
            })?;

        Ok(text.to_string())
    }

    fn label(&self) -> &'static str {
        "remote"
    }
}

fn env_non_empty(var: &str) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

pub fn resolve_generator(cfg: &GenerationConfig) -> Result<Box<dyn Generator>> {
    match cfg.provider.as_str() {
        "local" => Ok(Box::new(LocalGenerator {
            config: cfg.clone(),
        })),
        "remote" => {
            let api_key = env_non_empty("GAZETTE_API_KEY")
                .or_else(|| env_non_empty("GEMINI_API_KEY"))
                .ok_or_else(|| {
                    anyhow!("remote provider needs GAZETTE_API_KEY or GEMINI_API_KEY")
                })?;
            Ok(Box::new(RemoteGenerator {
                api_key,
                config: cfg.clone(),
            }))
        }
        other => Err(anyhow!("unknown generation provider `{other}`")),
    }
}

/// Exponential backoff for attempt N, never less than an upstream
/// retry-after. The shift is clamped so a large configured retry count
/// cannot overflow the doubling.
fn backoff_delay(base_ms: u64, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let backoff = Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(20)));
    match retry_after_secs {
        Some(secs) => backoff.max(Duration::from_secs(secs)),
        None => backoff,
    }
}

/// Run one generation with the transient-retry policy: exponential backoff
/// from `retry_base_delay_ms`, honoring an upstream retry-after when given.
/// `TooLarge` and `Fatal` surface immediately; retries stop on cancel.
pub fn generate_with_retry(
    generator: &dyn Generator,
    request: &GenerationRequest<'_>,
    pass: &PrivacyPass,
    cfg: &GenerationConfig,
    cancel: &CancelFlag,
) -> Result<String, GenerateError> {
    let mut attempt: u32 = 0;
    loop {
        match generator.generate(request, pass) {
            Ok(content) => return Ok(content),
            Err(GenerateError::Transient {
                reason,
                retry_after_secs,
            }) => {
                if attempt >= cfg.max_retries || cancel.is_cancelled() {
                    return Err(GenerateError::Transient {
                        reason,
                        retry_after_secs,
                    });
                }
                thread::sleep(backoff_delay(
                    cfg.retry_base_delay_ms,
                    attempt,
                    retry_after_secs,
                ));
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        GenerationRequest, Generator, LocalGenerator, backoff_delay, classify_status,
        effective_budget_tokens, generate_with_retry,
    };
    use std::time::Duration;
    use crate::engine::config::GenerationConfig;
    use crate::engine::privacy::{PrivacyPolicy, seal_messages};
    use crate::engine::store::Message;
    use crate::engine::util::CancelFlag;
    use crate::error::GenerateError;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn sealed(messages: Vec<Message>) -> (Vec<Message>, crate::engine::privacy::PrivacyPass) {
        let policy = PrivacyPolicy::new("acme", "chat-export").expect("policy");
        let batch = seal_messages(&policy, "run-test", messages).expect("seal");
        (batch.messages, batch.pass)
    }

    fn msg(idx: usize, text: &str) -> Message {
        Message {
            id: format!("m{idx:04}"),
            thread_id: "t1".to_string(),
            timestamp: idx as i64,
            author: "alice".to_string(),
            text: text.to_string(),
            attachment_refs: Vec::new(),
        }
    }

    fn tiny_budget() -> GenerationConfig {
        GenerationConfig {
            budget_tokens: 50,
            budget_headroom_ratio: 0.8,
            max_retries: 2,
            retry_base_delay_ms: 1,
            ..GenerationConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_but_saturates_at_high_attempts() {
        assert_eq!(backoff_delay(100, 0, None), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 3, None), Duration::from_millis(800));
        // Attempts past the clamp stop doubling instead of overflowing.
        assert_eq!(backoff_delay(100, 64, None), backoff_delay(100, 20, None));
        assert_eq!(backoff_delay(1, 0, Some(5)), Duration::from_secs(5));
    }

    #[test]
    fn effective_budget_applies_headroom() {
        let cfg = GenerationConfig {
            budget_tokens: 1000,
            budget_headroom_ratio: 0.8,
            ..GenerationConfig::default()
        };
        assert_eq!(effective_budget_tokens(&cfg), 800);
    }

    #[test]
    fn local_generator_rejects_oversized_window() {
        let (messages, pass) = sealed(vec![msg(1, &"x".repeat(2000))]);
        let generator = LocalGenerator {
            config: tiny_budget(),
        };
        let request = GenerationRequest {
            window_id: "w0000",
            messages: &messages,
        };
        let err = generator.generate(&request, &pass).unwrap_err();
        assert!(matches!(err, GenerateError::TooLarge { .. }));
    }

    #[test]
    fn local_generator_extracts_signal_lines() {
        let (messages, pass) = sealed(vec![
            msg(1, "morning everyone"),
            msg(2, "Decision: move the meetup to Saturday"),
            msg(3, "ok"),
        ]);
        let generator = LocalGenerator {
            config: GenerationConfig::default(),
        };
        let request = GenerationRequest {
            window_id: "w0000",
            messages: &messages,
        };
        let digest = generator.generate(&request, &pass).expect("generate");
        assert!(digest.contains("Digest for w0000"));
        assert!(digest.contains("Decision: move the meetup to Saturday"));
        assert!(!digest.contains("morning everyone"));
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(3), ""),
            GenerateError::Transient {
                retry_after_secs: Some(3),
                ..
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            GenerateError::Transient { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "prompt token count exceeds limit"),
            GenerateError::TooLarge { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "bad key"),
            GenerateError::Fatal { .. }
        ));
    }

    struct FlakyGenerator {
        calls: AtomicU32,
        succeed_on: u32,
    }

    impl Generator for FlakyGenerator {
        fn generate(
            &self,
            _request: &GenerationRequest<'_>,
            _pass: &crate::engine::privacy::PrivacyPass,
        ) -> Result<String, GenerateError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok("digest".to_string())
            } else {
                Err(GenerateError::Transient {
                    reason: "simulated outage".to_string(),
                    retry_after_secs: None,
                })
            }
        }

        fn label(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn retry_loop_recovers_from_transient_failures() {
        let (messages, pass) = sealed(vec![msg(1, "hi")]);
        let generator = FlakyGenerator {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        };
        let request = GenerationRequest {
            window_id: "w0000",
            messages: &messages,
        };
        let out = generate_with_retry(
            &generator,
            &request,
            &pass,
            &tiny_budget(),
            &CancelFlag::default(),
        )
        .expect("should recover");
        assert_eq!(out, "digest");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_loop_gives_up_after_max_retries() {
        let (messages, pass) = sealed(vec![msg(1, "hi")]);
        let generator = FlakyGenerator {
            calls: AtomicU32::new(0),
            succeed_on: 10,
        };
        let request = GenerationRequest {
            window_id: "w0000",
            messages: &messages,
        };
        let err = generate_with_retry(
            &generator,
            &request,
            &pass,
            &tiny_budget(),
            &CancelFlag::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GenerateError::Transient { .. }));
        // max_retries = 2 means 1 initial call + 2 retries.
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }
}
