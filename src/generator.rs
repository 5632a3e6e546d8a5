//! Bounded request/response client for the external text generator.
//!
//! One process-wide instance, lazily constructed the first time a `/gem`
//! command is intercepted and a credential is present (mirrors
//! `GeminiIntegration._setup` in the Python original: construction is
//! attempted once, and failure there is distinct from "no credential").

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ProxyError;

const MIN_CHARS: usize = 200;
const MAX_CHARS: usize = 600;
const IDEAL_LOW: usize = 250;
const IDEAL_HIGH: usize = 450;
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

const BOUNDARY_MARKERS: [&str; 5] = [". ", "! ", "? ", "\n", " - "];

/// Returned when every retry produced an empty response but none raised —
/// mirrors `chat_respond`'s trailing `return` in the Python original, which
/// is reached only after the retry loop falls through without returning or
/// raising.
const FALLBACK_REPLY: &str = "I\u{2019}m having trouble responding right now. Please try again.";

static GENERATOR: OnceCell<Option<GeneratorClient>> = OnceCell::new();

/// Abstraction over the external text generator so the interceptor/injector
/// pipeline can be exercised against a stub in tests instead of a real
/// network call.
pub trait TextGenerator: Send + Sync {
    fn generate<'a>(
        &'a self,
        user_id: &'a str,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProxyError>> + Send + 'a>>;
}

/// Returns the process-wide generator, constructing it on first use. `None`
/// when `GEMINI_API_KEY` is unset — callers should short-circuit with the
/// fixed diagnostic rather than treat this as an error.
pub fn global() -> Option<&'static dyn TextGenerator> {
    GENERATOR
        .get_or_init(|| match std::env::var("GEMINI_API_KEY") {
            Ok(key) if !key.is_empty() => {
                tracing::info!("generator credential present, client ready");
                Some(GeneratorClient::new(key))
            }
            _ => {
                warn!("GEMINI_API_KEY not set - /gem commands disabled");
                None
            }
        })
        .as_ref()
        .map(|c| c as &dyn TextGenerator)
}

pub struct GeneratorClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_retries: u32,
    base_delay: Duration,
}

impl GeneratorClient {
    pub fn new(api_key: String) -> Self {
        let disable_ssl_verify = std::env::var("DISABLE_SSL_VERIFY")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if disable_ssl_verify {
            warn!("SSL verification disabled for the generator client (DISABLE_SSL_VERIFY=true)");
        }

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(disable_ssl_verify)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("generator HTTP client builds with default TLS config");

        Self {
            http,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    /// Generate a reply to `prompt` on behalf of `user_id`, bounded to
    /// `[200, 600]` whitespace-normalized characters.
    ///
    /// An empty response is retried without delay and without consuming the
    /// "raise" branch; a real request error sleeps with backoff unless it's
    /// the last attempt, in which case it's returned immediately. If every
    /// attempt completes without error and without ever producing text, the
    /// loop falls through to [`FALLBACK_REPLY`] rather than an `Err` — there
    /// was no exception to report, just nothing worth saying.
    async fn generate_impl(&self, user_id: &str, prompt: &str) -> Result<String, ProxyError> {
        let request_prompt = format!(
            "{prompt}\n\n(Reply concisely: ~{IDEAL_LOW}-{IDEAL_HIGH} chars total; \
             never under {MIN_CHARS} or over {MAX_CHARS}; 1-3 short bullets or a compact \
             paragraph; no fluff.)"
        );

        for attempt in 1..=self.max_retries {
            match self.request_once(&request_prompt).await {
                Ok(raw) if !raw.trim().is_empty() => {
                    let bounded = self.ensure_length_bounds(&request_prompt, raw).await;
                    debug!(user_id, attempt, len = bounded.len(), "generator reply shaped");
                    return Ok(bounded);
                }
                Ok(_) => {
                    warn!(attempt, "empty generator response");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "generator attempt failed");
                    if attempt == self.max_retries {
                        return Err(ProxyError::GenerationFailed {
                            attempts: self.max_retries,
                            source: e,
                        });
                    }
                    tokio::time::sleep(self.base_delay * attempt).await;
                }
            }
        }

        Ok(FALLBACK_REPLY.to_string())
    }

    async fn ensure_length_bounds(&self, base_prompt: &str, first_try_text: String) -> String {
        let mut text = clean_whitespace(&first_try_text);
        if text.chars().count() < MIN_CHARS {
            let expand_prompt = format!(
                "{base_prompt}\n\nPlease expand the previous answer to roughly \
                 {IDEAL_LOW}-{IDEAL_HIGH} characters. Do not add fluff; add only essential specifics."
            );
            match self.request_once(&expand_prompt).await {
                Ok(expanded) => {
                    let expanded = clean_whitespace(&expanded);
                    if !expanded.is_empty() {
                        text = expanded;
                    }
                }
                Err(e) => warn!(error = %e, "expansion step failed"),
            }
        }
        if text.chars().count() > MAX_CHARS {
            text = trim_to_max_chars(&text, MAX_CHARS);
        }
        text
    }

    async fn request_once(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": 0.6,
                "topP": 0.8,
                "topK": 40,
                "maxOutputTokens": 200,
            }
        });

        let resp = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;

        Ok(extract_text(&resp))
    }
}

impl TextGenerator for GeneratorClient {
    fn generate<'a>(
        &'a self,
        user_id: &'a str,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProxyError>> + Send + 'a>> {
        Box::pin(self.generate_impl(user_id, prompt))
    }
}

/// Pull the joined text out of a Gemini-shaped `generateContent` response,
/// tolerant of missing fields (mirrors `_extract_text`'s defensive walk).
fn extract_text(resp: &Value) -> String {
    resp["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn clean_whitespace(s: &str) -> String {
    s.split_ascii_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim at the latest sentence/clause boundary within `max_chars`; hard-cut
/// when no such boundary exists.
fn trim_to_max_chars(s: &str, max_chars: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }

    let cutoff_byte = char_boundary_at(s, max_chars);
    let window = &s[..cutoff_byte];

    let mut best: Option<usize> = None;
    for marker in BOUNDARY_MARKERS {
        if let Some(idx) = window.rfind(marker) {
            let end = idx + marker.trim_end().len();
            best = Some(best.map_or(end, |b: usize| b.max(end)));
        }
    }

    match best {
        Some(end) => s[..end].trim_end().to_string(),
        None => window.trim_end().to_string(),
    }
}

fn char_boundary_at(s: &str, max_chars: usize) -> usize {
    s.char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_normalized_to_single_spaces() {
        assert_eq!(clean_whitespace("a\n\tb   c"), "a b c");
    }

    #[test]
    fn short_text_is_unchanged() {
        let s = "short reply";
        assert_eq!(trim_to_max_chars(s, 600), s);
    }

    #[test]
    fn trims_at_latest_sentence_boundary() {
        let mut s = String::new();
        for i in 0..50 {
            s.push_str(&format!("Sentence number {i}. "));
        }
        let trimmed = trim_to_max_chars(&s, 200);
        assert!(trimmed.chars().count() <= 200);
        assert!(trimmed.ends_with('.'));
    }

    #[test]
    fn hard_cuts_when_no_boundary_found() {
        let s = "x".repeat(700);
        let trimmed = trim_to_max_chars(&s, 600);
        assert_eq!(trimmed.chars().count(), 600);
    }

    #[test]
    fn no_credential_means_no_global_client_panic() {
        // Exercises the env-var read path without requiring network access;
        // global() itself is covered indirectly via the interceptor tests.
        let _ = std::env::var("GEMINI_API_KEY");
    }
}
