//! Examines every decoded text record, whether it arrived from a client or
//! from the radio, and dispatches `/gem` commands to a detached response
//! job. Never touches the raw frame that carried the command — that frame
//! has already been forwarded or broadcast verbatim by the caller.

use std::sync::Arc;

use tracing::info;

use crate::context::AppContext;
use crate::envelope::TextRecord;
use crate::generator::{self, TextGenerator};
use crate::injector;

const PREFIX: &str = "/gem";
const NO_PROMPT_REPLY: &str = "[Please provide a question after /gem]";
const NO_CREDENTIAL_REPLY: &str = "[Gemini AI not available - GEMINI_API_KEY not set]";

pub fn intercept(record: TextRecord, ctx: Arc<AppContext>) {
    let Some(remainder) = record.text.strip_prefix(PREFIX) else {
        return;
    };
    let prompt = remainder.trim_start().to_string();
    let sender = record.sender_id.clone();
    let channel = record.channel;

    info!(sender = %sender, channel, "intercepted /gem command");

    tokio::spawn(async move {
        let _permit = ctx.response_semaphore.clone().acquire_owned().await.ok();
        let reply = build_reply(&sender, &prompt, generator::global()).await;
        injector::inject(&ctx, Some(channel), reply).await;
    });
}

/// Picks the reply text for a `/gem` command: the fixed diagnostics for an
/// empty prompt (S6) or a missing credential, or the generator's own output
/// (or its error, reshaped) otherwise. Split out of `intercept` — which
/// also owns the semaphore permit and the final delivery — so it can be
/// driven against a stub [`TextGenerator`] in tests without spawning a task
/// or making a real network call.
async fn build_reply(sender: &str, prompt: &str, generator: Option<&dyn TextGenerator>) -> String {
    if prompt.is_empty() {
        return NO_PROMPT_REPLY.to_string();
    }
    match generator {
        None => NO_CREDENTIAL_REPLY.to_string(),
        Some(client) => match client.generate(sender, prompt).await {
            Ok(text) => text,
            Err(e) => format!("[AI Error: {}]", truncate(&e.to_string(), 100)),
        },
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn non_command_text_is_ignored() {
        assert!("hello".strip_prefix(PREFIX).is_none());
    }

    #[test]
    fn prefix_strip_trims_leading_whitespace() {
        let remainder = "/gem   what time is it".strip_prefix(PREFIX).unwrap();
        assert_eq!(remainder.trim_start(), "what time is it");
    }

    #[test]
    fn bare_prefix_yields_empty_prompt() {
        let remainder = "/gem".strip_prefix(PREFIX).unwrap();
        assert!(remainder.trim_start().is_empty());
        let remainder = "/gem   ".strip_prefix(PREFIX).unwrap();
        assert!(remainder.trim_start().is_empty());
    }

    #[test]
    fn truncate_caps_at_char_count() {
        let long = "x".repeat(150);
        assert_eq!(truncate(&long, 100).chars().count(), 100);
    }

    /// Records how many times it was asked to generate, so tests can assert
    /// a call was — or wasn't — made, without touching the network.
    struct FakeGenerator {
        calls: AtomicUsize,
        reply: String,
    }

    impl TextGenerator for FakeGenerator {
        fn generate<'a>(
            &'a self,
            _user_id: &'a str,
            _prompt: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, ProxyError>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.reply.clone();
            Box::pin(async move { Ok(reply) })
        }
    }

    struct FailingGenerator;

    impl TextGenerator for FailingGenerator {
        fn generate<'a>(
            &'a self,
            _user_id: &'a str,
            _prompt: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, ProxyError>> + Send + 'a>> {
            Box::pin(async move {
                Err(ProxyError::GenerationFailed {
                    attempts: 3,
                    source: anyhow::anyhow!("boom"),
                })
            })
        }
    }

    /// S6 — an empty prompt short-circuits to the fixed diagnostic and the
    /// generator is never invoked.
    #[tokio::test]
    async fn empty_prompt_short_circuits_without_calling_generator() {
        let fake = FakeGenerator {
            calls: AtomicUsize::new(0),
            reply: "unused".into(),
        };
        let reply = build_reply("sender", "", Some(&fake)).await;
        assert_eq!(reply, NO_PROMPT_REPLY);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0, "no generator call is made");
    }

    #[tokio::test]
    async fn missing_generator_yields_fixed_diagnostic() {
        let reply = build_reply("sender", "hello", None).await;
        assert_eq!(reply, NO_CREDENTIAL_REPLY);
    }

    /// S5 — a non-empty prompt with a generator present delegates to it and
    /// returns its text verbatim.
    #[tokio::test]
    async fn happy_path_delegates_to_generator() {
        let fake = FakeGenerator {
            calls: AtomicUsize::new(0),
            reply: "a generated reply".into(),
        };
        let reply = build_reply("sender", "hello", Some(&fake)).await;
        assert_eq!(reply, "a generated reply");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn generator_failure_surfaces_as_truncated_ai_error() {
        let reply = build_reply("sender", "hello", Some(&FailingGenerator)).await;
        assert!(reply.starts_with("[AI Error:"), "got: {reply}");
    }
}
