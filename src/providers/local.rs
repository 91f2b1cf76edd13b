//! Local inference server adapter.
//!
//! The local backend streams one JSON object per newline with two fields of
//! interest: `response` (the text delta) and `done`. Conversation structure
//! is flattened into a single prompt string since the native endpoint is
//! completion-shaped rather than chat-shaped. No API key, no thinking
//! channel.

use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt as _;

use crate::sse::{SseSink, StreamEvent};

use super::{line_reader, status_error, streaming_transport, Candidate, Conversation, ProviderError};

pub struct LocalAdapter {
    base_url: String,
}

impl LocalAdapter {
    pub fn new(base_url: String) -> Self {
        Self { base_url }
    }

    pub async fn stream(
        &self,
        candidate: &Candidate,
        conversation: &Conversation,
        sink: &mut SseSink,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/api/generate", self.base_url);
        let response = streaming_transport()
            .post(&url)
            .json(&build_request(candidate, conversation))
            .send()
            .await
            .map_err(ProviderError::Connect)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        sink.send(&StreamEvent::Start {
            display_name: candidate.display_name.clone(),
        })
        .await?;

        let mut lines = line_reader(response).lines();

        loop {
            let next = tokio::select! {
                line = lines.next_line() => line,
                () = sink.closed() => return Err(ProviderError::ClientGone),
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    let _ = sink.send(&StreamEvent::error("stream interrupted")).await;
                    return Err(ProviderError::Stream(err));
                }
            };

            if line.trim().is_empty() {
                continue;
            }
            let Ok(frame) = serde_json::from_str::<Value>(&line) else {
                continue;
            };

            if let Some(text) = frame["response"].as_str().filter(|t| !t.is_empty()) {
                sink.send(&StreamEvent::chunk(text)).await?;
            }
            if frame["done"].as_bool().unwrap_or(false) {
                break;
            }
        }

        sink.send(&StreamEvent::end_now()).await?;
        Ok(())
    }
}

/// Flatten the conversation into the completion-shaped request.
fn build_request(candidate: &Candidate, conversation: &Conversation) -> Value {
    let mut prompt = String::new();
    for (role, text) in conversation.marked_history() {
        prompt.push_str(role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&text);
        prompt.push('\n');
    }
    prompt.push_str(&conversation.marked_prompt());

    json!({
        "model": candidate.provider_model_name,
        "system": conversation.system_text(),
        "prompt": prompt,
        "stream": true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Provider;
    use crate::providers::{HistoryEntry, Role};
    use crate::sse::parse_frame;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn candidate() -> Candidate {
        Candidate {
            model_id: "model-d".into(),
            provider: Provider::Local,
            display_name: "Model D".into(),
            provider_model_name: "small-8b".into(),
            is_thinking_model: false,
        }
    }

    fn conversation() -> Conversation {
        Conversation::new("Be helpful.".into(), None, vec![], "hi".into(), false, 4)
    }

    async fn collect_events(
        adapter: &LocalAdapter,
        conv: &Conversation,
    ) -> (Result<(), ProviderError>, Vec<serde_json::Value>) {
        let (mut sink, mut rx) = SseSink::channel();
        let result = adapter.stream(&candidate(), conv, &mut sink).await;
        drop(sink);
        let mut events = Vec::new();
        while let Some(frame) = rx.recv().await {
            events.push(parse_frame(&frame));
        }
        (result, events)
    }

    #[test]
    fn request_flattens_history_into_the_prompt() {
        let conv = Conversation::new(
            "sys".into(),
            None,
            vec![HistoryEntry {
                role: Role::User,
                content: "earlier".into(),
            }],
            "now".into(),
            false,
            4,
        );
        let body = build_request(&candidate(), &conv);
        let prompt = body["prompt"].as_str().unwrap();
        assert!(prompt.contains("user: [PREVIOUS CONTEXT] earlier"));
        assert!(prompt.ends_with("[CURRENT REQUEST] now"));
        assert_eq!(body["system"], "sys");
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn streams_newline_delimited_json_until_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "{\"response\":\"o\",\"done\":false}\n",
            "{\"response\":\"k\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"),
            )
            .mount(&server)
            .await;

        let adapter = LocalAdapter::new(server.uri());
        let (result, events) = collect_events(&adapter, &conversation()).await;

        assert!(result.is_ok(), "stream failed: {result:?}");
        let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(types, ["start", "chunk", "chunk", "end"]);
        assert_eq!(events[1]["message"], "o");
        assert_eq!(events[2]["message"], "k");
    }

    #[tokio::test]
    async fn garbage_lines_are_skipped() {
        let server = MockServer::start().await;
        let body = "not json at all\n{\"response\":\"ok\",\"done\":true}\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"),
            )
            .mount(&server)
            .await;

        let adapter = LocalAdapter::new(server.uri());
        let (result, events) = collect_events(&adapter, &conversation()).await;

        assert!(result.is_ok());
        assert!(events.iter().any(|e| e["message"] == "ok"));
    }

    #[tokio::test]
    async fn non_2xx_fails_before_any_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such model"))
            .mount(&server)
            .await;

        let adapter = LocalAdapter::new(server.uri());
        let (result, events) = collect_events(&adapter, &conversation()).await;

        assert!(matches!(
            result,
            Err(ProviderError::Status { status, .. }) if status.as_u16() == 404
        ));
        assert!(events.is_empty());
    }
}
