//! Gemini streaming adapter.
//!
//! Speaks the `:streamGenerateContent?alt=sse` dialect: SSE frames prefixed
//! `data: `, text deltas at `candidates[0].content.parts[].text`, a part
//! with `thought: true` marking reasoning output, and `finishReason`
//! terminating the stream. Conversation roles map to `user` / `model`.

use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt as _;

use crate::sse::{SseSink, StreamEvent, THINK_CLOSE, THINK_OPEN};

use super::{
    line_reader, status_error, streaming_transport, Candidate, Conversation, ProviderError, Role,
};

pub struct GeminiAdapter {
    base_url: String,
    api_key: Option<String>,
}

impl GeminiAdapter {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self { base_url, api_key }
    }

    pub async fn stream(
        &self,
        candidate: &Candidate,
        conversation: &Conversation,
        sink: &mut SseSink,
    ) -> Result<(), ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, candidate.provider_model_name
        );

        let bracket_thinking = candidate.is_thinking_model && conversation.thinking_allowed;
        let mut request = streaming_transport()
            .post(&url)
            .json(&build_request(conversation, bracket_thinking));
        if let Some(key) = &self.api_key {
            request = request.header("x-goog-api-key", key);
        }

        let response = request.send().await.map_err(ProviderError::Connect)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        sink.send(&StreamEvent::Start {
            display_name: candidate.display_name.clone(),
        })
        .await?;

        let mut lines = line_reader(response).lines();
        let mut thinking = false;
        let mut finished = false;

        while !finished {
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

            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            // Malformed frames are skipped, never fatal.
            let Ok(frame) = serde_json::from_str::<Value>(payload) else {
                continue;
            };

            if let Some(parts) = frame
                .pointer("/candidates/0/content/parts")
                .and_then(Value::as_array)
            {
                for part in parts {
                    let is_thought = part["thought"].as_bool().unwrap_or(false);
                    let Some(text) = part["text"].as_str().filter(|t| !t.is_empty()) else {
                        continue;
                    };

                    if is_thought && !bracket_thinking {
                        // Reasoning output the caller may not see.
                        continue;
                    }
                    if is_thought && !thinking {
                        sink.send(&StreamEvent::Chunk {
                            text: THINK_OPEN.into(),
                            is_thinking: true,
                        })
                        .await?;
                        thinking = true;
                    } else if !is_thought && thinking {
                        sink.send(&StreamEvent::chunk(THINK_CLOSE)).await?;
                        thinking = false;
                    }

                    sink.send(&StreamEvent::Chunk {
                        text: text.to_owned(),
                        is_thinking: thinking,
                    })
                    .await?;
                }
            }

            if frame.pointer("/candidates/0/finishReason").is_some() {
                finished = true;
            }
        }

        if thinking {
            sink.send(&StreamEvent::chunk(THINK_CLOSE)).await?;
        }
        sink.send(&StreamEvent::end_now()).await?;
        Ok(())
    }
}

/// Assemble the provider-native request body.
fn build_request(conversation: &Conversation, include_thoughts: bool) -> Value {
    let mut contents: Vec<Value> = conversation
        .marked_history()
        .map(|(role, text)| {
            json!({
                "role": match role { Role::User => "user", Role::Assistant => "model" },
                "parts": [{ "text": text }],
            })
        })
        .collect();
    contents.push(json!({
        "role": "user",
        "parts": [{ "text": conversation.marked_prompt() }],
    }));

    let mut request = json!({
        "systemInstruction": { "parts": [{ "text": conversation.system_text() }] },
        "contents": contents,
    });
    if include_thoughts {
        request["generationConfig"] = json!({ "thinkingConfig": { "includeThoughts": true } });
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Provider;
    use crate::sse::parse_frame;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn candidate(thinking: bool) -> Candidate {
        Candidate {
            model_id: "model-a".into(),
            provider: Provider::Gemini,
            display_name: "Model A*".into(),
            provider_model_name: "model-a-001".into(),
            is_thinking_model: thinking,
        }
    }

    fn conversation(thinking_allowed: bool) -> Conversation {
        Conversation::new(
            "Be helpful.".into(),
            None,
            vec![],
            "hi".into(),
            thinking_allowed,
            4,
        )
    }

    async fn collect_events(
        adapter: &GeminiAdapter,
        cand: &Candidate,
        conv: &Conversation,
    ) -> (Result<(), ProviderError>, Vec<serde_json::Value>) {
        let (mut sink, mut rx) = SseSink::channel();
        let result = adapter.stream(cand, conv, &mut sink).await;
        drop(sink);
        let mut events = Vec::new();
        while let Some(frame) = rx.recv().await {
            events.push(parse_frame(&frame));
        }
        (result, events)
    }

    // -----------------------------------------------------------------------
    // Request shape
    // -----------------------------------------------------------------------

    #[test]
    fn request_maps_assistant_role_to_model() {
        let conv = Conversation::new(
            "sys".into(),
            None,
            vec![super::super::HistoryEntry {
                role: Role::Assistant,
                content: "earlier answer".into(),
            }],
            "next".into(),
            false,
            4,
        );
        let body = build_request(&conv, false);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], "model");
        assert_eq!(contents.last().unwrap()["role"], "user");
    }

    #[test]
    fn request_carries_system_instruction() {
        let body = build_request(&conversation(false), false);
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "Be helpful."
        );
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn thinking_request_asks_for_thoughts() {
        let body = build_request(&conversation(true), true);
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["includeThoughts"],
            true
        );
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    fn sse_body(frames: &[serde_json::Value]) -> String {
        frames
            .iter()
            .map(|f| format!("data: {f}\n\n"))
            .collect::<String>()
    }

    fn text_frame(text: &str) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        })
    }

    #[tokio::test]
    async fn streams_start_chunks_end() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            text_frame("he"),
            text_frame("llo"),
            serde_json::json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "!" }] },
                    "finishReason": "STOP",
                }]
            }),
        ]);
        Mock::given(method("POST"))
            .and(path("/v1beta/models/model-a-001:streamGenerateContent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter = GeminiAdapter::new(server.uri(), None);
        let (result, events) =
            collect_events(&adapter, &candidate(false), &conversation(false)).await;

        assert!(result.is_ok(), "stream failed: {result:?}");
        let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(types, ["start", "chunk", "chunk", "chunk", "end"]);
        assert_eq!(events[0]["model"], "Model A*");
        assert_eq!(events[1]["message"], "he");
        assert_eq!(events[3]["message"], "!");
    }

    #[tokio::test]
    async fn thinking_parts_are_bracketed() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            serde_json::json!({
                "candidates": [{ "content": { "parts": [
                    { "text": "pondering…", "thought": true },
                ] } }]
            }),
            text_frame("answer"),
        ]);
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter = GeminiAdapter::new(server.uri(), None);
        let (result, events) =
            collect_events(&adapter, &candidate(true), &conversation(true)).await;

        assert!(result.is_ok());
        let messages: Vec<&str> = events
            .iter()
            .filter(|e| e["type"] == "chunk")
            .map(|e| e["message"].as_str().unwrap())
            .collect();
        assert_eq!(messages, [THINK_OPEN, "pondering…", THINK_CLOSE, "answer"]);
    }

    #[tokio::test]
    async fn thought_text_is_dropped_for_non_thinking_models() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            serde_json::json!({
                "candidates": [{ "content": { "parts": [
                    { "text": "hidden reasoning", "thought": true },
                ] } }]
            }),
            text_frame("visible"),
        ]);
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter = GeminiAdapter::new(server.uri(), None);
        let (result, events) =
            collect_events(&adapter, &candidate(false), &conversation(false)).await;

        assert!(result.is_ok());
        let messages: Vec<&str> = events
            .iter()
            .filter(|e| e["type"] == "chunk")
            .map(|e| e["message"].as_str().unwrap())
            .collect();
        assert_eq!(messages, ["visible"]);
    }

    #[tokio::test]
    async fn invalid_json_frames_are_skipped() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {{not json\n\n{}",
            sse_body(&[text_frame("ok")])
        );
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter = GeminiAdapter::new(server.uri(), None);
        let (result, events) =
            collect_events(&adapter, &candidate(false), &conversation(false)).await;

        assert!(result.is_ok());
        assert!(events.iter().any(|e| e["message"] == "ok"));
    }

    #[tokio::test]
    async fn non_2xx_fails_before_any_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let adapter = GeminiAdapter::new(server.uri(), None);
        let (result, events) =
            collect_events(&adapter, &candidate(false), &conversation(false)).await;

        assert!(matches!(
            result,
            Err(ProviderError::Status { status, .. }) if status.as_u16() == 503
        ));
        assert!(events.is_empty(), "no event may precede the status check");
    }
}
