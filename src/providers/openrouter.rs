//! OpenRouter streaming adapter.
//!
//! OpenAI-style SSE with two extras: lines beginning `: OPENROUTER` are
//! keep-alive comments, and reasoning output arrives on a dedicated
//! `choices[0].delta.reasoning` channel alongside the usual
//! `choices[0].delta.content`. The `data: [DONE]` sentinel ends the stream.

use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt as _;

use crate::sse::{SseSink, StreamEvent, THINK_CLOSE, THINK_OPEN};

use super::{line_reader, status_error, streaming_transport, Candidate, Conversation, ProviderError};

pub struct OpenRouterAdapter {
    base_url: String,
    api_key: Option<String>,
}

impl OpenRouterAdapter {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self { base_url, api_key }
    }

    pub async fn stream(
        &self,
        candidate: &Candidate,
        conversation: &Conversation,
        sink: &mut SseSink,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let bracket_thinking = candidate.is_thinking_model && conversation.thinking_allowed;

        let mut request = streaming_transport()
            .post(&url)
            .json(&build_request(candidate, conversation, bracket_thinking));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
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

            // Keep-alive comments (`: OPENROUTER PROCESSING`) and blank lines.
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            if payload.trim() == "[DONE]" {
                break;
            }
            let Ok(frame) = serde_json::from_str::<Value>(payload) else {
                continue;
            };

            let delta = &frame["choices"][0]["delta"];

            if bracket_thinking {
                if let Some(reasoning) = delta["reasoning"].as_str().filter(|r| !r.is_empty()) {
                    if !thinking {
                        sink.send(&StreamEvent::Chunk {
                            text: THINK_OPEN.into(),
                            is_thinking: true,
                        })
                        .await?;
                        thinking = true;
                    }
                    sink.send(&StreamEvent::Chunk {
                        text: reasoning.to_owned(),
                        is_thinking: true,
                    })
                    .await?;
                }
            }

            if let Some(content) = delta["content"].as_str().filter(|c| !c.is_empty()) {
                if thinking {
                    sink.send(&StreamEvent::chunk(THINK_CLOSE)).await?;
                    thinking = false;
                }
                sink.send(&StreamEvent::chunk(content)).await?;
            }
        }

        if thinking {
            sink.send(&StreamEvent::chunk(THINK_CLOSE)).await?;
        }
        sink.send(&StreamEvent::end_now()).await?;
        Ok(())
    }
}

/// Assemble the OpenAI-style request body.
fn build_request(candidate: &Candidate, conversation: &Conversation, reasoning: bool) -> Value {
    let mut messages = vec![json!({
        "role": "system",
        "content": conversation.system_text(),
    })];
    messages.extend(conversation.marked_history().map(|(role, text)| {
        json!({ "role": role.as_str(), "content": text })
    }));
    messages.push(json!({
        "role": "user",
        "content": conversation.marked_prompt(),
    }));

    let mut request = json!({
        "model": candidate.provider_model_name,
        "messages": messages,
        "stream": true,
    });
    if reasoning {
        request["include_reasoning"] = json!(true);
    }
    request
}
