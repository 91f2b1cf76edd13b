//! Groq streaming adapter.
//!
//! Plain OpenAI-style SSE: `data: ` frames with text deltas at
//! `choices[0].delta.content` and a `data: [DONE]` sentinel. Groq exposes no
//! reasoning channel, so this adapter never emits thinking brackets.

use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt as _;

use crate::sse::{SseSink, StreamEvent};

use super::{line_reader, status_error, streaming_transport, Candidate, Conversation, ProviderError};

pub struct GroqAdapter {
    base_url: String,
    api_key: Option<String>,
}

impl GroqAdapter {
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
        let mut request = streaming_transport()
            .post(&url)
            .json(&build_request(candidate, conversation));
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

            if let Some(content) = frame["choices"][0]["delta"]["content"]
                .as_str()
                .filter(|c| !c.is_empty())
            {
                sink.send(&StreamEvent::chunk(content)).await?;
            }
        }

        sink.send(&StreamEvent::end_now()).await?;
        Ok(())
    }
}

fn build_request(candidate: &Candidate, conversation: &Conversation) -> Value {
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

    json!({
        "model": candidate.provider_model_name,
        "messages": messages,
        "stream": true,
    })
}
