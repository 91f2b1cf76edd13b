//! Provider adapter factory and the unified streaming interface.
//!
//! [`ProviderClient`] is an enum that wraps a concrete streaming adapter
//! chosen at construction time from [`Provider`]. The fallback orchestrator
//! interacts with one method, [`ProviderClient::stream`], while dialect
//! differences (request schema, auth headers, frame format, thinking
//! channels) stay fully encapsulated in the adapter modules.
//!
//! # Common adapter contract
//!
//! 1. Build the provider-native request from the [`Conversation`].
//! 2. Open the connection on the tuned streaming transport.
//! 3. Non-2xx response → return [`ProviderError::Status`] **before** emitting
//!    `start`; the orchestrator may then try the next candidate.
//! 4. On 2xx emit `start`, parse frames line-by-line, normalize text deltas
//!    to `chunk` events, bracketing thinking segments with the
//!    [`THINK_OPEN`]/[`THINK_CLOSE`](crate::sse::THINK_CLOSE) sentinels.
//! 5. On stream end emit `end`.
//! 6. On a mid-stream failure emit `error` and return the failure; with bytes
//!    already on the wire the orchestrator must not retry.
//!
//! All adapters skip unparseable frames instead of aborting the stream.

mod gemini;
mod groq;
mod local;
mod openrouter;

pub use gemini::GeminiAdapter;
pub use groq::GroqAdapter;
pub use local::LocalAdapter;
pub use openrouter::OpenRouterAdapter;

use std::{sync::OnceLock, time::Duration};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::io::StreamReader;

use crate::{
    config::{Provider, ProviderConfig},
    sse::{SseSink, THINK_OPEN},
};

/// Minimum scan-buffer size for line-by-line frame parsing.
const SCAN_BUFFER_CAPACITY: usize = 64 * 1024;

/// Response-header / inter-chunk read budget. There is deliberately no
/// overall request timeout, since streams may legitimately run for minutes.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// One ranked model selection produced by the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub model_id: String,
    pub provider: Provider,
    pub display_name: String,
    /// Model name in the provider's own namespace.
    pub provider_model_name: String,
    pub is_thinking_model: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// Marker prepended to each forwarded history entry.
pub const HISTORY_PREFIX: &str = "[PREVIOUS CONTEXT]";
/// Marker prepended to the live prompt when history is present.
pub const CURRENT_PREFIX: &str = "[CURRENT REQUEST]";

/// The normalized conversation payload handed to every adapter.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub system_prompt: String,
    pub profile_context: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub current_prompt: String,
    pub thinking_allowed: bool,
}

impl Conversation {
    /// Normalize raw inputs: drop history entries carrying thinking-marker
    /// sentinels, then keep only the last `history_limit` entries.
    pub fn new(
        system_prompt: String,
        profile_context: Option<String>,
        history: Vec<HistoryEntry>,
        current_prompt: String,
        thinking_allowed: bool,
        history_limit: usize,
    ) -> Self {
        let mut history: Vec<HistoryEntry> = history
            .into_iter()
            .filter(|entry| !entry.content.contains(THINK_OPEN))
            .collect();
        if history.len() > history_limit {
            history.drain(..history.len() - history_limit);
        }
        Self {
            system_prompt,
            profile_context: profile_context.filter(|c| !c.trim().is_empty()),
            history,
            current_prompt,
            thinking_allowed,
        }
    }

    /// System text: global prompt plus profile context, joined with explicit
    /// guidance so models treat the context as background rather than a task.
    pub fn system_text(&self) -> String {
        match &self.profile_context {
            Some(context) => format!(
                "{}\n\nThe user has shared the following background about \
                 themselves. Use it to tailor your answers; do not repeat it \
                 back unprompted.\n{}",
                self.system_prompt, context
            ),
            None => self.system_prompt.clone(),
        }
    }

    /// History entries with the context marker applied.
    pub fn marked_history(&self) -> impl Iterator<Item = (Role, String)> + '_ {
        self.history
            .iter()
            .map(|entry| (entry.role, format!("{HISTORY_PREFIX} {}", entry.content)))
    }

    /// The live prompt, marked when history accompanies it.
    pub fn marked_prompt(&self) -> String {
        if self.history.is_empty() {
            self.current_prompt.clone()
        } else {
            format!("{CURRENT_PREFIX} {}", self.current_prompt)
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider answered with a non-2xx status before any stream bytes.
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    /// The connection could not be established or the request failed to send.
    #[error("provider request failed: {0}")]
    Connect(#[source] reqwest::Error),
    /// The stream broke after it had started.
    #[error("provider stream failed: {0}")]
    Stream(#[source] std::io::Error),
    /// The client hung up; there is nobody left to write to.
    #[error("client disconnected")]
    ClientGone,
}

impl From<crate::sse::SinkClosed> for ProviderError {
    fn from(_: crate::sse::SinkClosed) -> Self {
        Self::ClientGone
    }
}

/// Unified provider client — enum dispatch over the closed adapter set.
pub enum ProviderClient {
    Gemini(GeminiAdapter),
    OpenRouter(OpenRouterAdapter),
    Groq(GroqAdapter),
    Local(LocalAdapter),
}

impl ProviderClient {
    /// Build the adapter for `provider`, resolving its API key from the
    /// environment variable named in the config.
    pub fn new(provider: Provider, cfg: &ProviderConfig) -> Self {
        let base_url = cfg.base_url.trim_end_matches('/').to_owned();
        let api_key = cfg.api_key();
        match provider {
            Provider::Gemini => Self::Gemini(GeminiAdapter::new(base_url, api_key)),
            Provider::OpenRouter => Self::OpenRouter(OpenRouterAdapter::new(base_url, api_key)),
            Provider::Groq => Self::Groq(GroqAdapter::new(base_url, api_key)),
            Provider::Local => Self::Local(LocalAdapter::new(base_url)),
        }
    }

    /// Stream one completion into `sink` following the common contract.
    pub async fn stream(
        &self,
        candidate: &Candidate,
        conversation: &Conversation,
        sink: &mut SseSink,
    ) -> Result<(), ProviderError> {
        match self {
            Self::Gemini(a) => a.stream(candidate, conversation, sink).await,
            Self::OpenRouter(a) => a.stream(candidate, conversation, sink).await,
            Self::Groq(a) => a.stream(candidate, conversation, sink).await,
            Self::Local(a) => a.stream(candidate, conversation, sink).await,
        }
    }
}

/// Process-wide tuned transport shared by the streaming adapters.
///
/// Keep-alive on, no response compression, no overall timeout; the
/// response-header budget is enforced through the read timeout.
pub(crate) fn streaming_transport() -> &'static reqwest::Client {
    static TRANSPORT: OnceLock<reqwest::Client> = OnceLock::new();
    TRANSPORT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(READ_TIMEOUT)
            .tcp_keepalive(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("failed to build streaming transport")
    })
}

/// Turn a streaming response body into a buffered line reader with the
/// minimum scan capacity the frame parsers require.
pub(crate) fn line_reader(response: reqwest::Response) -> impl AsyncBufRead + Unpin {
    use futures_util::TryStreamExt as _;

    let byte_stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
    BufReader::with_capacity(SCAN_BUFFER_CAPACITY, StreamReader::new(byte_stream))
}

/// Drain the response body for a non-2xx status into a [`ProviderError`].
pub(crate) async fn status_error(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ProviderError::Status { status, body }
}
