use anyhow::Context;
use async_trait::async_trait;
use clawdeploy_agent_report::{AgentEvent, REPORT_TOOL_NAME};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Serialize;

pub type AgentEventStream = BoxStream<'static, anyhow::Result<AgentEvent>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunRequest {
    pub prompt: String,
    pub max_turns: u32,
    pub report_tool: String,
}

impl AgentRunRequest {
    pub fn new(prompt: impl Into<String>, max_turns: u32) -> Self {
        Self {
            prompt: prompt.into(),
            max_turns,
            report_tool: REPORT_TOOL_NAME.to_string(),
        }
    }
}

/// The external agent driven by the heartbeat supervisor. A run is a stream
/// of events; dropping the stream abandons the run.
#[async_trait]
pub trait DecisionAgent: Send + Sync {
    async fn start_run(&self, request: &AgentRunRequest) -> anyhow::Result<AgentEventStream>;
}

/// Talks to an agent service that answers `POST /runs` with NDJSON events.
#[derive(Debug)]
pub struct HttpDecisionAgent {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpDecisionAgent {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> anyhow::Result<Self> {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            anyhow::bail!("decision agent URL cannot be empty");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            api_token,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl DecisionAgent for HttpDecisionAgent {
    async fn start_run(&self, request: &AgentRunRequest) -> anyhow::Result<AgentEventStream> {
        let url = format!("{}/runs", self.base_url);
        let resp = self
            .request(self.client.post(url))
            .json(request)
            .send()
            .await
            .context("send decision agent run request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status == StatusCode::NOT_FOUND {
                anyhow::bail!("start agent run failed: {status} (not found)");
            }
            if body.is_empty() {
                anyhow::bail!("start agent run failed: {status}");
            }
            anyhow::bail!("start agent run failed: {status} {body}");
        }

        Ok(ndjson_events(resp))
    }
}

struct NdjsonState {
    resp: Option<reqwest::Response>,
    buf: Vec<u8>,
}

fn ndjson_events(resp: reqwest::Response) -> AgentEventStream {
    let state = NdjsonState {
        resp: Some(resp),
        buf: Vec::new(),
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((parse_event_line(&line), state));
            }

            let resp = state.resp.as_mut()?;
            let next = resp.chunk().await;
            match next {
                Ok(Some(bytes)) => state.buf.extend_from_slice(&bytes),
                Ok(None) => {
                    state.resp = None;
                    let rest = std::mem::take(&mut state.buf);
                    if rest.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    return Some((parse_event_line(&rest), state));
                }
                Err(e) => {
                    state.resp = None;
                    state.buf.clear();
                    return Some((Err(anyhow::Error::new(e).context("read agent event stream")), state));
                }
            }
        }
    })
    .boxed()
}

pub fn parse_event_line(line: &[u8]) -> anyhow::Result<AgentEvent> {
    let line = String::from_utf8_lossy(line);
    serde_json::from_str(line.trim()).with_context(|| format!("decode agent event {:?}", line.trim()))
}
