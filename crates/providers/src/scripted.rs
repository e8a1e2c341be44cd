//! Deterministic model provider driven by a script of rounds. No HTTP.

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use ollama_agent_core::types::ToolCallRequest;
use ollama_agent_core::{Error, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{ModelChunk, ModelRequest, ModelStream, Provider};

/// One scripted step of a model round.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(ModelChunk),
    /// Mid-stream failure.
    Fail(String),
    Delay(Duration),
    /// Never produce anything else.
    Hang,
}

/// One call to `stream_chat`.
#[derive(Debug, Clone)]
pub enum ScriptRound {
    Steps(Vec<ScriptStep>),
    /// `stream_chat` itself fails.
    Refuse(String),
}

impl ScriptRound {
    /// Text deltas followed by `Done`.
    pub fn text(parts: &[&str]) -> Self {
        let mut steps: Vec<ScriptStep> = parts
            .iter()
            .map(|p| ScriptStep::Chunk(ModelChunk::TextDelta(p.to_string())))
            .collect();
        steps.push(ScriptStep::Chunk(ModelChunk::Done {
            finish_reason: "stop".to_string(),
        }));
        ScriptRound::Steps(steps)
    }

    /// A single tool call followed by `Done`.
    pub fn tool_call(id: &str, name: &str, arguments: Value) -> Self {
        ScriptRound::Steps(vec![
            ScriptStep::Chunk(ModelChunk::ToolCall(ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments,
            })),
            ScriptStep::Chunk(ModelChunk::Done {
                finish_reason: "tool_calls".to_string(),
            }),
        ])
    }

    pub fn steps(steps: Vec<ScriptStep>) -> Self {
        ScriptRound::Steps(steps)
    }
}

/// Replays one [`ScriptRound`] per `stream_chat` call and records every
/// request it receives.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    rounds: Arc<Mutex<VecDeque<ScriptRound>>>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_round(self, round: ScriptRound) -> Self {
        self.push_round(round);
        self
    }

    pub fn push_round(&self, round: ScriptRound) {
        if let Ok(mut rounds) = self.rounds.lock() {
            rounds.push_back(round);
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining_rounds(&self) -> usize {
        self.rounds.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(&self, request: ModelRequest) -> Result<ModelStream> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let round = self.rounds.lock().ok().and_then(|mut r| r.pop_front());
        let steps = match round {
            Some(ScriptRound::Steps(steps)) => steps,
            Some(ScriptRound::Refuse(message)) => return Err(Error::ModelStream(message)),
            None => return Err(Error::ModelStream("script exhausted".to_string())),
        };

        let stream = stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    ScriptStep::Chunk(chunk) => return Some((Ok(chunk), steps)),
                    ScriptStep::Fail(message) => {
                        return Some((Err(Error::ModelStream(message)), Vec::new().into_iter()))
                    }
                    ScriptStep::Delay(d) => tokio::time::sleep(d).await,
                    ScriptStep::Hang => futures::future::pending::<()>().await,
                }
            }
        });
        Ok(stream.boxed())
    }
}
