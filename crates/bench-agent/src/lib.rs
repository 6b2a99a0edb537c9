//! Bounded tool-use conversation loop against an opaque model service.

mod tools;

pub use tools::{
    PythonExpressionTool, SubmitAnswerTool, ToolHandler, ToolOutcome, ToolRegistry,
    PYTHON_EXPRESSION_TOOL, SUBMIT_ANSWER_TOOL,
};

use bench_model::{
    ContentBlock, Message, MessagesRequest, ModelClient, ModelError, StopReason, Usage,
};
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub max_tokens: u32,
    pub max_steps: usize,
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-haiku-4-5".to_string(),
            max_tokens: 4000,
            max_steps: 15,
            verbose: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("model reported an unsupported stop reason")]
    UnsupportedStopReason,
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Runs one bounded multi-turn exchange: model call, tool dispatch, result
/// injection, until an answer is submitted or the step budget runs out.
pub struct ConversationEngine<C: ModelClient> {
    client: C,
    config: AgentConfig,
}

impl<C: ModelClient> ConversationEngine<C> {
    pub fn new(client: C, config: AgentConfig) -> Self {
        Self { client, config }
    }

    /// Returns the submitted answer, or `None` when the model finished
    /// without submitting (no tool use in a turn, or steps exhausted).
    pub async fn run(
        &self,
        prompt: &str,
        registry: &ToolRegistry,
    ) -> Result<Option<Value>, AgentError> {
        let specs = registry.specs();
        let mut messages = vec![Message::user_text(prompt)];
        let mut totals = Usage::default();

        for step in 1..=self.config.max_steps {
            info!(step, max_steps = self.config.max_steps, "model turn");
            let request = MessagesRequest {
                model: self.config.model.clone(),
                max_tokens: self.config.max_tokens,
                messages: messages.clone(),
                tools: specs.clone(),
            };
            let response = self.client.complete(&request).await?;
            totals.add(response.usage);
            info!(
                input_tokens = response.usage.input_tokens,
                output_tokens = response.usage.output_tokens,
                total_input = totals.input_tokens,
                total_output = totals.output_tokens,
                "token usage"
            );

            match response.stop_reason {
                StopReason::Unknown => return Err(AgentError::UnsupportedStopReason),
                StopReason::MaxTokens => warn!(
                    max_tokens = self.config.max_tokens,
                    "model hit the output token limit; raise --max-tokens if truncation persists"
                ),
                StopReason::EndTurn | StopReason::ToolUse => {}
            }

            let mut results: Vec<(String, String)> = Vec::new();
            let mut submitted: Option<Value> = None;
            let mut saw_invocation = false;
            for block in &response.content {
                match block {
                    ContentBlock::Text { text } => {
                        if self.config.verbose {
                            info!(assistant = %text);
                        } else {
                            debug!(assistant = %text);
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        saw_invocation = true;
                        let Some(handler) = registry.get(name) else {
                            // Graceful degradation: no handler, no result.
                            debug!(tool = %name, "unregistered tool invocation dropped");
                            continue;
                        };
                        debug!(tool = %name, invocation = %id, "dispatching tool");
                        match handler.invoke(input) {
                            ToolOutcome::Reply(value) => results.push((id.clone(), value.to_string())),
                            ToolOutcome::Submit { answer, receipt } => {
                                results.push((id.clone(), receipt.to_string()));
                                submitted = Some(answer);
                            }
                        }
                    }
                    // The model never sends tool results; tolerate and skip.
                    ContentBlock::ToolResult { .. } => {}
                }
            }

            if !saw_invocation {
                info!("no tool invocation in turn; ending without a submission");
                return Ok(None);
            }

            messages.push(Message::assistant(response.content));
            messages.push(Message::tool_results(results));

            if let Some(answer) = submitted {
                info!("answer submitted");
                return Ok(Some(answer));
            }
        }

        info!(
            max_steps = self.config.max_steps,
            "step budget exhausted without a submission"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_model::{MessagesResponse, ToolSpec};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedClient {
        responses: Mutex<Vec<MessagesResponse>>,
        requests_seen: Mutex<Vec<MessagesRequest>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<MessagesResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
                requests_seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ModelClient for ScriptedClient {
        async fn complete(
            &self,
            request: &MessagesRequest,
        ) -> Result<MessagesResponse, ModelError> {
            self.requests_seen
                .lock()
                .expect("request log lock poisoned")
                .push(request.clone());
            let mut responses = self.responses.lock().expect("response lock poisoned");
            if responses.is_empty() {
                return Err(ModelError::Api {
                    status: 500,
                    body: "script exhausted".to_string(),
                });
            }
            Ok(responses.remove(0))
        }
    }

    fn response(content: Vec<ContentBlock>, stop_reason: StopReason) -> MessagesResponse {
        MessagesResponse {
            content,
            stop_reason,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }
    }

    fn submit_block(id: &str, answer: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: SUBMIT_ANSWER_TOOL.to_string(),
            input: json!({"answer": answer}),
        }
    }

    fn engine(client: ScriptedClient) -> ConversationEngine<ScriptedClient> {
        ConversationEngine::new(client, AgentConfig::default())
    }

    #[tokio::test]
    async fn submit_terminates_with_answer() {
        let client = ScriptedClient::new(vec![response(
            vec![
                ContentBlock::Text {
                    text: "done".to_string(),
                },
                submit_block("toolu_1", "fixed"),
            ],
            StopReason::ToolUse,
        )]);
        let engine = engine(client);
        let answer = engine
            .run("fix it", &ToolRegistry::default())
            .await
            .expect("run should succeed");
        assert_eq!(answer, Some(json!("fixed")));
    }

    #[tokio::test]
    async fn turn_without_tool_use_ends_with_no_answer() {
        let client = ScriptedClient::new(vec![response(
            vec![ContentBlock::Text {
                text: "I think we're done".to_string(),
            }],
            StopReason::EndTurn,
        )]);
        let answer = engine(client)
            .run("fix it", &ToolRegistry::default())
            .await
            .expect("run should succeed");
        assert_eq!(answer, None);
    }

    #[tokio::test]
    async fn step_budget_exhaustion_yields_no_answer() {
        // Every turn calls an unregistered tool, so the loop keeps going
        // until the budget runs out.
        let looping = || {
            response(
                vec![ContentBlock::ToolUse {
                    id: "toolu_x".to_string(),
                    name: "mystery_tool".to_string(),
                    input: json!({}),
                }],
                StopReason::ToolUse,
            )
        };
        let client = ScriptedClient::new((0..3).map(|_| looping()).collect());
        let config = AgentConfig {
            max_steps: 3,
            ..AgentConfig::default()
        };
        let engine = ConversationEngine::new(client, config);
        let answer = engine
            .run("fix it", &ToolRegistry::default())
            .await
            .expect("run should succeed");
        assert_eq!(answer, None);
    }

    #[tokio::test]
    async fn unregistered_tool_is_dropped_but_conversation_continues() {
        let client = ScriptedClient::new(vec![
            response(
                vec![ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "mystery_tool".to_string(),
                    input: json!({}),
                }],
                StopReason::ToolUse,
            ),
            response(vec![submit_block("toolu_2", "answer")], StopReason::ToolUse),
        ]);
        let engine = engine(client);
        let answer = engine
            .run("fix it", &ToolRegistry::default())
            .await
            .expect("run should succeed");
        assert_eq!(answer, Some(json!("answer")));

        // The dropped invocation produced no tool result in the follow-up
        // user turn.
        let requests = engine.client.requests_seen.lock().expect("lock");
        let second = &requests[1];
        let last_turn = second.messages.last().expect("follow-up user turn");
        assert!(last_turn.content.is_empty());
    }

    #[tokio::test]
    async fn tool_results_echo_invocation_ids_before_submit_returns() {
        let client = ScriptedClient::new(vec![
            response(
                vec![ContentBlock::ToolUse {
                    id: "toolu_a".to_string(),
                    name: SUBMIT_ANSWER_TOOL.to_string(),
                    input: json!({"answer": 42}),
                }],
                StopReason::ToolUse,
            ),
        ]);
        let engine = engine(client);
        let answer = engine
            .run("fix it", &ToolRegistry::default())
            .await
            .expect("run should succeed");
        assert_eq!(answer, Some(json!(42)));
    }

    #[tokio::test]
    async fn unsupported_stop_reason_is_fatal_to_the_trial() {
        let client = ScriptedClient::new(vec![response(vec![], StopReason::Unknown)]);
        let err = engine(client)
            .run("fix it", &ToolRegistry::default())
            .await
            .expect_err("unknown stop reason should fail");
        assert!(matches!(err, AgentError::UnsupportedStopReason));
    }

    #[tokio::test]
    async fn max_tokens_response_is_processed_not_aborted() {
        // Truncated turn still carries a usable submit invocation.
        let client = ScriptedClient::new(vec![response(
            vec![submit_block("toolu_1", "partial but present")],
            StopReason::MaxTokens,
        )]);
        let answer = engine(client)
            .run("fix it", &ToolRegistry::default())
            .await
            .expect("run should succeed");
        assert_eq!(answer, Some(json!("partial but present")));
    }

    #[tokio::test]
    async fn expression_tool_round_trip_feeds_result_to_next_turn() {
        if !bench_core::python_available() {
            return;
        }
        let client = ScriptedClient::new(vec![
            response(
                vec![ContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: PYTHON_EXPRESSION_TOOL.to_string(),
                    input: json!({"expression": "print(6 * 7)"}),
                }],
                StopReason::ToolUse,
            ),
            response(vec![submit_block("toolu_2", "42")], StopReason::ToolUse),
        ]);
        let registry = ToolRegistry::standard(Duration::from_secs(10));
        let engine = engine(client);
        let answer = engine
            .run("compute", &registry)
            .await
            .expect("run should succeed");
        assert_eq!(answer, Some(json!("42")));

        let requests = engine.client.requests_seen.lock().expect("lock");
        let follow_up = requests[1].messages.last().expect("user turn with results");
        match &follow_up.content[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                assert_eq!(tool_use_id, "toolu_1");
                assert!(content.contains("42"));
            }
            other => panic!("expected tool result, got {:?}", other),
        }
    }
}
