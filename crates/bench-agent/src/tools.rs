use bench_core::run_python;
use bench_model::ToolSpec;
use serde_json::{json, Value};
use std::time::Duration;

pub const PYTHON_EXPRESSION_TOOL: &str = "python_expression";
pub const SUBMIT_ANSWER_TOOL: &str = "submit_answer";

/// What a tool handler hands back to the conversation engine.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// Serialized into a tool result for the next model turn.
    Reply(Value),
    /// Terminal: the trial ends with `answer`; `receipt` is still attached
    /// to the conversation as the invocation's tool result.
    Submit { answer: Value, receipt: Value },
}

/// Handlers are synchronous and never fail at this boundary: a faulty tool
/// input or tool execution becomes a structured error reply for the model.
pub trait ToolHandler: Send + Sync {
    fn spec(&self) -> ToolSpec;
    fn invoke(&self, input: &Value) -> ToolOutcome;
}

/// Evaluates arbitrary program text in a captured-stream subprocess.
/// Must never crash the loop: every fault comes back as
/// `{"result": null, "error": ...}`.
pub struct PythonExpressionTool {
    timeout: Duration,
}

impl PythonExpressionTool {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ToolHandler for PythonExpressionTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: PYTHON_EXPRESSION_TOOL.to_string(),
            description: "Evaluates a Python expression".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "expression": {
                        "type": "string",
                        "description": "Executed as a Python program. Use print() to \
                                        emit output; stdout is captured and returned.",
                    }
                },
                "required": ["expression"],
            }),
        }
    }

    fn invoke(&self, input: &Value) -> ToolOutcome {
        let Some(expression) = input.get("expression").and_then(Value::as_str) else {
            return ToolOutcome::Reply(json!({
                "result": null,
                "error": "missing required parameter: expression",
            }));
        };
        match run_python(expression, self.timeout) {
            Ok(out) if out.timed_out => ToolOutcome::Reply(json!({
                "result": null,
                "error": format!("execution exceeded the {}s limit", self.timeout.as_secs()),
            })),
            Ok(out) if out.success() => ToolOutcome::Reply(json!({
                "result": out.stdout,
                "error": null,
            })),
            Ok(out) => ToolOutcome::Reply(json!({
                "result": null,
                "error": out.stderr.trim(),
            })),
            Err(e) => ToolOutcome::Reply(json!({
                "result": null,
                "error": e.to_string(),
            })),
        }
    }
}

/// Terminal tool: hands the submitted value straight back.
pub struct SubmitAnswerTool;

impl ToolHandler for SubmitAnswerTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: SUBMIT_ANSWER_TOOL.to_string(),
            description: "Submit the final answer".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "answer": {"description": "The final answer to submit"}
                },
                "required": ["answer"],
            }),
        }
    }

    fn invoke(&self, input: &Value) -> ToolOutcome {
        let answer = input.get("answer").cloned().unwrap_or(Value::Null);
        let receipt = json!({"answer": answer, "submitted": true});
        ToolOutcome::Submit { answer, receipt }
    }
}

/// Ordered name-to-handler map; specs are offered to the model in
/// registration order.
pub struct ToolRegistry {
    handlers: Vec<Box<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// The fixed two-tool set every trial runs with.
    pub fn standard(expression_timeout: Duration) -> Self {
        Self::new()
            .with(Box::new(PythonExpressionTool::new(expression_timeout)))
            .with(Box::new(SubmitAnswerTool))
    }

    pub fn with(mut self, handler: Box<dyn ToolHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.handlers.iter().map(|h| h.spec()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolHandler> {
        self.handlers
            .iter()
            .find(|h| h.spec().name == name)
            .map(|h| h.as_ref())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::standard(Duration::from_secs(30))
    }
}
