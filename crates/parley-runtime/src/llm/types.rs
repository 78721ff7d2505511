use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker of a [`Content`] entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    System,
    Tool,
}

/// One segment of a content entry. Exactly one variant is active per part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
    /// Raw bytes; base64-encoded when written to a wire format
    InlineData { mime_type: String, data: Vec<u8> },
}

/// Tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Tool output sent back to the model, correlated to its call by `id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    /// Originating function name (the native vendor addresses responses by name)
    #[serde(default)]
    pub name: String,
    pub response: Value,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Part::FunctionCall(call) => Some(call),
            _ => None,
        }
    }
}

/// Conversation entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    pub fn user(text: &str) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn model(text: &str) -> Self {
        Self::new(Role::Model, vec![Part::text(text)])
    }

    /// All function calls carried by this entry, in order
    pub fn function_calls(&self) -> Vec<&FunctionCall> {
        self.parts.iter().filter_map(Part::as_function_call).collect()
    }

    /// Concatenated text of all text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Tool declaration exposed to the model. `parameters` is an opaque JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A group of declarations, as supplied by one tool registry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolGroup {
    pub function_declarations: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    #[default]
    Auto,
    None,
}

/// Config for one generation request. Unset fields take the adapter's vendor defaults.
#[derive(Debug, Clone, Default)]
pub struct GenerationConfig {
    /// Model override (empty = adapter default)
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub system_instruction: Option<String>,
    pub tools: Vec<ToolGroup>,
    pub tool_choice: ToolChoiceMode,
    /// JSON schema for structured output (honored by the native adapter only)
    pub response_schema: Option<Value>,
}

impl GenerationConfig {
    /// Tool declarations flattened across all groups
    pub fn declarations(&self) -> impl Iterator<Item = &ToolDeclaration> {
        self.tools.iter().flat_map(|g| g.function_declarations.iter())
    }

    /// Model to request: the override if set, else the given default
    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        if self.model.is_empty() {
            default
        } else {
            &self.model
        }
    }
}

/// Why the model stopped generating
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    /// Map a vendor finish-reason string (OpenAI-style or native) to the canonical form
    pub fn from_vendor(reason: &str) -> Self {
        match reason {
            "stop" | "STOP" | "end_turn" => FinishReason::Stop,
            "length" | "MAX_TOKENS" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" | "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// Token usage info
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageMetadata {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl std::ops::AddAssign for UsageMetadata {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// Canonical generation response, also used for each element of a stream
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    pub content: Content,
    pub function_calls: Vec<FunctionCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<UsageMetadata>,
    pub model: String,
}

impl GenerateResponse {
    pub fn new(
        parts: Vec<Part>,
        finish_reason: Option<FinishReason>,
        usage: Option<UsageMetadata>,
        model: &str,
    ) -> Self {
        let function_calls = parts
            .iter()
            .filter_map(Part::as_function_call)
            .cloned()
            .collect();
        Self {
            content: Content::new(Role::Model, parts),
            function_calls,
            finish_reason,
            usage,
            model: model.to_string(),
        }
    }

    /// Incremental text-only element of a stream
    pub fn text_delta(text: &str, model: &str) -> Self {
        Self::new(vec![Part::text(text)], None, None, model)
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// Synthesize a function-call id for vendors that omit one: `call_<millis>_<random hex>`
pub fn synthesize_call_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: u64 = rand::thread_rng().gen();
    format!("call_{}_{:x}", millis, suffix)
}

/// Concatenate text across contents the way the approximate token counters see it
pub fn joined_text(contents: &[Content]) -> String {
    contents
        .iter()
        .map(|c| {
            c.parts
                .iter()
                .map(|p| p.as_text().unwrap_or(""))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_synthesized_ids_are_unique_and_prefixed() {
        let a = synthesize_call_id();
        let b = synthesize_call_id();
        assert!(a.starts_with("call_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_response_derives_function_calls_from_parts() {
        let call = FunctionCall {
            id: "call_1".into(),
            name: "read_file".into(),
            args: json!({"path": "a.txt"}),
        };
        let resp = GenerateResponse::new(
            vec![Part::text("Reading."), Part::FunctionCall(call.clone())],
            Some(FinishReason::ToolCalls),
            None,
            "m",
        );
        assert_eq!(resp.function_calls, vec![call]);
        assert_eq!(resp.text(), "Reading.");
        assert_eq!(resp.content.role, Role::Model);
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(FinishReason::from_vendor("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_vendor("STOP"), FinishReason::Stop);
        assert_eq!(FinishReason::from_vendor("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(
            FinishReason::from_vendor("tool_calls"),
            FinishReason::ToolCalls
        );
        assert_eq!(
            FinishReason::from_vendor("weird"),
            FinishReason::Other("weird".into())
        );
    }

    #[test]
    fn test_declarations_flatten_groups() {
        let decl = |name: &str| ToolDeclaration {
            name: name.into(),
            description: String::new(),
            parameters: json!({}),
        };
        let config = GenerationConfig {
            tools: vec![
                ToolGroup {
                    function_declarations: vec![decl("a"), decl("b")],
                },
                ToolGroup {
                    function_declarations: vec![decl("c")],
                },
            ],
            ..Default::default()
        };
        let names: Vec<_> = config.declarations().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_joined_text_skips_non_text_parts() {
        let contents = vec![
            Content::new(
                Role::User,
                vec![
                    Part::text("hello"),
                    Part::InlineData {
                        mime_type: "image/png".into(),
                        data: vec![1, 2],
                    },
                ],
            ),
            Content::model("world"),
        ];
        assert_eq!(joined_text(&contents), "hello  world");
    }

    #[test]
    fn test_part_serde_is_tagged() {
        let json = serde_json::to_value(Part::text("hi")).unwrap();
        assert_eq!(json, json!({"type": "text", "text": "hi"}));
    }
}
