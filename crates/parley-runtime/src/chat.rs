//! Turn orchestration over one session: bounded auto-continuation, history
//! compression, model fallback and the JSON/embedding side requests.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::llm::error::GenerationError;
use crate::llm::models::token_limit;
use crate::llm::provider::LLMProvider;
use crate::llm::retry::{retry_with_backoff, FallbackHandler, ModelFallback, RetryPolicy};
use crate::llm::types::*;
use crate::session::Session;

/// User message sent when the model is expected to keep going
pub const CONTINUATION_PROMPT: &str = "Please continue.";

const COMPRESSION_PROMPT: &str = "Summarize our conversation so far. The summary should be a concise \
but comprehensive overview of all key topics, questions, answers and important details discussed. \
It will replace the current chat history to save tokens, so it must capture everything needed to \
understand the context and continue the conversation as if nothing was lost.";

const NEXT_SPEAKER_PROMPT: &str = "Analyze only the content and structure of your immediately \
preceding response. Decide who should speak next. If your response explicitly said you would \
take a next action, or ended mid-thought, the 'model' should speak next. If your response asked \
the user a question or completed its task, the 'user' should speak next. Respond only with JSON \
matching the schema, with fields 'reasoning' and 'next_speaker'.";

/// Event streamed to the UI while a message is processed
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Text increment from the model
    Content(String),
    /// Tool invocation for the external executor
    ToolCallRequest(FunctionCall),
    ChatCompressed(CompressionInfo),
    ModelFallback { from: String, to: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub original_token_count: u32,
    pub new_token_count: u32,
}

/// Result of `send_message`
#[derive(Debug, Default)]
pub struct TurnOutcome {
    /// Calls awaiting `FunctionResponse` parts in the next message
    pub pending_tool_calls: Vec<FunctionCall>,
    /// Requests issued, including auto-continuations
    pub turns: usize,
    pub usage: UsageMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextSpeaker {
    User,
    Model,
}

/// Everything one request produced
#[derive(Debug, Default)]
struct ModelTurn {
    text: String,
    function_calls: Vec<FunctionCall>,
    usage: Option<UsageMetadata>,
}

impl ModelTurn {
    async fn absorb(&mut self, response: GenerateResponse, events: &mpsc::Sender<TurnEvent>) {
        for part in &response.content.parts {
            if let Part::Text { text } = part {
                if !text.is_empty() {
                    self.text.push_str(text);
                    let _ = events.send(TurnEvent::Content(text.clone())).await;
                }
            }
        }
        for call in response.function_calls {
            let _ = events.send(TurnEvent::ToolCallRequest(call.clone())).await;
            self.function_calls.push(call);
        }
        // Streams report cumulative usage; the latest value wins
        if response.usage.is_some() {
            self.usage = response.usage;
        }
    }

    /// Text joined into one part, then the function calls
    fn into_content(self) -> Content {
        let mut parts = Vec::new();
        if !self.text.is_empty() {
            parts.push(Part::text(self.text));
        }
        parts.extend(self.function_calls.into_iter().map(Part::FunctionCall));
        Content::new(Role::Model, parts)
    }
}

/// One conversation against one provider
pub struct Chat {
    provider: Arc<dyn LLMProvider>,
    config: SessionConfig,
    session: Session,
    tools: Vec<ToolGroup>,
    retry: RetryPolicy,
    fallback_handler: Option<Arc<dyn FallbackHandler>>,
    /// Switch made by a side request, not yet reported as an event
    pending_switch: Option<(String, String)>,
}

impl Chat {
    pub fn new(provider: Arc<dyn LLMProvider>, config: SessionConfig) -> Self {
        let session = Session::new(provider.model_name());
        Self {
            provider,
            config,
            session,
            tools: Vec::new(),
            retry: RetryPolicy::default(),
            fallback_handler: None,
            pending_switch: None,
        }
    }

    /// Resume an existing session
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolGroup>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fallback_handler(mut self, handler: Arc<dyn FallbackHandler>) -> Self {
        self.fallback_handler = Some(handler);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn active_model(&self) -> &str {
        &self.session.active_model
    }

    pub fn history(&self) -> &[Content] {
        &self.session.history
    }

    /// History without invalid model contents and the user contents that
    /// prompted them. A model content is invalid when it has no parts or an
    /// empty text part.
    pub fn curated_history(&self) -> Vec<Content> {
        let history = &self.session.history;
        let mut curated = Vec::with_capacity(history.len());
        let mut i = 0;
        while i < history.len() {
            if history[i].role == Role::Model {
                curated.push(history[i].clone());
                i += 1;
                continue;
            }

            let input = history[i].clone();
            i += 1;
            let mut replies = Vec::new();
            let mut valid = true;
            while i < history.len() && history[i].role == Role::Model {
                if !is_valid_model_content(&history[i]) {
                    valid = false;
                }
                replies.push(history[i].clone());
                i += 1;
            }
            if valid {
                curated.push(input);
                curated.extend(replies);
            }
        }
        curated
    }

    pub fn add_history(&mut self, content: Content) {
        self.session.push(content);
    }

    pub fn set_history(&mut self, history: Vec<Content>) {
        self.session.history = history;
        self.session.touch();
    }

    /// Start a fresh session on the current model
    pub fn reset(&mut self) {
        self.session = Session::new(&self.session.active_model);
    }

    fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            model: self.session.active_model.clone(),
            temperature: Some(self.config.temperature),
            top_p: Some(self.config.top_p),
            max_output_tokens: self.config.max_output_tokens,
            system_instruction: Some(self.config.system_instruction.clone())
                .filter(|s| !s.trim().is_empty()),
            tools: self.tools.clone(),
            tool_choice: ToolChoiceMode::Auto,
            response_schema: None,
        }
    }

    fn model_fallback(&self) -> ModelFallback<'_> {
        ModelFallback {
            auth_type: self.config.auth_type,
            fallback_model: &self.config.fallback_model,
            handler: self.fallback_handler.as_deref(),
        }
    }

    /// Make a switched model the active one. Returns `(from, to)` when the
    /// active model changed.
    fn apply_switch(&mut self, model: String, switched_from: Option<String>) -> Option<(String, String)> {
        let from = switched_from?;
        if from != self.session.active_model {
            return None;
        }
        info!(from = %from, to = %model, "Active model switched after persistent rate limiting");
        self.session.active_model = model.clone();
        self.session.touch();
        Some((from, model))
    }

    /// Model switch made by a side request (`generate_content`,
    /// `generate_json`, compression) since the last call, as `(from, to)`
    pub fn take_model_switch(&mut self) -> Option<(String, String)> {
        self.pending_switch.take()
    }

    async fn report_switch(&mut self, events: &mpsc::Sender<TurnEvent>) {
        if let Some((from, to)) = self.pending_switch.take() {
            let _ = events.send(TurnEvent::ModelFallback { from, to }).await;
        }
    }

    /// Process a user message: issue requests until the model yields the
    /// floor, requests tools, or the turn budget runs out.
    pub async fn send_message(
        &mut self,
        parts: Vec<Part>,
        cancel: &CancellationToken,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<TurnOutcome, GenerationError> {
        let mut outcome = TurnOutcome::default();
        let mut request = Content::new(Role::User, parts);
        let mut budget = self.config.max_turns;
        self.report_switch(events).await;

        while budget > 0 {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled);
            }

            let compressed = self.try_compress(false, cancel).await;
            self.report_switch(events).await;
            if let Some(info) = compressed? {
                let _ = events.send(TurnEvent::ChatCompressed(info)).await;
            }

            let turn = self.request_turn(&request, cancel, events).await?;
            outcome.turns += 1;
            budget -= 1;

            if let Some(ref usage) = turn.usage {
                outcome.usage += usage.clone();
                self.session.cumulative_usage += usage.clone();
            }
            let pending = turn.function_calls.clone();
            self.session.push(request);
            self.session.push(turn.into_content());

            if !pending.is_empty() {
                debug!(calls = pending.len(), "Turn ended with pending tool calls");
                outcome.pending_tool_calls = pending;
                return Ok(outcome);
            }

            if budget == 0 {
                info!(turns = outcome.turns, "Turn budget exhausted");
                break;
            }

            let next = self.check_next_speaker(cancel).await;
            self.report_switch(events).await;
            match next? {
                NextSpeaker::Model => {
                    debug!(remaining = budget, "Model continues");
                    request = Content::user(CONTINUATION_PROMPT);
                }
                NextSpeaker::User => break,
            }
        }

        Ok(outcome)
    }

    /// Issue one retried request for `request` on top of the curated history
    async fn request_turn(
        &mut self,
        request: &Content,
        cancel: &CancellationToken,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<ModelTurn, GenerationError> {
        let mut contents = self.curated_history();
        contents.push(request.clone());
        let contents = contents.as_slice();

        let config = self.generation_config();
        let provider = Arc::clone(&self.provider);
        let model = self.session.active_model.clone();
        let mut turn = ModelTurn::default();

        if self.config.streaming {
            let outcome = {
                let fallback = self.model_fallback();
                retry_with_backoff(&self.retry, &model, &fallback, cancel, move |model| {
                    let provider = Arc::clone(&provider);
                    let mut config = config.clone();
                    config.model = model;
                    let cancel = cancel.clone();
                    async move { provider.generate_stream(contents, &config, cancel).await }
                })
                .await?
            };
            if let Some((from, to)) = self.apply_switch(outcome.model, outcome.switched_from) {
                let _ = events.send(TurnEvent::ModelFallback { from, to }).await;
            }

            let mut stream = outcome.value;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
                    next = stream.recv() => next,
                };
                match next {
                    Some(Ok(response)) => turn.absorb(response, events).await,
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            }
        } else {
            let outcome = {
                let fallback = self.model_fallback();
                retry_with_backoff(&self.retry, &model, &fallback, cancel, move |model| {
                    let provider = Arc::clone(&provider);
                    let mut config = config.clone();
                    config.model = model;
                    async move { provider.generate(contents, &config).await }
                })
                .await?
            };
            if let Some((from, to)) = self.apply_switch(outcome.model, outcome.switched_from) {
                let _ = events.send(TurnEvent::ModelFallback { from, to }).await;
            }
            turn.absorb(outcome.value, events).await;
        }

        Ok(turn)
    }

    /// Retried non-streaming request on the active model
    async fn generate_retried(
        &mut self,
        contents: &[Content],
        config: GenerationConfig,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, GenerationError> {
        let provider = Arc::clone(&self.provider);
        let model = config.model.clone();
        let outcome = {
            let fallback = self.model_fallback();
            retry_with_backoff(&self.retry, &model, &fallback, cancel, move |model| {
                let provider = Arc::clone(&provider);
                let mut config = config.clone();
                config.model = model;
                async move { provider.generate(contents, &config).await }
            })
            .await?
        };
        if let Some(switch) = self.apply_switch(outcome.model, outcome.switched_from) {
            self.pending_switch = Some(switch);
        }
        Ok(outcome.value)
    }

    /// Retried non-streaming request with a caller-supplied config. An empty
    /// `config.model` means the active model. A fallback switch is available
    /// from `take_model_switch` and reported by the next `send_message`.
    pub async fn generate_content(
        &mut self,
        contents: &[Content],
        mut config: GenerationConfig,
        cancel: &CancellationToken,
    ) -> Result<GenerateResponse, GenerationError> {
        if config.model.is_empty() {
            config.model = self.session.active_model.clone();
        }
        self.generate_retried(contents, config, cancel).await
    }

    async fn count_tokens(
        &self,
        contents: &[Content],
        cancel: &CancellationToken,
    ) -> Result<u32, GenerationError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            count = self.provider.count_tokens(contents) => count,
        }
    }

    /// Summarize the history when it nears the context window (or always,
    /// when forced). Failures other than cancellation skip compression.
    pub async fn try_compress(
        &mut self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<CompressionInfo>, GenerationError> {
        let curated = self.curated_history();
        if curated.is_empty() {
            return Ok(None);
        }

        let original_token_count = match self.count_tokens(&curated, cancel).await {
            Ok(count) => count,
            Err(GenerationError::Cancelled) => return Err(GenerationError::Cancelled),
            Err(e) => {
                warn!(model = %self.session.active_model, error = %e, "Could not count tokens, skipping compression");
                return Ok(None);
            }
        };

        if !force {
            let limit = self
                .config
                .context_window
                .or_else(|| token_limit(&self.session.active_model));
            let Some(limit) = limit else {
                debug!(model = %self.session.active_model, "No token limit known, skipping compression");
                return Ok(None);
            };
            if (original_token_count as f64) < self.config.compression_threshold * limit as f64 {
                return Ok(None);
            }
        }

        let prompt = Content::user(COMPRESSION_PROMPT);
        let mut contents = self.session.history.clone();
        contents.push(prompt.clone());
        let mut config = self.generation_config();
        config.tools.clear();

        let summary = match self.generate_retried(&contents, config, cancel).await {
            Ok(response) => response.text(),
            Err(GenerationError::Cancelled) => return Err(GenerationError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Summarization failed, skipping compression");
                return Ok(None);
            }
        };
        if summary.trim().is_empty() {
            warn!("Empty summary, skipping compression");
            return Ok(None);
        }

        let new_history = vec![prompt, Content::model(&summary)];
        let new_token_count = match self.count_tokens(&new_history, cancel).await {
            Ok(count) => count,
            Err(GenerationError::Cancelled) => return Err(GenerationError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Could not count tokens of compressed history");
                0
            }
        };
        self.set_history(new_history);

        info!(
            original_token_count,
            new_token_count,
            model = %self.session.active_model,
            "Chat history compressed"
        );
        Ok(Some(CompressionInfo {
            original_token_count,
            new_token_count,
        }))
    }

    async fn check_next_speaker(&mut self, cancel: &CancellationToken) -> Result<NextSpeaker, GenerationError> {
        let mut contents = self.curated_history();
        let Some(last) = contents.last() else {
            return Ok(NextSpeaker::User);
        };
        if last.role != Role::Model {
            return Ok(NextSpeaker::User);
        }
        if last.text().trim().is_empty() && last.function_calls().is_empty() {
            return Ok(NextSpeaker::Model);
        }

        contents.push(Content::user(NEXT_SPEAKER_PROMPT));
        let schema = json!({
            "type": "object",
            "properties": {
                "reasoning": {"type": "string"},
                "next_speaker": {"type": "string", "enum": ["user", "model"]}
            },
            "required": ["reasoning", "next_speaker"]
        });
        let model = self
            .config
            .next_speaker_model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.session.active_model.clone());

        match self.json_request(&contents, schema, model, cancel).await {
            Ok(value) => {
                let speaker = value.get("next_speaker").and_then(Value::as_str);
                debug!(next_speaker = ?speaker, "Next speaker decided");
                if speaker == Some("model") {
                    Ok(NextSpeaker::Model)
                } else {
                    Ok(NextSpeaker::User)
                }
            }
            Err(GenerationError::Cancelled) => Err(GenerationError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Next-speaker check failed, yielding to user");
                Ok(NextSpeaker::User)
            }
        }
    }

    /// Structured-output request on the active model
    pub async fn generate_json(
        &mut self,
        contents: &[Content],
        schema: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, GenerationError> {
        let model = self.session.active_model.clone();
        self.json_request(contents, schema, model, cancel).await
    }

    async fn json_request(
        &mut self,
        contents: &[Content],
        schema: Value,
        model: String,
        cancel: &CancellationToken,
    ) -> Result<Value, GenerationError> {
        let config = GenerationConfig {
            model,
            temperature: Some(0.0),
            top_p: Some(1.0),
            system_instruction: Some(self.config.system_instruction.clone())
                .filter(|s| !s.trim().is_empty()),
            response_schema: Some(schema),
            ..Default::default()
        };
        let response = self.generate_retried(contents, config, cancel).await?;
        let vendor = self.provider.vendor().to_string();

        let text = response.text();
        if text.trim().is_empty() {
            return Err(GenerationError::parse(&vendor, "generate_json", "empty response"));
        }
        serde_json::from_str(clean_json_text(&text))
            .map_err(|e| GenerationError::parse(&vendor, "generate_json", e.to_string()))
    }

    /// One embedding vector per text
    pub async fn generate_embedding(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GenerationError> {
        self.provider.embed(texts).await
    }
}

fn is_valid_model_content(content: &Content) -> bool {
    if content.parts.is_empty() {
        return false;
    }
    !content
        .parts
        .iter()
        .any(|p| matches!(p, Part::Text { text } if text.is_empty()))
}

/// Strip Markdown code fences around a JSON payload
pub fn clean_json_text(text: &str) -> &str {
    let mut cleaned = text.trim();
    if cleaned.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("```json")) {
        cleaned = &cleaned[7..];
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.trim_end().strip_suffix("```") {
        cleaned = rest;
    }
    cleaned.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthType;
    use crate::llm::provider::{ResponseStream, STREAM_CHANNEL_SIZE};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    enum Scripted {
        Text(&'static str),
        Calls(Vec<FunctionCall>),
        Json(Value),
        Status(u16),
    }

    /// Scripted provider: pops one entry per request, streaming text a word at a time
    struct MockProvider {
        script: Mutex<VecDeque<Scripted>>,
        tokens: AtomicU32,
        rate_limited_model: Option<&'static str>,
        hang_after_first_chunk: bool,
        held_senders: Mutex<Vec<mpsc::Sender<Result<GenerateResponse, GenerationError>>>>,
        requests: Mutex<Vec<(String, Vec<Content>)>>,
    }

    impl MockProvider {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                tokens: AtomicU32::new(10),
                rate_limited_model: None,
                hang_after_first_chunk: false,
                held_senders: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn remaining(&self) -> usize {
            self.script.lock().unwrap().len()
        }

        fn next(&self, contents: &[Content], config: &GenerationConfig) -> Result<GenerateResponse, GenerationError> {
            self.requests
                .lock()
                .unwrap()
                .push((config.model.clone(), contents.to_vec()));
            if self.rate_limited_model == Some(config.model.as_str()) {
                return Err(status_error(429));
            }
            let entry = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            match entry {
                Scripted::Text(text) => Ok(GenerateResponse::new(
                    vec![Part::text(text)],
                    Some(FinishReason::Stop),
                    Some(UsageMetadata {
                        prompt_tokens: 5,
                        completion_tokens: 3,
                        total_tokens: 8,
                    }),
                    &config.model,
                )),
                Scripted::Calls(calls) => Ok(GenerateResponse::new(
                    calls.into_iter().map(Part::FunctionCall).collect(),
                    Some(FinishReason::ToolCalls),
                    None,
                    &config.model,
                )),
                Scripted::Json(value) => Ok(GenerateResponse::new(
                    vec![Part::text(value.to_string())],
                    Some(FinishReason::Stop),
                    None,
                    &config.model,
                )),
                Scripted::Status(status) => Err(status_error(status)),
            }
        }
    }

    fn status_error(status: u16) -> GenerationError {
        GenerationError::Provider {
            vendor: "mock".into(),
            operation: "generate",
            status,
            body: "scripted failure".into(),
            retry_after: None,
        }
    }

    #[async_trait]
    impl LLMProvider for MockProvider {
        async fn generate(
            &self,
            contents: &[Content],
            config: &GenerationConfig,
        ) -> Result<GenerateResponse, GenerationError> {
            self.next(contents, config)
        }

        async fn generate_stream(
            &self,
            contents: &[Content],
            config: &GenerationConfig,
            _cancel: CancellationToken,
        ) -> Result<ResponseStream, GenerationError> {
            let response = self.next(contents, config)?;
            let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);

            let text = response.text();
            let mut words = text.split_inclusive(' ');
            if self.hang_after_first_chunk {
                if let Some(word) = words.next() {
                    let _ = tx.try_send(Ok(GenerateResponse::text_delta(word, &config.model)));
                }
                self.held_senders.lock().unwrap().push(tx);
                return Ok(rx);
            }
            for word in words {
                let _ = tx.try_send(Ok(GenerateResponse::text_delta(word, &config.model)));
            }
            let calls = response
                .function_calls
                .iter()
                .cloned()
                .map(Part::FunctionCall)
                .collect();
            let _ = tx.try_send(Ok(GenerateResponse::new(
                calls,
                response.finish_reason.clone(),
                response.usage.clone(),
                &config.model,
            )));
            Ok(rx)
        }

        async fn count_tokens(&self, _contents: &[Content]) -> Result<u32, GenerationError> {
            Ok(self.tokens.load(Ordering::SeqCst))
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GenerationError> {
            Ok(texts.iter().map(|t| vec![t.len() as f32]).collect())
        }

        fn vendor(&self) -> &str {
            "mock"
        }

        fn model_name(&self) -> &str {
            "gemini-2.5-pro"
        }
    }

    fn chat_with(provider: Arc<MockProvider>, config: SessionConfig) -> Chat {
        Chat::new(provider, config).with_retry_policy(RetryPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        })
    }

    async fn send(chat: &mut Chat, text: &str) -> (Result<TurnOutcome, GenerationError>, Vec<TurnEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let result = chat
            .send_message(vec![Part::text(text)], &CancellationToken::new(), &tx)
            .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (result, events)
    }

    fn user_yields() -> Scripted {
        Scripted::Json(json!({"reasoning": "answered", "next_speaker": "user"}))
    }

    fn model_continues() -> Scripted {
        Scripted::Json(json!({"reasoning": "said it would go on", "next_speaker": "model"}))
    }

    fn call(id: &str) -> FunctionCall {
        FunctionCall {
            id: id.into(),
            name: "read_file".into(),
            args: json!({"path": "Cargo.toml"}),
        }
    }

    #[tokio::test]
    async fn test_send_message_streams_and_appends_history() {
        let provider = Arc::new(MockProvider::new(vec![
            Scripted::Text("Hello there friend"),
            user_yields(),
        ]));
        let mut chat = chat_with(provider.clone(), SessionConfig::default());

        let (result, events) = send(&mut chat, "Hi").await;
        let outcome = result.unwrap();

        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.usage.total_tokens, 8);
        assert!(outcome.pending_tool_calls.is_empty());
        assert_eq!(
            events,
            vec![
                TurnEvent::Content("Hello ".into()),
                TurnEvent::Content("there ".into()),
                TurnEvent::Content("friend".into()),
            ]
        );
        assert_eq!(
            chat.history(),
            &[Content::user("Hi"), Content::model("Hello there friend")]
        );
        assert_eq!(chat.session().cumulative_usage.total_tokens, 8);
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn test_auto_continues_when_model_speaks_next() {
        let provider = Arc::new(MockProvider::new(vec![
            Scripted::Text("First I will look."),
            model_continues(),
            Scripted::Text("Done looking."),
            user_yields(),
        ]));
        let mut chat = chat_with(provider.clone(), SessionConfig::default());

        let (result, _) = send(&mut chat, "Investigate").await;
        assert_eq!(result.unwrap().turns, 2);

        let history = chat.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[2], Content::user(CONTINUATION_PROMPT));
        assert_eq!(history[3].text(), "Done looking.");
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn test_turn_budget_bounds_continuation() {
        let provider = Arc::new(MockProvider::new(vec![
            Scripted::Text("one"),
            model_continues(),
            Scripted::Text("two"),
        ]));
        let config = SessionConfig {
            max_turns: 2,
            ..Default::default()
        };
        let mut chat = chat_with(provider.clone(), config);

        let (result, _) = send(&mut chat, "go").await;
        assert_eq!(result.unwrap().turns, 2);
        // No next-speaker check after the last budgeted turn
        assert_eq!(provider.remaining(), 0);
        assert_eq!(provider.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_pending_tool_calls_end_the_turn() {
        let provider = Arc::new(MockProvider::new(vec![Scripted::Calls(vec![call("call_1")])]));
        let mut chat = chat_with(provider.clone(), SessionConfig::default());

        let (result, events) = send(&mut chat, "read the manifest").await;
        let outcome = result.unwrap();
        assert_eq!(outcome.pending_tool_calls, vec![call("call_1")]);
        assert_eq!(events, vec![TurnEvent::ToolCallRequest(call("call_1"))]);
        assert_eq!(chat.history()[1].function_calls(), vec![&call("call_1")]);

        // The tool result resumes the conversation
        provider
            .script
            .lock()
            .unwrap()
            .extend([Scripted::Text("It is a workspace."), user_yields()]);
        let response = Part::FunctionResponse(FunctionResponse {
            id: "call_1".into(),
            name: "read_file".into(),
            response: json!({"output": "[workspace]"}),
        });
        let (tx, _rx) = mpsc::channel(64);
        chat.send_message(vec![response], &CancellationToken::new(), &tx)
            .await
            .unwrap();
        let sent = provider.requests.lock().unwrap();
        let (_, contents) = &sent[1];
        assert!(matches!(
            contents.last().unwrap().parts[0],
            Part::FunctionResponse(ref r) if r.id == "call_1"
        ));
    }

    #[tokio::test]
    async fn test_failed_call_leaves_history_untouched() {
        let provider = Arc::new(MockProvider::new(vec![Scripted::Status(400)]));
        let mut chat = chat_with(provider, SessionConfig::default());

        let (result, _) = send(&mut chat, "Hi").await;
        assert_eq!(result.unwrap_err().status(), Some(400));
        assert!(chat.history().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_stops_promptly() {
        let mut mock = MockProvider::new(vec![Scripted::Text("partial answer that never ends")]);
        mock.hang_after_first_chunk = true;
        let provider = Arc::new(mock);
        let mut chat = chat_with(provider.clone(), SessionConfig::default());

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(64);
        let trigger = cancel.clone();
        let watcher = tokio::spawn(async move {
            let first = rx.recv().await;
            trigger.cancel();
            first
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            chat.send_message(vec![Part::text("Hi")], &cancel, &tx),
        )
        .await
        .expect("cancellation should end the turn");

        assert!(matches!(result, Err(GenerationError::Cancelled)));
        assert_eq!(
            watcher.await.unwrap(),
            Some(TurnEvent::Content("partial ".into()))
        );
        assert!(chat.history().is_empty());
        assert_eq!(provider.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_compression_runs_only_past_threshold() {
        let provider = Arc::new(MockProvider::new(vec![Scripted::Text("the summary")]));
        let config = SessionConfig {
            context_window: Some(1000),
            ..Default::default()
        };
        let mut chat = chat_with(provider.clone(), config);
        chat.set_history(vec![Content::user("question"), Content::model("answer")]);
        let cancel = CancellationToken::new();

        provider.tokens.store(500, Ordering::SeqCst);
        assert!(chat.try_compress(false, &cancel).await.unwrap().is_none());
        assert_eq!(chat.history().len(), 2);
        assert_eq!(provider.remaining(), 1);

        provider.tokens.store(951, Ordering::SeqCst);
        let info = chat.try_compress(false, &cancel).await.unwrap().unwrap();
        assert_eq!(info.original_token_count, 951);
        let history = chat.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], Content::user(COMPRESSION_PROMPT));
        assert_eq!(history[1], Content::model("the summary"));
    }

    #[tokio::test]
    async fn test_compression_skipped_for_unknown_model_unless_forced() {
        let provider = Arc::new(MockProvider::new(vec![Scripted::Text("summary")]));
        provider.tokens.store(u32::MAX, Ordering::SeqCst);
        let mut chat = chat_with(provider.clone(), SessionConfig::default());
        chat.session.active_model = "ep-unknown".into();
        chat.set_history(vec![Content::user("q"), Content::model("a")]);
        let cancel = CancellationToken::new();

        assert!(chat.try_compress(false, &cancel).await.unwrap().is_none());
        assert!(chat.try_compress(true, &cancel).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_compression_failure_degrades_to_skip() {
        let provider = Arc::new(MockProvider::new(vec![Scripted::Status(400)]));
        let mut chat = chat_with(provider, SessionConfig::default());
        chat.set_history(vec![Content::user("q"), Content::model("a")]);
        let result = chat.try_compress(true, &CancellationToken::new()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(chat.history().len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_rate_limit_falls_back_and_reports() {
        struct Accept;

        #[async_trait]
        impl FallbackHandler for Accept {
            async fn accept(&self, _current: &str, _fallback: &str) -> anyhow::Result<bool> {
                Ok(true)
            }
        }

        let mut mock = MockProvider::new(vec![Scripted::Text("from flash"), user_yields()]);
        mock.rate_limited_model = Some("gemini-2.5-pro");
        let provider = Arc::new(mock);
        let config = SessionConfig {
            auth_type: AuthType::LoginWithGooglePersonal,
            ..Default::default()
        };
        let mut chat = chat_with(provider, config).with_fallback_handler(Arc::new(Accept));

        let (result, events) = send(&mut chat, "Hi").await;
        result.unwrap();
        assert_eq!(
            events[0],
            TurnEvent::ModelFallback {
                from: "gemini-2.5-pro".into(),
                to: "gemini-2.5-flash".into(),
            }
        );
        assert_eq!(chat.active_model(), "gemini-2.5-flash");
        assert_eq!(chat.history()[1].text(), "from flash");
    }

    #[tokio::test]
    async fn test_generate_json_strips_fences() {
        let provider = Arc::new(MockProvider::new(vec![Scripted::Text(
            "```json\n{\"answer\": 42}\n```",
        )]));
        let mut chat = chat_with(provider, SessionConfig::default());
        let value = chat
            .generate_json(&[Content::user("q")], json!({"type": "object"}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, json!({"answer": 42}));
    }

    #[tokio::test]
    async fn test_generate_json_empty_text_is_parse_error() {
        let provider = Arc::new(MockProvider::new(vec![Scripted::Text("  ")]));
        let mut chat = chat_with(provider, SessionConfig::default());
        let err = chat
            .generate_json(&[Content::user("q")], json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_generate_embedding_passthrough() {
        let provider = Arc::new(MockProvider::new(vec![]));
        let chat = chat_with(provider, SessionConfig::default());
        let vectors = chat
            .generate_embedding(&["ab".to_string(), "abc".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![2.0], vec![3.0]]);
    }

    #[test]
    fn test_curated_history_drops_invalid_model_turns() {
        let provider = Arc::new(MockProvider::new(vec![]));
        let mut chat = chat_with(provider, SessionConfig::default());
        chat.set_history(vec![
            Content::user("first"),
            Content::new(Role::Model, vec![]),
            Content::user("second"),
            Content::model(""),
            Content::user("third"),
            Content::model("fine"),
        ]);
        assert_eq!(
            chat.curated_history(),
            vec![Content::user("third"), Content::model("fine")]
        );
    }

    #[test]
    fn test_reset_keeps_model_and_clears_history() {
        let provider = Arc::new(MockProvider::new(vec![]));
        let mut chat = chat_with(provider, SessionConfig::default());
        chat.add_history(Content::user("x"));
        let old_id = chat.session().id.clone();
        chat.reset();
        assert!(chat.history().is_empty());
        assert_ne!(chat.session().id, old_id);
        assert_eq!(chat.active_model(), "gemini-2.5-pro");
    }

    #[test]
    fn test_clean_json_text() {
        assert_eq!(clean_json_text("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(clean_json_text("```JSON {\"a\":1}```"), "{\"a\":1}");
        assert_eq!(clean_json_text("```\n[1]\n```"), "[1]");
        assert_eq!(clean_json_text("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_clean_json_text_multibyte_prefix() {
        assert_eq!(
            clean_json_text("好的，下一位发言者是用户"),
            "好的，下一位发言者是用户"
        );
        assert_eq!(clean_json_text("```json{\"说\":1}```"), "{\"说\":1}");
        assert_eq!(clean_json_text("```好```"), "好");
    }

    #[tokio::test]
    async fn test_non_ascii_next_speaker_reply_yields_to_user() {
        let provider = Arc::new(MockProvider::new(vec![
            Scripted::Text("答案是四"),
            Scripted::Text("好的，下一位发言者是用户"),
        ]));
        let mut chat = chat_with(provider.clone(), SessionConfig::default());

        let (result, _) = send(&mut chat, "2+2?").await;
        assert_eq!(result.unwrap().turns, 1);
        assert_eq!(chat.history()[1].text(), "答案是四");
        assert_eq!(provider.remaining(), 0);
    }

    struct AcceptFallback;

    #[async_trait]
    impl FallbackHandler for AcceptFallback {
        async fn accept(&self, _current: &str, _fallback: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn rate_limited_personal_chat(script: Vec<Scripted>, config: SessionConfig) -> (Arc<MockProvider>, Chat) {
        let mut mock = MockProvider::new(script);
        mock.rate_limited_model = Some("gemini-2.5-pro");
        let provider = Arc::new(mock);
        let config = SessionConfig {
            auth_type: AuthType::LoginWithGooglePersonal,
            ..config
        };
        let chat = chat_with(provider.clone(), config).with_fallback_handler(Arc::new(AcceptFallback));
        (provider, chat)
    }

    fn pro_to_flash() -> TurnEvent {
        TurnEvent::ModelFallback {
            from: "gemini-2.5-pro".into(),
            to: "gemini-2.5-flash".into(),
        }
    }

    #[tokio::test]
    async fn test_fallback_during_compression_is_reported() {
        let (provider, mut chat) = rate_limited_personal_chat(
            vec![Scripted::Text("summary"), Scripted::Text("answer"), user_yields()],
            SessionConfig {
                context_window: Some(1000),
                ..Default::default()
            },
        );
        provider.tokens.store(999, Ordering::SeqCst);
        chat.set_history(vec![Content::user("q"), Content::model("a")]);

        let (result, events) = send(&mut chat, "Hi").await;
        result.unwrap();

        assert_eq!(
            events,
            vec![
                pro_to_flash(),
                TurnEvent::ChatCompressed(CompressionInfo {
                    original_token_count: 999,
                    new_token_count: 999,
                }),
                TurnEvent::Content("answer".into()),
            ]
        );
        assert_eq!(chat.active_model(), "gemini-2.5-flash");
        assert!(chat.take_model_switch().is_none());
    }

    #[tokio::test]
    async fn test_generate_content_switch_is_reported() {
        let (_provider, mut chat) = rate_limited_personal_chat(
            vec![Scripted::Text("side answer")],
            SessionConfig::default(),
        );

        let response = chat
            .generate_content(
                &[Content::user("summarize this file")],
                GenerationConfig::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.text(), "side answer");
        assert_eq!(response.model, "gemini-2.5-flash");
        assert_eq!(chat.active_model(), "gemini-2.5-flash");
        assert_eq!(
            chat.take_model_switch(),
            Some(("gemini-2.5-pro".to_string(), "gemini-2.5-flash".to_string()))
        );
        assert!(chat.take_model_switch().is_none());
        assert!(chat.history().is_empty());
    }

    #[tokio::test]
    async fn test_side_request_switch_surfaces_in_next_message() {
        let (_provider, mut chat) = rate_limited_personal_chat(
            vec![Scripted::Json(json!({"ok": true})), Scripted::Text("hello"), user_yields()],
            SessionConfig::default(),
        );
        let value = chat
            .generate_json(&[Content::user("q")], json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));

        let (result, events) = send(&mut chat, "Hi").await;
        result.unwrap();
        assert_eq!(events, vec![pro_to_flash(), TurnEvent::Content("hello".into())]);
    }

    #[tokio::test]
    async fn test_generate_json_runs_on_active_model() {
        let provider = Arc::new(MockProvider::new(vec![Scripted::Json(json!({}))]));
        let mut chat = chat_with(provider.clone(), SessionConfig::default());
        chat.generate_json(&[Content::user("q")], json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(provider.requests.lock().unwrap()[0].0, chat.active_model());
    }

    #[tokio::test]
    async fn test_generate_content_uses_explicit_model() {
        let provider = Arc::new(MockProvider::new(vec![Scripted::Text("ok")]));
        let mut chat = chat_with(provider.clone(), SessionConfig::default());
        let config = GenerationConfig {
            model: "gemini-2.5-flash".into(),
            ..Default::default()
        };
        chat.generate_content(&[Content::user("q")], config, &CancellationToken::new())
            .await
            .unwrap();

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].0, "gemini-2.5-flash");
        assert_eq!(chat.active_model(), "gemini-2.5-pro");
    }
}
