//! Agent Controller - one conversation turn, model ⇄ tool dispatch
//!
//! A turn rebuilds the transcript from the history store, appends the user
//! message, then alternates between the model endpoint and the tool registry
//! until the model answers without tool calls or the round budget runs out.
//! Every assistant message is persisted with its tool-call records already
//! attached; tool results follow as `tool` messages.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::sessions::{AgentStatus, SessionGate, StatusTracker};
use crate::history::{
    ConversationSummary, DataRecord, HistoryError, HistoryStore, Message, NewMessage, Role,
    ToolCallRecord,
};
use crate::metrics::{AGENT_TOOL_ROUNDS, AGENT_TURNS, LLM_CALL_DURATION, LLM_CALL_FAILURES};
use crate::ollama::{
    parse_tool_calls_from_text, ChatError, ChatMessage, ChatResponse, ModelEndpoint, Tool,
    ToolCall, DEFAULT_SYSTEM_PROMPT,
};
use crate::tools::{Dispatch, ToolError, ToolKind, ToolRegistry};

/// Configuration for the agent loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Tool-call rounds allowed per turn before the turn is cut short
    pub max_tool_rounds: usize,
    /// Consecutive requests for the same refused command that end the turn
    pub denied_repeat_limit: usize,
    /// Custom system prompt (uses default if None)
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 6,
            denied_repeat_limit: 2,
            system_prompt: None,
        }
    }
}

/// Turn-level failures
///
/// Tool failures never show up here: they are fed back to the model and
/// recorded on the turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model endpoint could not be reached, even after the retry
    #[error("agent unavailable: {0}")]
    AgentUnavailable(ChatError),

    /// The model endpoint answered with something unusable
    #[error("model error: {0}")]
    Model(ChatError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(#[from] HistoryError),
}

/// Result of one turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub reply: String,
    pub conversation_id: String,
    /// Every dispatched call, in order
    pub tool_calls: Vec<ToolCallRecord>,
    /// Tool-call rounds dispatched
    pub rounds: usize,
    /// The turn ran out of rounds and the reply is degraded
    pub limit_reached: bool,
    /// At least one command was refused by the safety guard
    pub refused: bool,
    /// A staged change needs a reboot
    pub reboot_pending: bool,
    pub trace_id: String,
}

/// A command the safety guard refused during this turn
#[derive(Debug, Clone)]
struct Refusal {
    command: String,
    reason: String,
}

/// Tracks consecutive refusals of the same command
#[derive(Debug, Default)]
struct DenialStreak {
    command: Option<String>,
    count: usize,
}

impl DenialStreak {
    /// Record a dispatch; returns the current streak length
    fn observe(&mut self, dispatch: &Dispatch) -> usize {
        match &dispatch.result {
            Err(ToolError::SafetyDenied { command, .. }) => {
                if self.command.as_deref() == Some(command.as_str()) {
                    self.count += 1;
                } else {
                    self.command = Some(command.clone());
                    self.count = 1;
                }
            }
            _ => {
                self.command = None;
                self.count = 0;
            }
        }
        self.count
    }
}

/// How a turn ended, before notes are appended
enum Ending {
    Reply(String),
    RoundLimit(String),
    Refused,
}

/// Agent Controller orchestrating the model, the tool registry and history
pub struct AgentController {
    model: Arc<dyn ModelEndpoint>,
    registry: Arc<ToolRegistry>,
    history: Arc<HistoryStore>,
    sessions: SessionGate,
    status: Arc<StatusTracker>,
    config: AgentConfig,
    retry_backoff: Duration,
}

impl AgentController {
    pub fn new(
        model: Arc<dyn ModelEndpoint>,
        registry: Arc<ToolRegistry>,
        history: Arc<HistoryStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            model,
            registry,
            history,
            sessions: SessionGate::new(),
            status: Arc::new(StatusTracker::new()),
            config,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Delay before the single retry of a failed model call
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    pub fn status(&self) -> AgentStatus {
        self.status.status()
    }

    pub fn turns_in_flight(&self) -> usize {
        self.status.in_flight()
    }

    /// Run one turn
    ///
    /// With no `conversation_id` the active conversation is used, or a new
    /// one is started if the last activity is older than the session gap.
    pub async fn handle_turn(
        &self,
        conversation_id: Option<&str>,
        text: &str,
    ) -> Result<TurnReply, AgentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::InvalidRequest("message text is empty".to_string()));
        }

        let trace_id = Uuid::now_v7().to_string();
        let root_span = info_span!(
            "agent_turn",
            trace_id = %trace_id,
            model = %self.model.model_name(),
            otel.name = "agent_turn"
        );

        let _turn = self.status.begin_turn();
        let result = self.run_turn(conversation_id, text, &trace_id).instrument(root_span).await;

        let outcome = match &result {
            Ok(reply) if reply.limit_reached => "round_limit",
            Ok(reply) if reply.refused => "refused",
            Ok(_) => "reply",
            Err(AgentError::AgentUnavailable(_)) => "unavailable",
            Err(_) => "error",
        };
        AGENT_TURNS.with_label_values(&[outcome]).inc();
        if let Ok(reply) = &result {
            AGENT_TOOL_ROUNDS.observe(reply.rounds as f64);
        }
        result
    }

    async fn run_turn(
        &self,
        conversation_id: Option<&str>,
        text: &str,
        trace_id: &str,
    ) -> Result<TurnReply, AgentError> {
        let conversation = match conversation_id {
            Some(id) => self
                .history
                .get_conversation(id)?
                .ok_or_else(|| AgentError::NotFound(format!("conversation '{}'", id)))?,
            None => self.history.get_active_conversation(Utc::now())?,
        };
        let conversation_id = conversation.id;

        let _session = self.sessions.acquire(&conversation_id).await;
        info!(trace_id, conversation_id = %conversation_id, "Starting turn");

        let system_prompt = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let stored = self.history.messages(&conversation_id)?;
        let mut transcript = transcript_from_history(system_prompt, &stored);

        self.history
            .append_message(&conversation_id, NewMessage::user(text), Utc::now())?;
        transcript.push(ChatMessage::user(text));

        let tools = self.registry.chat_tools();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut refusals: Vec<Refusal> = Vec::new();
        let mut streak = DenialStreak::default();
        let mut reboot_pending = false;
        let mut rounds = 0usize;

        let ending = loop {
            let response = self.call_model(&transcript, &tools, trace_id, rounds).await?;
            let content = strip_reasoning(&response.message.content);
            let calls = requested_calls(&response);

            if calls.is_empty() {
                break Ending::Reply(content);
            }

            if rounds >= self.config.max_tool_rounds {
                warn!(trace_id, rounds, "Tool-call round limit reached");
                break Ending::RoundLimit(content);
            }
            rounds += 1;
            debug!(trace_id, round = rounds, calls = calls.len(), "Dispatching tool calls");

            // Sequential, in the order the model asked for them
            let mut round_records = Vec::with_capacity(calls.len());
            let mut round_messages = Vec::with_capacity(calls.len());
            let mut refused_loop = false;
            for call in &calls {
                let arguments = call.function.normalized_arguments();
                let dispatch = self.registry.dispatch(&call.function.name, &arguments).await;
                let payload = dispatch.payload();

                if dispatch.inspection && !dispatch.is_error() {
                    self.history.append_data_record(
                        Some(conversation_id.as_str()),
                        &dispatch.name,
                        &payload,
                        Utc::now(),
                    )?;
                }
                if payload.get("reboot_pending") == Some(&Value::Bool(true)) {
                    reboot_pending = true;
                }
                if let Err(ToolError::SafetyDenied { command, reason, .. }) = &dispatch.result {
                    refusals.push(Refusal {
                        command: command.clone(),
                        reason: reason.clone(),
                    });
                }
                let streak_len = streak.observe(&dispatch);

                round_messages.push(ChatMessage::tool(dispatch.name.clone(), payload.to_string()));
                round_records.push(ToolCallRecord {
                    tool: dispatch.name.clone(),
                    arguments,
                    result: payload,
                    is_error: dispatch.is_error(),
                    duration_ms: dispatch.duration.as_millis() as u64,
                });

                if streak_len >= self.config.denied_repeat_limit {
                    warn!(trace_id, repeats = streak_len, "Refused command requested repeatedly, ending turn");
                    refused_loop = true;
                    break;
                }
            }

            // Results are attached before the assistant message is stored
            let dispatched: Vec<ToolCall> = calls.into_iter().take(round_records.len()).collect();
            let assistant_text = (!content.is_empty()).then(|| content.clone());
            self.history.append_message(
                &conversation_id,
                NewMessage::assistant(assistant_text, round_records.clone()),
                Utc::now(),
            )?;
            for message in &round_messages {
                self.history.append_message(
                    &conversation_id,
                    NewMessage::tool(message.content.clone()),
                    Utc::now(),
                )?;
            }

            transcript.push(ChatMessage::assistant_with_calls(content, dispatched));
            transcript.extend(round_messages);
            records.extend(round_records);

            if refused_loop {
                break Ending::Refused;
            }
        };

        let limit_reached = matches!(ending, Ending::RoundLimit(_));
        let mut reply = match ending {
            Ending::Reply(answer) => answer,
            Ending::RoundLimit(partial) => {
                let mut degraded = format!(
                    "I stopped after {} rounds of tool calls without finishing this request.",
                    self.config.max_tool_rounds
                );
                append_paragraph(&mut degraded, &partial);
                degraded
            }
            Ending::Refused => String::new(),
        };

        if !refusals.is_empty() {
            append_paragraph(&mut reply, &refusal_note(&refusals));
        }
        if reboot_pending && !reply.to_lowercase().contains("reboot") {
            append_paragraph(&mut reply, "A reboot is required to apply the staged changes.");
        }
        // The stored final message is exactly what the caller sees
        self.history.append_message(
            &conversation_id,
            NewMessage::assistant(Some(reply.clone()), Vec::new()),
            Utc::now(),
        )?;

        info!(
            trace_id,
            conversation_id = %conversation_id,
            rounds,
            tool_calls = records.len(),
            limit_reached,
            "Turn completed"
        );

        Ok(TurnReply {
            reply,
            conversation_id,
            tool_calls: records,
            rounds,
            limit_reached,
            refused: !refusals.is_empty(),
            reboot_pending,
            trace_id: trace_id.to_string(),
        })
    }

    /// One model call with a single retry for transient failures
    async fn call_model(
        &self,
        transcript: &[ChatMessage],
        tools: &[Tool],
        trace_id: &str,
        round: usize,
    ) -> Result<ChatResponse, AgentError> {
        let model = self.model.model_name().to_string();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let llm_span = info_span!(
                "llm_call",
                trace_id = %trace_id,
                round,
                attempt,
                model = %model,
                otel.name = "llm_call"
            );
            let start = Instant::now();
            let result = self.model.chat(transcript, tools).instrument(llm_span).await;
            LLM_CALL_DURATION
                .with_label_values(&[&model])
                .observe(start.elapsed().as_secs_f64());

            match result {
                Ok(response) => {
                    self.status.mark_available();
                    return Ok(response);
                }
                Err(e) if e.is_transient() => {
                    LLM_CALL_FAILURES.with_label_values(&["transient"]).inc();
                    if attempt >= 2 {
                        warn!(trace_id, error = %e, "Model endpoint unavailable");
                        self.status.mark_unavailable();
                        return Err(AgentError::AgentUnavailable(e));
                    }
                    warn!(trace_id, error = %e, backoff_ms = self.retry_backoff.as_millis() as u64, "Model call failed, retrying");
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => {
                    LLM_CALL_FAILURES.with_label_values(&["fatal"]).inc();
                    warn!(trace_id, error = %e, "Model call failed");
                    return Err(AgentError::Model(e));
                }
            }
        }
    }

    /// Dispatch a tool directly, outside any conversation
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> Dispatch {
        self.registry.dispatch(name, arguments).await
    }

    pub fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>, AgentError> {
        Ok(self.history.list_conversations(limit)?)
    }

    pub fn conversation_messages(&self, id: &str) -> Result<Vec<Message>, AgentError> {
        if self.history.get_conversation(id)?.is_none() {
            return Err(AgentError::NotFound(format!("conversation '{}'", id)));
        }
        Ok(self.history.messages(id)?)
    }

    pub fn delete_conversation(&self, id: &str) -> Result<(), AgentError> {
        if self.history.delete_conversation(id)? {
            Ok(())
        } else {
            Err(AgentError::NotFound(format!("conversation '{}'", id)))
        }
    }

    pub fn clear_history(&self) -> Result<u64, AgentError> {
        Ok(self.history.clear_all()?)
    }

    pub fn data_records(&self, limit: usize) -> Result<Vec<DataRecord>, AgentError> {
        Ok(self.history.list_data_records(limit)?)
    }

    pub fn delete_data_record(&self, id: i64) -> Result<(), AgentError> {
        if self.history.delete_data_record(id)? {
            Ok(())
        } else {
            Err(AgentError::NotFound(format!("data record {}", id)))
        }
    }

    pub fn clear_data(&self) -> Result<u64, AgentError> {
        Ok(self.history.clear_data_records()?)
    }
}

/// Tool calls the turn should act on
///
/// Native calls are taken as-is (unknown names fail at dispatch). Calls
/// recovered from text only count when they name a registered tool, so
/// ordinary JSON in a reply is not mistaken for a call.
fn requested_calls(response: &ChatResponse) -> Vec<ToolCall> {
    match &response.message.tool_calls {
        Some(calls) if !calls.is_empty() => calls.clone(),
        _ => parse_tool_calls_from_text(&response.message.content)
            .into_iter()
            .filter(|c| ToolKind::from_name(&c.function.name).is_some())
            .collect(),
    }
}

/// Rebuild the model transcript from stored messages
///
/// Tool messages are matched to the calls of the preceding assistant
/// message by position.
pub fn transcript_from_history(system_prompt: &str, messages: &[Message]) -> Vec<ChatMessage> {
    let mut transcript = Vec::with_capacity(messages.len() + 1);
    transcript.push(ChatMessage::system(system_prompt));

    let mut pending: VecDeque<String> = VecDeque::new();
    for message in messages {
        let content = message.content.clone().unwrap_or_default();
        match message.role {
            Role::User => transcript.push(ChatMessage::user(content)),
            Role::Assistant if message.tool_calls.is_empty() => {
                transcript.push(ChatMessage::assistant(content))
            }
            Role::Assistant => {
                pending = message.tool_calls.iter().map(|c| c.tool.clone()).collect();
                let calls = message
                    .tool_calls
                    .iter()
                    .map(|c| ToolCall::new(c.tool.clone(), c.arguments.clone()))
                    .collect();
                transcript.push(ChatMessage::assistant_with_calls(content, calls));
            }
            Role::Tool => {
                let name = pending.pop_front().unwrap_or_default();
                transcript.push(ChatMessage::tool(name, content));
            }
        }
    }
    transcript
}

/// Drop `<think>…</think>` blocks some models prepend to their answer
fn strip_reasoning(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

fn refusal_note(refusals: &[Refusal]) -> String {
    let mut seen: Vec<&str> = Vec::new();
    let mut lines = Vec::new();
    for refusal in refusals {
        if seen.contains(&refusal.command.as_str()) {
            continue;
        }
        seen.push(&refusal.command);
        lines.push(format!(
            "I refused to run `{}`: {}.",
            refusal.command, refusal.reason
        ));
    }
    lines.join("\n")
}

fn append_paragraph(reply: &mut String, paragraph: &str) {
    if paragraph.is_empty() {
        return;
    }
    if !reply.is_empty() {
        reply.push_str("\n\n");
    }
    reply.push_str(paragraph);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(role: Role, content: Option<&str>, calls: Vec<ToolCallRecord>) -> Message {
        Message {
            id: 0,
            conversation_id: "c".to_string(),
            role,
            content: content.map(str::to_string),
            tool_calls: calls,
            created_at: Utc::now(),
        }
    }

    fn record(tool: &str) -> ToolCallRecord {
        ToolCallRecord {
            tool: tool.to_string(),
            arguments: json!({}),
            result: json!({"ok": true}),
            is_error: false,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_tool_rounds, 6);
        assert_eq!(config.denied_repeat_limit, 2);
        assert!(config.system_prompt.is_none());
    }

    #[test]
    fn test_transcript_pairs_tool_results_with_calls() {
        let stored = vec![
            message(Role::User, Some("check things"), vec![]),
            message(Role::Assistant, None, vec![record("get_network_status"), record("run_shell")]),
            message(Role::Tool, Some("{\"state\":\"connected\"}"), vec![]),
            message(Role::Tool, Some("{\"exit_code\":0}"), vec![]),
            message(Role::Assistant, Some("All good."), vec![]),
        ];
        let transcript = transcript_from_history("sys", &stored);
        assert_eq!(transcript.len(), 6);
        assert_eq!(transcript[0].role, "system");
        assert_eq!(transcript[2].tool_calls.as_ref().unwrap().len(), 2);
        assert_eq!(transcript[3].tool_name.as_deref(), Some("get_network_status"));
        assert_eq!(transcript[4].tool_name.as_deref(), Some("run_shell"));
        assert_eq!(transcript[5].content, "All good.");
    }

    #[test]
    fn test_strip_reasoning() {
        assert_eq!(strip_reasoning("<think>hmm</think>\nDone."), "Done.");
        assert_eq!(strip_reasoning("a<think>x</think>b<think>y</think>c"), "abc");
        assert_eq!(strip_reasoning("<think>never closed"), "");
        assert_eq!(strip_reasoning("plain"), "plain");
    }

    #[test]
    fn test_text_calls_must_name_registered_tools() {
        let response: ChatResponse = serde_json::from_value(json!({
            "message": {"role": "assistant", "content": "{\"name\": \"usage\", \"arguments\": {}}"}
        }))
        .unwrap();
        assert!(requested_calls(&response).is_empty());

        let response: ChatResponse = serde_json::from_value(json!({
            "message": {"role": "assistant", "content": "{\"name\": \"run_shell\", \"arguments\": {\"command\": \"ls\"}}"}
        }))
        .unwrap();
        assert_eq!(requested_calls(&response).len(), 1);
    }

    #[test]
    fn test_native_calls_take_precedence() {
        let response: ChatResponse = serde_json::from_value(json!({
            "model": "chi",
            "message": {
                "role": "assistant",
                "content": "{\"name\": \"launch_app\", \"arguments\": {\"app\": \"x\"}}",
                "tool_calls": [{"function": {"name": "get_network_status", "arguments": {}}}]
            },
            "done": true
        }))
        .unwrap();
        let calls = requested_calls(&response);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "get_network_status");
    }

    #[test]
    fn test_denial_streak_resets_on_other_results() {
        let denied = |cmd: &str| Dispatch {
            name: "run_shell".to_string(),
            tool: Some(ToolKind::RunShell),
            inspection: false,
            result: Err(ToolError::SafetyDenied {
                command: cmd.to_string(),
                rule: "r".to_string(),
                reason: "no".to_string(),
            }),
            duration: Duration::ZERO,
        };
        let ok = Dispatch {
            result: Ok(json!({})),
            ..denied("ls")
        };

        let mut streak = DenialStreak::default();
        assert_eq!(streak.observe(&denied("rm -rf /")), 1);
        assert_eq!(streak.observe(&denied("rm -rf /")), 2);
        assert_eq!(streak.observe(&denied("mkfs /dev/sda")), 1);
        assert_eq!(streak.observe(&ok), 0);
        assert_eq!(streak.observe(&denied("mkfs /dev/sda")), 1);
    }

    #[test]
    fn test_refusal_note_deduplicates() {
        let refusal = Refusal {
            command: "rm -rf /".to_string(),
            reason: "recursive delete of the root filesystem".to_string(),
        };
        let note = refusal_note(&[refusal.clone(), refusal]);
        assert_eq!(note.lines().count(), 1);
        assert!(note.contains("refused"));
    }
}
