//! Shared fixtures: a scripted model endpoint and a recording command runner

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use chi_agent::agent::{AgentConfig, AgentController};
use chi_agent::history::HistoryStore;
use chi_agent::ollama::{ChatError, ChatMessage, ChatResponse, ModelEndpoint, Tool, ToolCall};
use chi_agent::security::SafetyGuard;
use chi_agent::tools::{CommandOutput, CommandRunner, CommandSpec, RunError, ToolRegistry, ToolsConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Model
// ─────────────────────────────────────────────────────────────────────────────

pub fn text_response(content: &str) -> ChatResponse {
    ChatResponse {
        message: ChatMessage::assistant(content),
        done: true,
        model: "scripted".to_string(),
        eval_count: 0,
        eval_duration: 0,
    }
}

pub fn call_response(name: &str, arguments: Value) -> ChatResponse {
    ChatResponse {
        message: ChatMessage::assistant_with_calls("", vec![ToolCall::new(name, arguments)]),
        done: true,
        model: "scripted".to_string(),
        eval_count: 0,
        eval_duration: 0,
    }
}

/// Answers from a fixed script; says "done" once the script runs out
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ChatResponse, ChatError>>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<ChatResponse, ChatError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn replies(script: Vec<ChatResponse>) -> Self {
        Self::new(script.into_iter().map(Ok).collect())
    }

    /// Hold every call open for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Transcripts received, one per call
    pub fn transcripts(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Highest number of calls that were in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelEndpoint for ScriptedModel {
    async fn chat(&self, messages: &[ChatMessage], _tools: &[Tool]) -> Result<ChatResponse, ChatError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        self.active.fetch_sub(1, Ordering::SeqCst);
        next.unwrap_or_else(|| Ok(text_response("done")))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

pub fn unavailable() -> ChatError {
    ChatError::Status {
        status: 503,
        body: "model is loading".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

type Responder = Box<dyn Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync>;

/// Records every command instead of running it
pub struct SpyRunner {
    installed: Vec<String>,
    respond: Responder,
    runs: Mutex<Vec<String>>,
}

impl SpyRunner {
    pub fn new(
        installed: &[&str],
        respond: impl Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            installed: installed.iter().map(|s| s.to_string()).collect(),
            respond: Box::new(respond),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Every program present, every command succeeds with empty output
    pub fn permissive() -> Self {
        Self::new(
            &["sh", "flatpak", "rpm-ostree", "nmcli", "systemctl", "envclone"],
            |_| ok(""),
        )
    }

    pub fn commands(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for SpyRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        self.runs.lock().unwrap().push(spec.display());
        (self.respond)(spec)
    }

    fn spawn_detached(&self, spec: &CommandSpec) -> Result<u32, RunError> {
        self.runs.lock().unwrap().push(spec.display());
        Ok(4242)
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        self.installed
            .iter()
            .any(|p| p == program)
            .then(|| PathBuf::from("/usr/bin").join(program))
    }
}

pub fn ok(stdout: &str) -> Result<CommandOutput, RunError> {
    Ok(CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

pub fn registry(runner: Arc<SpyRunner>) -> Arc<ToolRegistry> {
    Arc::new(ToolRegistry::new(
        runner,
        Arc::new(SafetyGuard::with_defaults()),
        ToolsConfig::default(),
    ))
}

pub struct Harness {
    pub controller: Arc<AgentController>,
    pub model: Arc<ScriptedModel>,
    pub runner: Arc<SpyRunner>,
}

impl Harness {
    pub fn new(model: ScriptedModel, runner: SpyRunner) -> Self {
        Self::with_config(model, runner, AgentConfig::default())
    }

    pub fn with_config(model: ScriptedModel, runner: SpyRunner, config: AgentConfig) -> Self {
        let model = Arc::new(model);
        let runner = Arc::new(runner);
        let history = HistoryStore::in_memory(2).expect("in-memory store");
        let endpoint: Arc<dyn ModelEndpoint> = model.clone();
        let controller = AgentController::new(endpoint, registry(runner.clone()), Arc::new(history), config)
            .with_retry_backoff(Duration::from_millis(1));
        Self {
            controller: Arc::new(controller),
            model,
            runner,
        }
    }
}
