//! Prometheus metrics for the agent runtime
//!
//! All metrics live in the default global registry so the status endpoint
//! can render them with a single `TextEncoder` pass.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec,
    CounterVec, Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Loop
    // ─────────────────────────────────────────────────────────────────────────────

    /// Completed turns by outcome.
    ///
    /// Labels:
    /// - outcome: "reply", "round_limit", "refused", "unavailable", "error"
    pub static ref AGENT_TURNS: CounterVec = register_counter_vec!(
        "chi_agent_turns_total",
        "Agent turns by outcome",
        &["outcome"]
    ).expect("failed to register AGENT_TURNS metric");

    /// Tool-call rounds used per turn.
    pub static ref AGENT_TOOL_ROUNDS: Histogram = register_histogram!(
        "chi_agent_tool_rounds",
        "Tool-call rounds per turn",
        vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0]
    ).expect("failed to register AGENT_TOOL_ROUNDS metric");

    /// Turns currently executing.
    pub static ref TURNS_IN_FLIGHT: Gauge = register_gauge!(
        "chi_agent_turns_in_flight",
        "Turns currently executing"
    ).expect("failed to register TURNS_IN_FLIGHT metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Model Endpoint
    // ─────────────────────────────────────────────────────────────────────────────

    /// Model call latency by model name.
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "chi_agent_llm_call_duration_seconds",
        "Latency of model endpoint calls",
        &["model"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register LLM_CALL_DURATION metric");

    /// Failed model calls by reason.
    ///
    /// Labels:
    /// - reason: "transient" (retried or unavailable) or "fatal"
    pub static ref LLM_CALL_FAILURES: CounterVec = register_counter_vec!(
        "chi_agent_llm_call_failures_total",
        "Failed model endpoint calls",
        &["reason"]
    ).expect("failed to register LLM_CALL_FAILURES metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Tool Dispatch
    // ─────────────────────────────────────────────────────────────────────────────

    /// Tool dispatches by tool name and result kind.
    ///
    /// Labels:
    /// - tool: registered tool name, or "unknown"
    /// - result: "ok" or a ToolError kind ("invalid_argument", "safety_denied", ...)
    pub static ref TOOL_CALLS: CounterVec = register_counter_vec!(
        "chi_agent_tool_calls_total",
        "Tool dispatches by tool and result",
        &["tool", "result"]
    ).expect("failed to register TOOL_CALLS metric");

    /// Tool dispatch duration by tool name.
    pub static ref TOOL_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "chi_agent_tool_call_duration_seconds",
        "Tool dispatch duration",
        &["tool"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 120.0, 300.0]
    ).expect("failed to register TOOL_CALL_DURATION metric");

    /// Shell commands refused by the safety guard, by rule name.
    pub static ref SAFETY_DENIALS: CounterVec = register_counter_vec!(
        "chi_agent_safety_denials_total",
        "Shell commands refused by a deny rule",
        &["rule"]
    ).expect("failed to register SAFETY_DENIALS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Transports
    // ─────────────────────────────────────────────────────────────────────────────

    /// Requests received per front end and method.
    ///
    /// Labels:
    /// - transport: "grpc" or "mcp"
    /// - method: RPC / JSON-RPC method name
    pub static ref TRANSPORT_REQUESTS: CounterVec = register_counter_vec!(
        "chi_agent_transport_requests_total",
        "Requests per transport and method",
        &["transport", "method"]
    ).expect("failed to register TRANSPORT_REQUESTS metric");
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_touched_metrics() {
        TOOL_CALLS.with_label_values(&["run_shell", "ok"]).inc();
        let text = render();
        assert!(text.contains("chi_agent_tool_calls_total"));
    }
}
