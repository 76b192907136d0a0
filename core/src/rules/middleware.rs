// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Injects merged rule content into the system prompt on every model
//! call.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use chrono::Utc;
use dataagent_protocol::EventMsg;
use dataagent_protocol::RuleConflict;
use dataagent_protocol::RulesAppliedEvent;
use dataagent_protocol::TriggeredRule;
use uuid::Uuid;

use crate::middleware::AgentState;
use crate::middleware::Middleware;
use crate::middleware::ModelRequest;
use crate::middleware::StateUpdate;
use crate::rules::matcher::MatchContext;
use crate::rules::matcher::RuleMatcher;
use crate::rules::merger::RuleMerger;
use crate::rules::models::RuleEvaluationTrace;
use crate::rules::store::RuleStore;

pub type RuleEventCallback = Box<dyn Fn(EventMsg) + Send + Sync>;

pub struct RulesMiddleware {
    store: Arc<dyn RuleStore>,
    matcher: RuleMatcher,
    merger: RuleMerger,
    debug_mode: AtomicBool,
    last_trace: Mutex<Option<RuleEvaluationTrace>>,
    event_callback: Option<RuleEventCallback>,
}

impl RulesMiddleware {
    pub fn new(
        store: Arc<dyn RuleStore>,
        max_content_size: usize,
        debug_mode: bool,
        event_callback: Option<RuleEventCallback>,
    ) -> Self {
        Self {
            store,
            matcher: RuleMatcher::new(),
            merger: RuleMerger::new(max_content_size),
            debug_mode: AtomicBool::new(debug_mode),
            last_trace: Mutex::new(None),
            event_callback,
        }
    }

    pub fn set_debug_mode(&self, enabled: bool) {
        self.debug_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn last_trace(&self) -> Option<RuleEvaluationTrace> {
        self.last_trace.lock().unwrap().clone()
    }

    /// Rule names applied on the most recent model call.
    pub fn triggered_rules(&self) -> Vec<String> {
        self.last_trace
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.final_rules.clone())
            .unwrap_or_default()
    }

    fn build_match_context(&self, request: &ModelRequest) -> MatchContext {
        let mut user_query = String::new();
        let mut current_files = Vec::new();
        for message in &request.messages {
            user_query = message.content.clone();
            current_files.extend(self.matcher.extract_file_references(&message.content));
        }
        let manual_rules = self.matcher.extract_manual_references(&user_query);
        MatchContext {
            current_files,
            user_query,
            session_id: request.state.session_id.clone(),
            assistant_id: request.state.assistant_id.clone(),
            manual_rules,
        }
    }

    fn build_debug_section(trace: &RuleEvaluationTrace) -> String {
        let mut lines = vec![
            "\n---".to_string(),
            "## [DEBUG] Rule Evaluation Trace".to_string(),
            format!("Request ID: {}", trace.request_id),
            format!("Evaluated: {} rules", trace.evaluated_rules.len()),
            format!("Matched: {} rules", trace.matched_rules.len()),
            format!("Final: {} rules", trace.final_rules.len()),
            format!("Total Size: {} bytes", trace.total_content_size),
        ];
        if !trace.skipped_rules.is_empty() {
            lines.push("### Skipped Rules:".to_string());
            for (name, reason) in trace.skipped_rules.iter().take(10) {
                lines.push(format!("- {name}: {reason}"));
            }
            if trace.skipped_rules.len() > 10 {
                lines.push(format!("  ... and {} more", trace.skipped_rules.len() - 10));
            }
        }
        if !trace.conflicts.is_empty() {
            lines.push("### Conflicts:".to_string());
            for (winner, loser, reason) in &trace.conflicts {
                lines.push(format!("- {winner} vs {loser}: {reason}"));
            }
        }
        lines.push("---\n".to_string());
        lines.join("\n")
    }

    fn emit_applied_event(&self, trace: &RuleEvaluationTrace) {
        let Some(callback) = &self.event_callback else {
            return;
        };
        let event = EventMsg::RulesApplied(RulesAppliedEvent {
            triggered_rules: trace
                .matched_rules
                .iter()
                .map(|m| TriggeredRule {
                    name: m.rule.name.clone(),
                    scope: m.rule.scope.to_string(),
                    match_reason: m.match_reason.clone(),
                })
                .collect(),
            skipped_count: trace.skipped_rules.len() as u64,
            conflicts: trace
                .conflicts
                .iter()
                .map(|(winner, loser, reason)| RuleConflict {
                    rule1: winner.clone(),
                    rule2: loser.clone(),
                    reason: reason.clone(),
                })
                .collect(),
            total_size: trace.total_content_size as u64,
        });
        callback(event);
    }
}

impl Middleware for RulesMiddleware {
    fn name(&self) -> &'static str {
        "rules"
    }

    /// Reload rules so each round picks up external edits.
    fn before_agent_state_update(&self, _state: &AgentState) -> Option<StateUpdate> {
        if let Err(e) = self.store.reload() {
            tracing::warn!("rule store reload failed: {e}");
        }
        let mut update = StateUpdate::new();
        update.insert("rules_loaded".to_string(), serde_json::Value::Bool(true));
        Some(update)
    }

    fn wrap_model_call(&self, request: ModelRequest) -> ModelRequest {
        let context = self.build_match_context(&request);
        let all_rules = self.store.list_rules(None);
        let (matched, skipped) = self.matcher.match_rules(&all_rules, &context);
        let (final_rules, conflicts) = self.merger.merge_rules(&matched);

        let trace = RuleEvaluationTrace {
            request_id: Uuid::new_v4().to_string()[..8].to_string(),
            timestamp: Utc::now(),
            evaluated_rules: all_rules.iter().map(|r| r.name.clone()).collect(),
            matched_rules: matched,
            skipped_rules: skipped,
            conflicts,
            final_rules: final_rules.iter().map(|r| r.name.clone()).collect(),
            total_content_size: final_rules.iter().map(|r| r.content.len()).sum(),
        };
        self.emit_applied_event(&trace);

        let mut section = self.merger.build_prompt_section(&final_rules);
        if self.debug_mode.load(Ordering::Relaxed) {
            section.push_str(&Self::build_debug_section(&trace));
        }
        *self.last_trace.lock().unwrap() = Some(trace);

        request.append_system_prompt(&section)
    }
}
