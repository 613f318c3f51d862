//! Task router: classifies a prompt into a role and model tier, and
//! decides whether to spawn capacity or decompose the task first.
//!
//! Heuristic mode is always available and is the fallback for everything;
//! LLM mode builds a short prompt from the fleet snapshot and validates
//! the returned JSON against the enum vocabulary. Malformed JSON or a
//! missing provider degrades silently to heuristics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use maestro_db::models::{AgentRole, MissionKind, ModelTier};

use crate::llm::{LanguageModel, strip_code_fence};
use crate::oracle::complexity::{ComplexityAnalyzer, ComplexityTier};

/// Fixed confidence reported by the heuristic path.
const HEURISTIC_CONFIDENCE: f64 = 0.7;

/// What the router recommends for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub recommended_role: AgentRole,
    pub recommended_model: ModelTier,
    pub should_spawn: bool,
    #[serde(default)]
    pub spawn_reason: Option<String>,
    pub should_decompose: bool,
    #[serde(default)]
    pub decomposition_hint: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
}

/// Fleet snapshot the router consults.
#[derive(Debug, Clone, Default)]
pub struct FleetView {
    pub idle_by_role: HashMap<AgentRole, usize>,
    pub queue_depth: usize,
    /// One-line-per-agent summary embedded in the LLM prompt.
    pub agents_summary: String,
}

struct RoleRule {
    category: &'static str,
    role: AgentRole,
    pattern: Regex,
}

fn rule(category: &'static str, role: AgentRole, pattern: &str) -> RoleRule {
    RoleRule {
        category,
        role,
        pattern: Regex::new(pattern).expect("invalid router pattern"),
    }
}

/// The router. Classifier tables compile once at construction.
pub struct Router {
    rules: Vec<RoleRule>,
    action_verbs: Vec<Regex>,
    connectives: Regex,
    numbered_list: Regex,
    analyzer: ComplexityAnalyzer,
    llm: Option<Arc<dyn LanguageModel>>,
    llm_deadline: Duration,
}

impl Router {
    pub fn new(llm: Option<Arc<dyn LanguageModel>>) -> Self {
        Self {
            rules: vec![
                rule("code", AgentRole::Coder,
                     r"(?i)\b(implement|code|coding|function|endpoint|api|class|module|library)\b"),
                rule("test", AgentRole::Tester,
                     r"(?i)\b(tests?|testing|coverage|assertions?|regression)\b"),
                rule("review", AgentRole::Reviewer,
                     r"(?i)\b(review|audit|critique|inspect)\b"),
                rule("architecture", AgentRole::Architect,
                     r"(?i)\b(architecture|architect|schema|blueprint)\b|design the system"),
                rule("debug", AgentRole::Debugger,
                     r"(?i)\b(debug|bug|crash|stack ?trace|diagnose)\b"),
                rule("research", AgentRole::Researcher,
                     r"(?i)\b(research|investigate|explore|compare|survey)\b"),
                rule("docs", AgentRole::Scribe,
                     r"(?i)\b(document|documentation|readme|guide|changelog|write-?up)\b"),
                rule("analysis", AgentRole::Analyst,
                     r"(?i)\b(analy[sz]e|analysis|metrics|report|trends|statistics)\b"),
            ],
            action_verbs: [
                r"(?i)\bimplement\b",
                r"(?i)\b(write|build|create|develop)\b",
                r"(?i)\btest\b",
                r"(?i)\bdocument\b",
                r"(?i)\breview\b",
                r"(?i)\banaly[sz]e\b",
                r"(?i)\brefactor\b",
                r"(?i)\b(deploy|release)\b",
                r"(?i)\b(fix|debug)\b",
                r"(?i)\b(design|architect)\b",
            ]
            .iter()
            .map(|p| Regex::new(p).expect("invalid verb pattern"))
            .collect(),
            connectives: Regex::new(r"(?i)\b(and|then|with)\b").expect("invalid connective pattern"),
            numbered_list: Regex::new(r"(?m)^\s*\d+[.)]\s").expect("invalid list pattern"),
            analyzer: ComplexityAnalyzer::new(),
            llm,
            llm_deadline: Duration::from_secs(10),
        }
    }

    /// Route a task, preferring the LLM when one is wired in.
    ///
    /// `learnings` are short high-confidence insight lines embedded in the
    /// LLM prompt for context.
    pub async fn route(
        &self,
        prompt: &str,
        context: Option<&str>,
        kind_hint: Option<MissionKind>,
        view: &FleetView,
        learnings: &[String],
    ) -> RoutingDecision {
        if let Some(llm) = &self.llm {
            match self.route_via_llm(llm.as_ref(), prompt, context, view, learnings).await {
                Ok(decision) => return decision,
                Err(err) => {
                    tracing::debug!(error = %err, "LLM routing failed; using heuristics");
                }
            }
        }
        self.route_heuristic(prompt, context, kind_hint, view)
    }

    /// Keyword classification; always available.
    pub fn route_heuristic(
        &self,
        prompt: &str,
        context: Option<&str>,
        kind_hint: Option<MissionKind>,
        view: &FleetView,
    ) -> RoutingDecision {
        let text = match context {
            Some(ctx) => format!("{prompt}\n{ctx}"),
            None => prompt.to_owned(),
        };

        let matched: Vec<&RoleRule> = self
            .rules
            .iter()
            .filter(|r| r.pattern.is_match(&text))
            .collect();
        let recommended_role = matched
            .first()
            .map(|r| r.role)
            .or_else(|| kind_hint.map(crate::oracle::dispatch_role_for_kind))
            .unwrap_or(AgentRole::Generalist);

        let assessment = self.analyzer.analyze(prompt, context);
        let recommended_model = assessment.recommended_model;

        let idle_of_role = view
            .idle_by_role
            .get(&recommended_role)
            .copied()
            .unwrap_or(0);
        let should_spawn = idle_of_role == 0 && view.queue_depth >= 3;
        let spawn_reason = should_spawn.then(|| {
            format!(
                "no idle {recommended_role} and {} missions queued",
                view.queue_depth
            )
        });

        let verb_count = self
            .action_verbs
            .iter()
            .filter(|v| v.is_match(&text))
            .count();
        let has_connective = self.connectives.is_match(&text);
        let distinct_categories = matched.len();
        let should_decompose = verb_count >= 2
            || (has_connective && distinct_categories >= 2)
            || self.numbered_list.is_match(&text)
            || (assessment.tier == ComplexityTier::Complex && has_connective);
        let decomposition_hint = should_decompose.then(|| {
            format!("{verb_count} action verbs across {distinct_categories} task categories")
        });

        let reasoning = if matched.is_empty() {
            format!("no keyword match; defaulting to {recommended_role} ({})", assessment.reasoning)
        } else {
            format!(
                "matched categories [{}]; {}",
                matched
                    .iter()
                    .map(|r| r.category)
                    .collect::<Vec<_>>()
                    .join(", "),
                assessment.reasoning
            )
        };

        RoutingDecision {
            recommended_role,
            recommended_model,
            should_spawn,
            spawn_reason,
            should_decompose,
            decomposition_hint,
            confidence: HEURISTIC_CONFIDENCE,
            reasoning,
        }
    }

    async fn route_via_llm(
        &self,
        llm: &dyn LanguageModel,
        prompt: &str,
        context: Option<&str>,
        view: &FleetView,
        learnings: &[String],
    ) -> anyhow::Result<RoutingDecision> {
        let learnings_block = if learnings.is_empty() {
            String::from("(none)")
        } else {
            learnings.join("\n")
        };

        let request = format!(
            "You route tasks to specialist agents.\n\
             Available agents:\n{agents}\n\
             Queue depth: {depth}\n\
             Relevant learnings:\n{learnings_block}\n\n\
             Task:\n{prompt}\n{context}\n\n\
             Answer with ONLY a JSON object:\n\
             {{\"recommended_role\": one of [coder, tester, analyst, reviewer, generalist, \
             oracle, architect, debugger, researcher, scribe],\n\
             \"recommended_model\": one of [haiku, sonnet, opus],\n\
             \"should_spawn\": bool, \"spawn_reason\": string or null,\n\
             \"should_decompose\": bool, \"decomposition_hint\": string or null,\n\
             \"confidence\": number in [0,1], \"reasoning\": string}}",
            agents = if view.agents_summary.is_empty() {
                "(none)"
            } else {
                view.agents_summary.as_str()
            },
            depth = view.queue_depth,
            context = context.unwrap_or(""),
        );

        let answer = llm.complete(&request, self.llm_deadline).await?;
        let mut decision: RoutingDecision = serde_json::from_str(strip_code_fence(&answer))?;
        decision.confidence = decision.confidence.clamp(0.0, 1.0);
        Ok(decision)
    }
}
