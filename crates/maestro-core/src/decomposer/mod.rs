//! Task decomposer: splits a task into a DAG of sub-tasks with roles,
//! tiers, and dependencies.
//!
//! Simple tasks stay whole. For the rest, LLM decomposition is tried
//! first (with the router's silent-fallback discipline); the heuristic
//! fallback assembles the classic {analyze, implement, test, document,
//! review} chain from whichever stage verbs appear in the prompt.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use maestro_db::models::{AgentRole, ModelTier};

use crate::llm::{LanguageModel, strip_code_fence};
use crate::oracle::complexity::{ComplexityAnalyzer, ComplexityTier};

/// One sub-task in a decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub prompt: String,
    pub recommended_role: AgentRole,
    pub recommended_model: ModelTier,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Rough effort score: 1 = simple, 2 = moderate, 3 = complex.
    pub estimated_complexity: u32,
}

/// How the sub-tasks can be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOrder {
    Sequential,
    Parallel,
    Mixed,
}

/// A validated decomposition.
#[derive(Debug, Clone, Serialize)]
pub struct DecomposedTask {
    pub original_task: String,
    pub subtasks: Vec<Subtask>,
    pub dependencies: HashMap<String, Vec<String>>,
    pub execution_order: ExecutionOrder,
    pub total_estimated_complexity: u32,
}

/// One heuristic stage: included when its verbs appear in the prompt.
struct Stage {
    name: &'static str,
    role: AgentRole,
    pattern: Regex,
    prompt_prefix: &'static str,
}

fn stage(name: &'static str, role: AgentRole, pattern: &str, prefix: &'static str) -> Stage {
    Stage {
        name,
        role,
        pattern: Regex::new(pattern).expect("invalid stage pattern"),
        prompt_prefix: prefix,
    }
}

/// The decomposer.
pub struct Decomposer {
    stages: Vec<Stage>,
    analyzer: ComplexityAnalyzer,
    llm: Option<Arc<dyn LanguageModel>>,
    llm_deadline: Duration,
    max_subtasks: usize,
}

impl Decomposer {
    pub fn new(llm: Option<Arc<dyn LanguageModel>>) -> Self {
        Self::with_max_subtasks(llm, 10)
    }

    pub fn with_max_subtasks(llm: Option<Arc<dyn LanguageModel>>, max_subtasks: usize) -> Self {
        Self {
            stages: vec![
                stage("analyze", AgentRole::Analyst,
                      r"(?i)\b(analy[sz]e|investigate|understand|assess)\b",
                      "Analyze the requirements and constraints for"),
                stage("implement", AgentRole::Coder,
                      r"(?i)\b(implement|build|create|develop|write|add)\b",
                      "Implement"),
                stage("test", AgentRole::Tester,
                      r"(?i)\b(test|verify|validate)\b",
                      "Write and run tests for"),
                stage("document", AgentRole::Scribe,
                      r"(?i)\b(document|describe|write-?up)\b",
                      "Document"),
                stage("review", AgentRole::Reviewer,
                      r"(?i)\b(review|audit)\b",
                      "Review the finished work for"),
            ],
            analyzer: ComplexityAnalyzer::new(),
            llm,
            llm_deadline: Duration::from_secs(15),
            max_subtasks,
        }
    }

    /// Decompose a task. Never fails: the worst case is a single-subtask
    /// plan.
    pub async fn decompose(&self, prompt: &str, context: Option<&str>) -> DecomposedTask {
        let assessment = self.analyzer.analyze(prompt, context);
        if assessment.tier == ComplexityTier::Simple {
            return self.single_subtask_plan(prompt, &assessment.tier);
        }

        if let Some(llm) = &self.llm {
            match self.decompose_via_llm(llm.as_ref(), prompt, context).await {
                Ok(plan) => return plan,
                Err(err) => {
                    tracing::debug!(error = %err, "LLM decomposition failed; using heuristics");
                }
            }
        }

        self.decompose_heuristic(prompt, context)
    }

    /// The verb-driven fallback chain.
    pub fn decompose_heuristic(&self, prompt: &str, context: Option<&str>) -> DecomposedTask {
        let text = match context {
            Some(ctx) => format!("{prompt}\n{ctx}"),
            None => prompt.to_owned(),
        };
        let assessment = self.analyzer.analyze(prompt, context);

        let matched: Vec<&Stage> = self
            .stages
            .iter()
            .filter(|s| s.pattern.is_match(&text))
            .take(self.max_subtasks)
            .collect();

        if matched.len() < 2 {
            return self.single_subtask_plan(prompt, &assessment.tier);
        }

        let per_stage_complexity = complexity_score(&assessment.tier);
        let mut subtasks = Vec::with_capacity(matched.len());
        for (i, stage) in matched.iter().enumerate() {
            let depends_on = if i == 0 {
                Vec::new()
            } else {
                vec![format!("s{}", i)]
            };
            subtasks.push(Subtask {
                id: format!("s{}", i + 1),
                prompt: format!("{} the task: {prompt}", stage.prompt_prefix),
                recommended_role: stage.role,
                recommended_model: assessment.recommended_model,
                depends_on,
                estimated_complexity: per_stage_complexity,
            });
        }

        tracing::debug!(
            stages = %matched.iter().map(|s| s.name).collect::<Vec<_>>().join(","),
            "heuristic decomposition"
        );
        assemble(prompt, subtasks)
    }

    fn single_subtask_plan(&self, prompt: &str, tier: &ComplexityTier) -> DecomposedTask {
        let subtask = Subtask {
            id: "s1".to_string(),
            prompt: prompt.to_owned(),
            recommended_role: AgentRole::Generalist,
            recommended_model: tier.recommended_model(),
            depends_on: Vec::new(),
            estimated_complexity: complexity_score(tier),
        };
        assemble(prompt, vec![subtask])
    }

    async fn decompose_via_llm(
        &self,
        llm: &dyn LanguageModel,
        prompt: &str,
        context: Option<&str>,
    ) -> anyhow::Result<DecomposedTask> {
        let request = format!(
            "Split this task into at most {max} sub-tasks forming a dependency DAG.\n\
             Task:\n{prompt}\n{context}\n\n\
             Answer with ONLY a JSON array of objects:\n\
             [{{\"id\": \"s1\", \"prompt\": string,\n\
             \"recommended_role\": one of [coder, tester, analyst, reviewer, generalist, \
             oracle, architect, debugger, researcher, scribe],\n\
             \"recommended_model\": one of [haiku, sonnet, opus],\n\
             \"depends_on\": [ids], \"estimated_complexity\": 1-3}}]",
            max = self.max_subtasks,
            context = context.unwrap_or(""),
        );

        let answer = llm.complete(&request, self.llm_deadline).await?;
        let subtasks: Vec<Subtask> = serde_json::from_str(strip_code_fence(&answer))?;
        validate_subtasks(&subtasks, self.max_subtasks)?;
        Ok(assemble(prompt, subtasks))
    }
}

fn complexity_score(tier: &ComplexityTier) -> u32 {
    match tier {
        ComplexityTier::Simple => 1,
        ComplexityTier::Moderate => 2,
        ComplexityTier::Complex => 3,
    }
}

/// Derive the dependency map and execution order, then wrap everything up.
fn assemble(original: &str, subtasks: Vec<Subtask>) -> DecomposedTask {
    let dependencies: HashMap<String, Vec<String>> = subtasks
        .iter()
        .map(|s| (s.id.clone(), s.depends_on.clone()))
        .collect();

    let execution_order = derive_execution_order(&subtasks);
    let total_estimated_complexity = subtasks.iter().map(|s| s.estimated_complexity).sum();

    DecomposedTask {
        original_task: original.to_owned(),
        subtasks,
        dependencies,
        execution_order,
        total_estimated_complexity,
    }
}

/// Sequential when every non-first subtask has a dependency, parallel
/// when none does, mixed otherwise.
fn derive_execution_order(subtasks: &[Subtask]) -> ExecutionOrder {
    if subtasks.len() <= 1 {
        return ExecutionOrder::Sequential;
    }
    let with_deps = subtasks
        .iter()
        .skip(1)
        .filter(|s| !s.depends_on.is_empty())
        .count();
    let rest = subtasks.len() - 1;
    let first_has_deps = !subtasks[0].depends_on.is_empty();

    if with_deps == rest {
        ExecutionOrder::Sequential
    } else if with_deps == 0 && !first_has_deps {
        ExecutionOrder::Parallel
    } else {
        ExecutionOrder::Mixed
    }
}

/// Reject duplicate ids, unknown dependency references, oversize plans,
/// and cycles.
fn validate_subtasks(subtasks: &[Subtask], max: usize) -> anyhow::Result<()> {
    if subtasks.is_empty() {
        anyhow::bail!("decomposition produced no subtasks");
    }
    if subtasks.len() > max {
        anyhow::bail!("decomposition produced {} subtasks (max {max})", subtasks.len());
    }

    let ids: HashSet<&str> = subtasks.iter().map(|s| s.id.as_str()).collect();
    if ids.len() != subtasks.len() {
        anyhow::bail!("duplicate subtask ids");
    }
    for s in subtasks {
        for dep in &s.depends_on {
            if !ids.contains(dep.as_str()) {
                anyhow::bail!("subtask {} depends on unknown id {dep}", s.id);
            }
            if dep == &s.id {
                anyhow::bail!("subtask {} depends on itself", s.id);
            }
        }
    }

    // Cycle check: repeatedly peel subtasks whose deps are all peeled.
    let mut remaining: HashMap<&str, Vec<&str>> = subtasks
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.iter().map(String::as_str).collect()))
        .collect();
    let mut peeled: HashSet<&str> = HashSet::new();
    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| peeled.contains(d)))
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in ready {
            remaining.remove(id);
            peeled.insert(id);
        }
    }
    if !remaining.is_empty() {
        anyhow::bail!("dependency cycle in decomposition");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[tokio::test]
    async fn simple_tasks_stay_whole() {
        let d = Decomposer::new(None);
        let plan = d.decompose("summarize the meeting notes", None).await;
        assert_eq!(plan.subtasks.len(), 1);
        assert_eq!(plan.execution_order, ExecutionOrder::Sequential);
        assert_eq!(plan.subtasks[0].recommended_model, ModelTier::Haiku);
    }

    #[tokio::test]
    async fn stage_verbs_build_a_sequential_chain() {
        let d = Decomposer::new(None);
        let plan = d
            .decompose(
                "implement the importer, test the edge cases, and document the format",
                None,
            )
            .await;

        assert_eq!(plan.subtasks.len(), 3);
        assert_eq!(plan.subtasks[0].recommended_role, AgentRole::Coder);
        assert_eq!(plan.subtasks[1].recommended_role, AgentRole::Tester);
        assert_eq!(plan.subtasks[2].recommended_role, AgentRole::Scribe);
        assert!(plan.subtasks[0].depends_on.is_empty());
        assert_eq!(plan.subtasks[1].depends_on, vec!["s1".to_string()]);
        assert_eq!(plan.subtasks[2].depends_on, vec!["s2".to_string()]);
        assert_eq!(plan.execution_order, ExecutionOrder::Sequential);
        assert_eq!(plan.dependencies["s3"], vec!["s2".to_string()]);
    }

    #[tokio::test]
    async fn single_stage_verbs_do_not_split() {
        let d = Decomposer::new(None);
        let plan = d.decompose("implement the retry helper", None).await;
        assert_eq!(plan.subtasks.len(), 1);
    }

    #[test]
    fn execution_order_detects_parallel_and_mixed() {
        let s = |id: &str, deps: Vec<&str>| Subtask {
            id: id.to_string(),
            prompt: String::new(),
            recommended_role: AgentRole::Generalist,
            recommended_model: ModelTier::Sonnet,
            depends_on: deps.into_iter().map(String::from).collect(),
            estimated_complexity: 1,
        };

        let parallel = vec![s("a", vec![]), s("b", vec![]), s("c", vec![])];
        assert_eq!(derive_execution_order(&parallel), ExecutionOrder::Parallel);

        let mixed = vec![s("a", vec![]), s("b", vec![]), s("c", vec!["a", "b"])];
        assert_eq!(derive_execution_order(&mixed), ExecutionOrder::Mixed);
    }

    #[test]
    fn cycles_are_rejected() {
        let s = |id: &str, deps: Vec<&str>| Subtask {
            id: id.to_string(),
            prompt: String::new(),
            recommended_role: AgentRole::Generalist,
            recommended_model: ModelTier::Sonnet,
            depends_on: deps.into_iter().map(String::from).collect(),
            estimated_complexity: 1,
        };
        let cyclic = vec![s("a", vec!["b"]), s("b", vec!["a"])];
        assert!(validate_subtasks(&cyclic, 10).is_err());
    }

    struct CannedLlm(String);

    #[async_trait]
    impl LanguageModel for CannedLlm {
        fn name(&self) -> &str {
            "canned"
        }
        async fn complete(&self, _prompt: &str, _deadline: Duration) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn llm_plans_are_validated_and_used() {
        let llm = Arc::new(CannedLlm(
            r#"[{"id":"s1","prompt":"sketch","recommended_role":"architect",
                 "recommended_model":"opus","depends_on":[],"estimated_complexity":3},
                {"id":"s2","prompt":"build","recommended_role":"coder",
                 "recommended_model":"sonnet","depends_on":["s1"],"estimated_complexity":2}]"#
                .to_string(),
        ));
        let d = Decomposer::new(Some(llm));
        let plan = d.decompose("design and build the scheduler", None).await;
        assert_eq!(plan.subtasks.len(), 2);
        assert_eq!(plan.total_estimated_complexity, 5);
        assert_eq!(plan.execution_order, ExecutionOrder::Sequential);
    }

    #[tokio::test]
    async fn cyclic_llm_plans_fall_back_to_heuristics() {
        let llm = Arc::new(CannedLlm(
            r#"[{"id":"s1","prompt":"a","recommended_role":"coder",
                 "recommended_model":"sonnet","depends_on":["s2"],"estimated_complexity":1},
                {"id":"s2","prompt":"b","recommended_role":"tester",
                 "recommended_model":"sonnet","depends_on":["s1"],"estimated_complexity":1}]"#
                .to_string(),
        ));
        let d = Decomposer::new(Some(llm));
        let plan = d
            .decompose("implement the importer and test the edge cases", None)
            .await;
        // The heuristic chain is acyclic by construction.
        assert!(validate_subtasks(&plan.subtasks, 10).is_ok());
        assert_eq!(plan.subtasks.len(), 2);
    }
}
