//! Regex-table task complexity analyzer.
//!
//! The classifier tables are data: each tier owns a list of named signal
//! patterns, compiled once at construction. First complex signal wins,
//! then moderate, then simple; no signal at all lands on the middle tier.

use regex::Regex;

use maestro_db::models::ModelTier;

/// Complexity band of a task prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComplexityTier {
    Simple,
    Moderate,
    Complex,
}

impl ComplexityTier {
    /// The model tier this complexity band calls for.
    pub fn recommended_model(self) -> ModelTier {
        match self {
            Self::Simple => ModelTier::Haiku,
            Self::Moderate => ModelTier::Sonnet,
            Self::Complex => ModelTier::Opus,
        }
    }
}

impl std::fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        };
        f.write_str(s)
    }
}

/// Outcome of analyzing one prompt.
#[derive(Debug, Clone)]
pub struct ComplexityAssessment {
    pub tier: ComplexityTier,
    pub recommended_model: ModelTier,
    pub reasoning: String,
    pub signals: Vec<String>,
}

/// One named signal pattern.
struct Signal {
    name: &'static str,
    pattern: Regex,
}

fn signal(name: &'static str, pattern: &str) -> Signal {
    Signal {
        name,
        // Patterns are compile-time constants; a failure here is a bug.
        pattern: Regex::new(pattern).expect("invalid complexity signal pattern"),
    }
}

/// Compiled classifier tables.
pub struct ComplexityAnalyzer {
    complex: Vec<Signal>,
    moderate: Vec<Signal>,
    simple: Vec<Signal>,
}

impl ComplexityAnalyzer {
    pub fn new() -> Self {
        Self {
            complex: vec![
                signal("architecture", r"(?i)\barchitect(ure|ural)?\b|system design|design the system"),
                signal("multi_file_refactor", r"(?i)refactor\b.*\b(across|multiple|all|every)\b|multi-?file"),
                signal("greenfield", r"(?i)from scratch|greenfield|new (service|system|subsystem|module)"),
                signal("algorithm_optimization", r"(?i)optimi[sz]e\b.*\balgorithm|algorithmic complexity|big-?o\b"),
                signal("security_analysis", r"(?i)security (audit|analysis|review)|vulnerabilit|threat model"),
                signal("complex_debugging", r"(?i)race condition|deadlock|memory leak|data corruption|nondeterministic"),
                signal("design_decision", r"(?i)trade-?offs?|design decision|evaluate (approaches|options|alternatives)"),
            ],
            moderate: vec![
                signal("feature_implementation", r"(?i)\b(implement|build|create|develop)\b"),
                signal("bug_fix", r"(?i)fix (a |the )?(bug|crash|failure)|bugfix|resolve (the )?issue"),
                signal("testing", r"(?i)(write|add|extend) (unit |integration )?tests?|test coverage"),
                signal("code_review", r"(?i)code review|review (this|the) (pr|patch|change|diff)"),
                signal("modification", r"(?i)\b(update|modify|change|extend|improve)\b"),
            ],
            simple: vec![
                signal("file_read", r"(?i)\bread (the )?file\b|\bshow (me )?the contents\b"),
                signal("search", r"(?i)\b(search|find|grep|locate|list)\b"),
                signal("formatting", r"(?i)\b(format|reformat|lint|tidy)\b"),
                signal("simple_refactor", r"(?i)\brename\b|inline (a |the )?variable|extract (a |the )?constant"),
                signal("summarization", r"(?i)\bsummari[sz]e\b|\btl;?dr\b|one-?line description"),
            ],
        }
    }

    /// Classify a prompt (plus optional context) into a complexity tier.
    pub fn analyze(&self, prompt: &str, context: Option<&str>) -> ComplexityAssessment {
        let text = match context {
            Some(ctx) => format!("{prompt}\n{ctx}"),
            None => prompt.to_owned(),
        };

        for (tier, table) in [
            (ComplexityTier::Complex, &self.complex),
            (ComplexityTier::Moderate, &self.moderate),
            (ComplexityTier::Simple, &self.simple),
        ] {
            let signals: Vec<String> = table
                .iter()
                .filter(|s| s.pattern.is_match(&text))
                .map(|s| s.name.to_string())
                .collect();
            if !signals.is_empty() {
                return ComplexityAssessment {
                    tier,
                    recommended_model: tier.recommended_model(),
                    reasoning: format!("matched {tier} signals: {}", signals.join(", ")),
                    signals,
                };
            }
        }

        ComplexityAssessment {
            tier: ComplexityTier::Moderate,
            recommended_model: ModelTier::Sonnet,
            reasoning: "no classifier signal matched; defaulting to the middle tier".to_string(),
            signals: Vec::new(),
        }
    }
}

impl Default for ComplexityAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_prompts_are_complex() {
        let analyzer = ComplexityAnalyzer::new();
        let a = analyzer.analyze("Design the system architecture for module N", None);
        assert_eq!(a.tier, ComplexityTier::Complex);
        assert_eq!(a.recommended_model, ModelTier::Opus);
        assert!(a.signals.iter().any(|s| s == "architecture"));
    }

    #[test]
    fn debugging_signals_outrank_moderate_ones() {
        let analyzer = ComplexityAnalyzer::new();
        // "fix" alone would be moderate, but the race condition makes it complex.
        let a = analyzer.analyze("fix the race condition in the dispatcher", None);
        assert_eq!(a.tier, ComplexityTier::Complex);
    }

    #[test]
    fn feature_work_is_moderate() {
        let analyzer = ComplexityAnalyzer::new();
        let a = analyzer.analyze("implement pagination for the journal endpoint", None);
        assert_eq!(a.tier, ComplexityTier::Moderate);
        assert_eq!(a.recommended_model, ModelTier::Sonnet);
    }

    #[test]
    fn lookups_are_simple() {
        let analyzer = ComplexityAnalyzer::new();
        let a = analyzer.analyze("grep for TODO markers in the tree", None);
        assert_eq!(a.tier, ComplexityTier::Simple);
        assert_eq!(a.recommended_model, ModelTier::Haiku);
    }

    #[test]
    fn no_signal_defaults_to_sonnet() {
        let analyzer = ComplexityAnalyzer::new();
        let a = analyzer.analyze("hello there", None);
        assert_eq!(a.tier, ComplexityTier::Moderate);
        assert_eq!(a.recommended_model, ModelTier::Sonnet);
        assert!(a.signals.is_empty());
    }

    #[test]
    fn context_contributes_signals() {
        let analyzer = ComplexityAnalyzer::new();
        let a = analyzer.analyze("take a look at this", Some("there is a deadlock under load"));
        assert_eq!(a.tier, ComplexityTier::Complex);
    }
}
