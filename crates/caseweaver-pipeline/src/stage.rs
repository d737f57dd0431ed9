//! Stage definitions and the pipeline plan.
//!
//! A [`StagePlan`] is a DAG of named stages; [`lint`] checks it before any
//! backend call is made: dependencies must exist, the graph must be acyclic,
//! generation schemas must be registered, and audit targets must be upstream
//! of the audit.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use caseweaver_schema::{
    SchemaRegistry, BACKGROUND_SCHEMA, CASE_SCHEMA, CAST_SCHEMA, CLUES_SCHEMA, MECHANISM_SCHEMA,
    OUTLINE_SCHEMA, PROFILES_SCHEMA, PROSE_BATCH_SCHEMA, SETTING_SCHEMA,
};
use caseweaver_types::{Result, WeaverError};

pub const SETTING_REFINEMENT: &str = "setting_refinement";
pub const CAST_DESIGN: &str = "cast_design";
pub const CHARACTER_PROFILES: &str = "character_profiles";
pub const BACKGROUND_CONTEXT: &str = "background_context";
pub const MECHANISM_IDEATION: &str = "mechanism_ideation";
pub const CASE_GENERATION: &str = "case_generation";
pub const CLUE_DISTRIBUTION: &str = "clue_distribution";
pub const FAIR_PLAY_AUDIT: &str = "fair_play_audit";
pub const NARRATIVE_OUTLINE: &str = "narrative_outline";
pub const PROSE_GENERATION: &str = "prose_generation";
pub const NOVELTY_AUDIT: &str = "novelty_audit";

/// What kind of work a stage performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StageKind {
    /// One schema-validated generation through the retry controller.
    Generate { schema_id: String },
    /// Scene-batched generation reassembled under the chapter-count
    /// invariant.
    Prose { schema_id: String },
    /// Read-only fair-play audit over case + clues; may regenerate `target`.
    FairPlayAudit { target: String },
    /// Read-only novelty audit over the case; may regenerate `target`.
    NoveltyAudit { target: String },
}

/// One named unit of work with declared dependencies and budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    pub depends_on: Vec<String>,
    pub kind: StageKind,
    pub max_generation_attempts: u32,
    pub max_revision_attempts: u32,
    pub temperature: f32,
    /// Prompt preamble describing what the stage is for.
    pub intent: String,
}

impl StageDefinition {
    pub fn generate(
        name: &str,
        depends_on: &[&str],
        schema_id: &str,
        intent: &str,
    ) -> Self {
        Self {
            name: name.into(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            kind: StageKind::Generate {
                schema_id: schema_id.into(),
            },
            max_generation_attempts: 3,
            max_revision_attempts: 2,
            temperature: 0.8,
            intent: intent.into(),
        }
    }

    pub fn schema_id(&self) -> Option<&str> {
        match &self.kind {
            StageKind::Generate { schema_id } | StageKind::Prose { schema_id } => Some(schema_id),
            _ => None,
        }
    }

    pub fn audit_target(&self) -> Option<&str> {
        match &self.kind {
            StageKind::FairPlayAudit { target } | StageKind::NoveltyAudit { target } => {
                Some(target)
            }
            _ => None,
        }
    }
}

/// An ordered collection of stage definitions forming the pipeline DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePlan {
    pub stages: Vec<StageDefinition>,
}

impl StagePlan {
    pub fn new(stages: Vec<StageDefinition>) -> Self {
        Self { stages }
    }

    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Every stage that transitively depends on `name`.
    pub fn transitive_dependents(&self, name: &str) -> HashSet<String> {
        let mut dependents = HashSet::new();
        loop {
            let before = dependents.len();
            for stage in &self.stages {
                if stage
                    .depends_on
                    .iter()
                    .any(|d| d == name || dependents.contains(d))
                {
                    dependents.insert(stage.name.clone());
                }
            }
            if dependents.len() == before {
                break;
            }
        }
        dependents
    }
}

/// The full narrative pipeline in dependency order.
pub fn default_plan() -> StagePlan {
    let mut fair_play = StageDefinition::generate(
        FAIR_PLAY_AUDIT,
        &[CASE_GENERATION, CLUE_DISTRIBUTION],
        "",
        "Check that every fact needed to derive the solution is exposed before it is revealed.",
    );
    fair_play.kind = StageKind::FairPlayAudit {
        target: CLUE_DISTRIBUTION.into(),
    };

    let mut novelty = StageDefinition::generate(
        NOVELTY_AUDIT,
        &[CASE_GENERATION],
        "",
        "Compare the case against the reference corpus for derivative similarity.",
    );
    novelty.kind = StageKind::NoveltyAudit {
        target: CASE_GENERATION.into(),
    };

    let mut prose = StageDefinition::generate(
        PROSE_GENERATION,
        &[NARRATIVE_OUTLINE, CASE_GENERATION, CHARACTER_PROFILES],
        PROSE_BATCH_SCHEMA,
        "Write the chapters for the given scenes in the established voice, one chapter per scene.",
    );
    prose.kind = StageKind::Prose {
        schema_id: PROSE_BATCH_SCHEMA.into(),
    };

    StagePlan::new(vec![
        StageDefinition::generate(
            SETTING_REFINEMENT,
            &[],
            SETTING_SCHEMA,
            "Refine the requested era and locale into a concrete setting with distinct locations.",
        ),
        StageDefinition::generate(
            CAST_DESIGN,
            &[SETTING_REFINEMENT],
            CAST_SCHEMA,
            "Design the cast: victim, suspects, and witnesses with motives grounded in the setting.",
        ),
        StageDefinition::generate(
            CHARACTER_PROFILES,
            &[CAST_DESIGN],
            PROFILES_SCHEMA,
            "Deepen each cast member into a profile with a voice and private secrets.",
        ),
        StageDefinition::generate(
            BACKGROUND_CONTEXT,
            &[CAST_DESIGN],
            BACKGROUND_SCHEMA,
            "Establish the period detail and social context constraining the cast.",
        ),
        StageDefinition::generate(
            MECHANISM_IDEATION,
            &[SETTING_REFINEMENT, CAST_DESIGN],
            MECHANISM_SCHEMA,
            "Devise the method, opportunity window, and concealment for the crime.",
        ),
        StageDefinition::generate(
            CASE_GENERATION,
            &[
                SETTING_REFINEMENT,
                CAST_DESIGN,
                MECHANISM_IDEATION,
                BACKGROUND_CONTEXT,
            ],
            CASE_SCHEMA,
            "Assemble the full case: facts, suspects, and a solution with an inference chain and a discriminating test.",
        ),
        StageDefinition::generate(
            CLUE_DISTRIBUTION,
            &[CASE_GENERATION],
            CLUES_SCHEMA,
            "Distribute clues over the case facts with placements and criticalities.",
        ),
        fair_play,
        StageDefinition::generate(
            NARRATIVE_OUTLINE,
            &[CASE_GENERATION, CLUE_DISTRIBUTION, FAIR_PLAY_AUDIT],
            OUTLINE_SCHEMA,
            "Outline the narrative as an ordered list of scenes covering the clue placements.",
        ),
        prose,
        novelty,
    ])
}

/// Reject a malformed plan before any generation is attempted.
pub fn lint(plan: &StagePlan, registry: &SchemaRegistry) -> Result<()> {
    let mut seen = HashSet::new();
    for stage in &plan.stages {
        if !seen.insert(stage.name.as_str()) {
            return Err(WeaverError::InvalidPlan(format!(
                "duplicate stage '{}'",
                stage.name
            )));
        }
        if stage.max_generation_attempts == 0 {
            return Err(WeaverError::InvalidPlan(format!(
                "stage '{}' allows zero generation attempts",
                stage.name
            )));
        }
        if let Some(schema_id) = stage.schema_id() {
            if !registry.contains(schema_id) {
                return Err(WeaverError::InvalidPlan(format!(
                    "stage '{}' references unregistered schema '{}'",
                    stage.name, schema_id
                )));
            }
        }
    }

    for stage in &plan.stages {
        for dep in &stage.depends_on {
            if plan.get(dep).is_none() {
                return Err(WeaverError::InvalidPlan(format!(
                    "stage '{}' depends on unknown stage '{}'",
                    stage.name, dep
                )));
            }
        }
        if let Some(target) = stage.audit_target() {
            if !stage.depends_on.iter().any(|d| d == target) {
                return Err(WeaverError::InvalidPlan(format!(
                    "audit '{}' targets '{}' which is not among its dependencies",
                    stage.name, target
                )));
            }
        }
    }

    detect_cycle(plan)
}

fn detect_cycle(plan: &StagePlan) -> Result<()> {
    // Kahn's algorithm: anything left over sits on a cycle.
    let mut indegree: HashMap<&str, usize> = plan
        .stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.len()))
        .collect();
    let mut queue: Vec<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut resolved = 0;
    while let Some(name) = queue.pop() {
        resolved += 1;
        for stage in &plan.stages {
            if stage.depends_on.iter().any(|d| d == name) {
                if let Some(entry) = indegree.get_mut(stage.name.as_str()) {
                    *entry -= 1;
                    if *entry == 0 {
                        queue.push(stage.name.as_str());
                    }
                }
            }
        }
    }
    if resolved != plan.stages.len() {
        let stuck: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(n, _)| *n)
            .collect();
        return Err(WeaverError::InvalidPlan(format!(
            "dependency cycle involving: {}",
            stuck.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_passes_lint() {
        let registry = SchemaRegistry::builtin();
        let plan = default_plan();
        lint(&plan, &registry).expect("default plan must lint clean");
        assert_eq!(plan.stages.len(), 11);
    }

    #[test]
    fn default_plan_wires_expected_dependencies() {
        let plan = default_plan();
        let case = plan.get(CASE_GENERATION).unwrap();
        assert_eq!(
            case.depends_on,
            vec![
                SETTING_REFINEMENT,
                CAST_DESIGN,
                MECHANISM_IDEATION,
                BACKGROUND_CONTEXT
            ]
        );
        // Profiles and background both hang off cast design only, so they
        // can run concurrently.
        assert_eq!(plan.get(CHARACTER_PROFILES).unwrap().depends_on, vec![CAST_DESIGN]);
        assert_eq!(plan.get(BACKGROUND_CONTEXT).unwrap().depends_on, vec![CAST_DESIGN]);
        // Novelty depends only on the case.
        assert_eq!(plan.get(NOVELTY_AUDIT).unwrap().depends_on, vec![CASE_GENERATION]);
    }

    #[test]
    fn transitive_dependents_cover_the_downstream_chain() {
        let plan = default_plan();
        let dependents = plan.transitive_dependents(CLUE_DISTRIBUTION);
        assert!(dependents.contains(FAIR_PLAY_AUDIT));
        assert!(dependents.contains(NARRATIVE_OUTLINE));
        assert!(dependents.contains(PROSE_GENERATION));
        assert!(!dependents.contains(NOVELTY_AUDIT));
        assert!(!dependents.contains(CASE_GENERATION));
    }

    #[test]
    fn lint_rejects_unknown_dependency() {
        let registry = SchemaRegistry::builtin();
        let plan = StagePlan::new(vec![StageDefinition::generate(
            "a",
            &["missing"],
            CASE_SCHEMA,
            "",
        )]);
        let err = lint(&plan, &registry).unwrap_err();
        assert!(err.to_string().contains("unknown stage 'missing'"));
    }

    #[test]
    fn lint_rejects_cycles() {
        let registry = SchemaRegistry::builtin();
        let plan = StagePlan::new(vec![
            StageDefinition::generate("a", &["b"], CASE_SCHEMA, ""),
            StageDefinition::generate("b", &["a"], CASE_SCHEMA, ""),
        ]);
        let err = lint(&plan, &registry).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn lint_rejects_unregistered_schema() {
        let registry = SchemaRegistry::builtin();
        let plan = StagePlan::new(vec![StageDefinition::generate("a", &[], "nope.v9", "")]);
        assert!(lint(&plan, &registry).is_err());
    }

    #[test]
    fn lint_rejects_duplicate_names_and_zero_budgets() {
        let registry = SchemaRegistry::builtin();
        let plan = StagePlan::new(vec![
            StageDefinition::generate("a", &[], CASE_SCHEMA, ""),
            StageDefinition::generate("a", &[], CASE_SCHEMA, ""),
        ]);
        assert!(lint(&plan, &registry).is_err());

        let mut zero = StageDefinition::generate("z", &[], CASE_SCHEMA, "");
        zero.max_generation_attempts = 0;
        let plan = StagePlan::new(vec![zero]);
        assert!(lint(&plan, &registry).is_err());
    }

    #[test]
    fn lint_rejects_audit_whose_target_is_not_a_dependency() {
        let registry = SchemaRegistry::builtin();
        let mut audit = StageDefinition::generate("audit", &[], "", "");
        audit.kind = StageKind::FairPlayAudit {
            target: "clue_distribution".into(),
        };
        let plan = StagePlan::new(vec![audit]);
        let err = lint(&plan, &registry).unwrap_err();
        assert!(err.to_string().contains("not among its dependencies"));
    }
}
