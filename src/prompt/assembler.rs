use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::budget::{char_prefix, PromptBudget};
use super::classify::{BuildingType, ProjectSignals};
use super::directives::{
    delivery_advisory, BEHAVIORAL_RULES, CASE_DATABASE_GUARD, CHECKLIST_ENFORCEMENT,
    DOCUMENT_PARSING, ESTIMATION_WORKFLOW, LAB_CLASSIFICATION_GATE, ROLE_PREAMBLE,
};
use super::profile::CompanyProfile;
use super::stage::{
    combined_text, is_beyond_stage_a, steering_directive, truncate_history, ConversationTurn,
};
use crate::knowledge::SharedKnowledge;

const SECTION_SEPARATOR: &str = "\n\n";
const SUMMARY_NOTE: &str = "\n[NOTE: Full configuration available for deep queries.]";

/// Labeled block of text destined for the system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnowledgeFragment {
    pub label: String,
    pub content: String,
    /// Directives carry their own heading; the label is only for reporting.
    headed: bool,
}

impl KnowledgeFragment {
    pub fn labeled(label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
            headed: true,
        }
    }

    pub fn directive(label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            content: content.into(),
            headed: false,
        }
    }

    pub fn char_len(&self) -> usize {
        self.render().chars().count()
    }

    pub fn render(&self) -> String {
        if self.headed {
            format!("--- {} ---\n{}", self.label, self.content)
        } else {
            self.content.clone()
        }
    }
}

/// Per-turn inputs to prompt assembly.
#[derive(Debug, Clone, Default)]
pub struct PromptRequest<'a> {
    pub message: &'a str,
    pub history: &'a [ConversationTurn],
    pub building_type: Option<BuildingType>,
    pub document_context: Option<&'a str>,
    pub profile: Option<&'a CompanyProfile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssembledPrompt {
    pub system: String,
    /// History window the prompt was built from; the same turns go to the model.
    pub history: Vec<ConversationTurn>,
    pub signals: ProjectSignals,
    pub fragments: Vec<String>,
    pub verification: Vec<String>,
    pub unbounded_chars: usize,
    pub truncated: bool,
}

/// Builds the bounded system prompt for one conversation turn.
#[derive(Clone)]
pub struct PromptAssembler {
    knowledge: SharedKnowledge,
}

impl PromptAssembler {
    pub fn new(knowledge: SharedKnowledge) -> Self {
        Self { knowledge }
    }

    #[instrument(skip_all, fields(history = request.history.len()))]
    pub async fn assemble(&self, request: &PromptRequest<'_>) -> AssembledPrompt {
        let limits = self.knowledge.limits();
        let window = truncate_history(request.history, limits);
        let text = combined_text(request.message, window);
        let signals = ProjectSignals::detect(&text, request.building_type);
        debug!(?signals, "Classified conversation");

        let fragments = self.collect_fragments(&signals).await;
        let verification = self.verification_fragments(window).await;
        let gc_rules = self.gc_rules_fragment(&text);
        for fragment in fragments.iter().chain(&gc_rules).chain(&verification) {
            debug!(label = %fragment.label, chars = fragment.char_len(), "Fragment included");
        }

        let mut sections: Vec<String> = vec![ROLE_PREAMBLE.to_string()];
        if let Some(context) = request.document_context.filter(|c| !c.trim().is_empty()) {
            sections.push(format!(
                "== RELEVANT DOCUMENT CONTEXT (from uploaded files) ==\n{context}\n== END DOCUMENT CONTEXT =="
            ));
        }
        if let Some(profile) = request.profile {
            sections.push(profile.render());
        }
        sections.push(BEHAVIORAL_RULES.to_string());
        sections.push(format!(
            "== KNOWLEDGE BASE ==\n{}",
            self.knowledge
                .registry()
                .index_summary(limits.registry_index_lines)
        ));
        sections.extend(fragments.iter().map(KnowledgeFragment::render));
        sections.extend(gc_rules.iter().map(KnowledgeFragment::render));
        sections.extend(verification.iter().map(KnowledgeFragment::render));
        sections.push(DOCUMENT_PARSING.to_string());
        sections.push(ESTIMATION_WORKFLOW.to_string());
        sections.push(format!(
            "== CURRENT STAGE STEERING ==\n{}",
            steering_directive(window)
        ));

        let limit = limits.system_prompt_char_limit();
        let mut budget = PromptBudget::new(limit);
        let mut unbounded_chars = 0;
        for (idx, section) in sections.iter().enumerate() {
            if idx > 0 {
                budget.push(SECTION_SEPARATOR);
                unbounded_chars += SECTION_SEPARATOR.len();
            }
            budget.push(section);
            unbounded_chars += section.chars().count();
        }
        let truncated = budget.is_truncated();
        let system = budget.finish();

        if truncated {
            warn!(unbounded_chars, cap = limit, "System prompt truncated to budget");
        } else {
            info!(chars = unbounded_chars, cap = limit, "System prompt assembled");
        }

        AssembledPrompt {
            system,
            history: window.to_vec(),
            signals,
            fragments: fragments
                .iter()
                .chain(gc_rules.iter())
                .map(|fragment| fragment.label.clone())
                .collect(),
            verification: verification.into_iter().map(|f| f.label).collect(),
            unbounded_chars,
            truncated,
        }
    }

    /// Ordered knowledge fragments; every source is optional except the
    /// preloaded primary instructions.
    async fn collect_fragments(&self, signals: &ProjectSignals) -> Vec<KnowledgeFragment> {
        let config = self.knowledge.config();
        let limits = self.knowledge.limits();
        let registry = self.knowledge.registry();
        let mut fragments = vec![KnowledgeFragment::labeled(
            "PRIMARY SYSTEM INSTRUCTIONS",
            self.knowledge.primary_instructions(),
        )];

        match self.read(&config.path(&config.layer1_path)).await {
            Some(content) => {
                fragments.push(KnowledgeFragment::labeled("LAYER 1: Core Methodology", content))
            }
            None => {
                warn!("Hardcoded Layer 1 unavailable; falling back to registry entry");
                if let Some(content) = self
                    .read_registry(&["LAYER1", "CORE_ENGINE"])
                    .await
                {
                    fragments.push(KnowledgeFragment::labeled(
                        "LAYER 1: Core Methodology (Registry)",
                        content,
                    ));
                }
            }
        }

        if signals.renovation {
            if let Some(content) = self.read(&config.path(&config.renovation_matrix_path)).await {
                info!("Renovation cost factor matrix loaded");
                fragments.push(KnowledgeFragment::labeled(
                    "DATA: Renovation Cost Factor Matrix",
                    content,
                ));
            }
        }

        if signals.pricing {
            if let Some(content) = self.read(&config.path(&config.price_list_path)).await {
                info!("Regional price list loaded");
                fragments.push(KnowledgeFragment::labeled(
                    "REFERENCE: California Real Price List 2025",
                    content,
                ));
            }
        }

        if let Some(content) = self.read(&config.path(&config.formula_updates_path)).await {
            fragments.push(KnowledgeFragment::labeled(
                "CA ESTIMATION FORMULA UPDATES (MANDATORY)",
                content,
            ));
        }

        if let Some(content) = self.read(&config.path(&config.multi_state_rates_path)).await {
            fragments.push(KnowledgeFragment::labeled(
                "MULTI-STATE COST RATES (MANDATORY)",
                content,
            ));
        }

        let advisory = delivery_advisory(signals);
        match signals.effective_building_type {
            Some(building_type) => {
                let key = building_type.registry_key();
                if registry.has_entry(&["LAYER2", key]) {
                    if let Some(content) = self.read_registry(&["LAYER2", key, "KNOWLEDGE"]).await
                    {
                        fragments.push(KnowledgeFragment::labeled(
                            format!("LAYER 2: {key} Knowledge (SUMMARY)"),
                            format!(
                                "{}{SUMMARY_NOTE}",
                                char_prefix(&content, limits.domain_summary_chars)
                            ),
                        ));
                    }
                    if let Some(content) = self
                        .read_registry(&["LAYER2", key, "DECISION_MATRIX"])
                        .await
                    {
                        fragments.push(KnowledgeFragment::labeled(
                            format!("LAYER 2: {key} Matrix (SUMMARY)"),
                            char_prefix(&content, limits.decision_matrix_chars),
                        ));
                    }
                    info!(domain = key, "Layer 2 domain summary injected");
                    fragments.push(KnowledgeFragment::labeled(
                        "PROJECT DELIVERY CONTEXT",
                        advisory,
                    ));
                } else {
                    debug!(domain = key, "No Layer 2 registry domain for building type");
                }

                if building_type == BuildingType::Lab {
                    fragments.push(KnowledgeFragment::directive(
                        "LAB CLASSIFICATION GATE",
                        LAB_CLASSIFICATION_GATE,
                    ));
                }
            }
            None => fragments.push(KnowledgeFragment::labeled(
                "PROJECT DELIVERY CONTEXT",
                advisory,
            )),
        }

        if signals.needs_checklist() {
            fragments.push(KnowledgeFragment::directive(
                "MANDATORY CHECKLIST ENFORCEMENT",
                CHECKLIST_ENFORCEMENT,
            ));
        }

        fragments.push(KnowledgeFragment::directive(
            "CASE DATABASE USAGE RULES",
            CASE_DATABASE_GUARD,
        ));
        fragments
    }

    async fn verification_fragments(&self, window: &[ConversationTurn]) -> Vec<KnowledgeFragment> {
        if !is_beyond_stage_a(window) {
            return Vec::new();
        }
        self.read_registry(&["LAYER3", "CASE_FEATURE_EXTRACTION"])
            .await
            .map(|content| KnowledgeFragment::labeled("LAYER 3: Feature Extraction", content))
            .into_iter()
            .collect()
    }

    fn gc_rules_fragment(&self, combined_text: &str) -> Option<KnowledgeFragment> {
        let config = self.knowledge.config();
        let rules = self.knowledge.gc_rules();
        if rules.is_empty() || !combined_text.contains(&config.gc_rules_trigger) {
            return None;
        }
        Some(KnowledgeFragment::labeled(config.gc_rules_label.clone(), rules))
    }

    async fn read(&self, path: &Path) -> Option<String> {
        self.knowledge.reader().read(path).await
    }

    async fn read_registry(&self, keys: &[&str]) -> Option<String> {
        let path = self.knowledge.registry().first_local_path(keys)?;
        self.read(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::context::tests::{knowledge_tree, load_context, write};
    use crate::knowledge::{KnowledgeConfig, KnowledgeContext};
    use crate::prompt::budget::{PromptLimits, TRUNCATION_NOTICE};
    use std::sync::Arc;

    async fn assembler(root: &Path) -> PromptAssembler {
        PromptAssembler::new(Arc::new(load_context(root).await))
    }

    fn position(haystack: &str, needle: &str) -> usize {
        haystack
            .find(needle)
            .unwrap_or_else(|| panic!("missing {needle:?}"))
    }

    #[tokio::test]
    async fn first_turn_layout_is_ordered() {
        let tmp = knowledge_tree();
        let assembler = assembler(tmp.path()).await;
        let profile = CompanyProfile {
            company_name: Some("Acme Builders".into()),
            ..CompanyProfile::default()
        };

        let prompt = assembler
            .assemble(&PromptRequest {
                message: "Estimate a 120,000 sf logistics warehouse",
                document_context: Some("[bod.pdf - chunk 0]\nGFA 120,000 sf"),
                profile: Some(&profile),
                ..PromptRequest::default()
            })
            .await;
        let system = &prompt.system;

        assert!(system.starts_with(ROLE_PREAMBLE));
        let order = [
            "== RELEVANT DOCUMENT CONTEXT",
            "== GC COMPANY PROFILE ==",
            "== BEHAVIORAL RULES ==",
            "== KNOWLEDGE BASE ==\n[KNOWLEDGE INDEX]",
            "--- PRIMARY SYSTEM INSTRUCTIONS ---\nLAYER0 BODY",
            "--- LAYER 1: Core Methodology ---\nLAYER1 BODY",
            "--- CA ESTIMATION FORMULA UPDATES (MANDATORY) ---",
            "--- MULTI-STATE COST RATES (MANDATORY) ---",
            "--- LAYER 2: WAREHOUSE Knowledge (SUMMARY) ---",
            "--- LAYER 2: WAREHOUSE Matrix (SUMMARY) ---",
            "--- PROJECT DELIVERY CONTEXT ---",
            "== CASE DATABASE USAGE RULES (MANDATORY) ==",
            "== DOCUMENT PARSING ==",
            "== AUTOMATED ESTIMATION WORKFLOW ==",
            "== CURRENT STAGE STEERING ==\nStarting session. Begin with Stage A.",
        ];
        for pair in order.windows(2) {
            assert!(
                position(system, pair[0]) < position(system, pair[1]),
                "{} should precede {}",
                pair[0],
                pair[1]
            );
        }

        assert!(!system.contains("RENOVATION BODY"));
        assert!(!system.contains("UPRITE RULES BODY"));
        assert!(!system.contains("LAYER 3"));
        assert!(!prompt.truncated);
        assert_eq!(prompt.signals.effective_building_type, Some(BuildingType::Warehouse));
    }

    #[tokio::test]
    async fn domain_summaries_are_capped() {
        let tmp = knowledge_tree();
        let assembler = assembler(tmp.path()).await;

        let prompt = assembler
            .assemble(&PromptRequest {
                message: "warehouse",
                ..PromptRequest::default()
            })
            .await;

        let knowledge = format!(
            "--- LAYER 2: WAREHOUSE Knowledge (SUMMARY) ---\n{}{SUMMARY_NOTE}",
            "W".repeat(2_000)
        );
        let matrix = format!(
            "--- LAYER 2: WAREHOUSE Matrix (SUMMARY) ---\n{}\n\n",
            "M".repeat(1_500)
        );
        assert!(prompt.system.contains(&knowledge));
        assert!(prompt.system.contains(&matrix));
    }

    #[tokio::test]
    async fn conditional_fragments_follow_signals() {
        let tmp = knowledge_tree();
        let assembler = assembler(tmp.path()).await;
        let history = vec![
            ConversationTurn::user("Uprite here, renovation of a semiconductor fab"),
            ConversationTurn::assistant("✅ Stage A complete. Reply confirm."),
        ];

        let prompt = assembler
            .assemble(&PromptRequest {
                message: "confirm, design-bid-build",
                history: &history,
                ..PromptRequest::default()
            })
            .await;
        let system = &prompt.system;

        assert!(system.contains("--- DATA: Renovation Cost Factor Matrix ---\nRENOVATION BODY"));
        assert!(system.contains("--- LAYER 2: LAB Knowledge (SUMMARY) ---\nLAB BODY"));
        assert!(system.contains("--- CLEANROOM / LAB CLASSIFICATION GATE ---"));
        assert!(system.contains("--- MANDATORY CHECKLIST ENFORCEMENT ---"));
        assert!(system.contains("PROJECT DELIVERY: Design-Bid-Build confirmed."));
        assert!(
            position(system, "--- UPRITE CONSTRUCTION CORP BUSINESS RULES ---\nUPRITE RULES BODY")
                < position(system, "--- LAYER 3: Feature Extraction ---\nFEATURES BODY")
        );
        assert!(system.contains("You MUST now proceed to Stage B."));
        assert_eq!(prompt.verification, vec!["LAYER 3: Feature Extraction".to_string()]);
    }

    #[tokio::test]
    async fn unknown_type_gets_advisory_alone() {
        let tmp = knowledge_tree();
        let assembler = assembler(tmp.path()).await;

        let prompt = assembler
            .assemble(&PromptRequest {
                message: "hello",
                ..PromptRequest::default()
            })
            .await;

        assert!(prompt
            .system
            .contains("--- PROJECT DELIVERY CONTEXT ---\nPROJECT DELIVERY: Not yet confirmed. Ask GC in Stage A."));
        assert!(!prompt.system.contains("LAYER 2:"));
    }

    #[tokio::test]
    async fn civil_public_works_routes_to_public_works_domain() {
        let tmp = knowledge_tree();
        let assembler = assembler(tmp.path()).await;

        let prompt = assembler
            .assemble(&PromptRequest {
                message: "County of Kern culvert replacement",
                ..PromptRequest::default()
            })
            .await;

        assert_eq!(
            prompt.signals.effective_building_type,
            Some(BuildingType::PublicWorks)
        );
        assert!(prompt
            .system
            .contains("--- LAYER 2: PUBLIC_WORKS Knowledge (SUMMARY) ---\nPUBLIC WORKS BODY"));
        assert!(prompt.system.contains("PUBLIC WORKS TYPE: PW-CIVIL"));
    }

    #[tokio::test]
    async fn missing_layer1_falls_back_to_registry() {
        let tmp = knowledge_tree();
        let config = KnowledgeConfig::for_base(tmp.path());
        std::fs::remove_file(config.path(&config.layer1_path)).unwrap();
        write(
            tmp.path(),
            "Knowledge Prompts/LAYER1_CORE_ESTIMATION_ENGINE_v2.4.md",
            "REGISTRY ENGINE",
        );
        let assembler = assembler(tmp.path()).await;

        let prompt = assembler.assemble(&PromptRequest::default()).await;
        assert!(prompt
            .system
            .contains("--- LAYER 1: Core Methodology (Registry) ---\nREGISTRY ENGINE"));
    }

    #[tokio::test]
    async fn overflow_is_cut_at_budget_with_notice() {
        let tmp = knowledge_tree();
        let limits = PromptLimits {
            max_system_tokens: 2_000,
            ..PromptLimits::default()
        };
        let context = KnowledgeContext::load(KnowledgeConfig::for_base(tmp.path()), limits)
            .await
            .unwrap();
        let assembler = PromptAssembler::new(Arc::new(context));

        let prompt = assembler.assemble(&PromptRequest::default()).await;

        assert!(prompt.truncated);
        assert!(prompt.unbounded_chars > 8_000);
        assert!(prompt.system.ends_with(TRUNCATION_NOTICE));
        assert_eq!(
            prompt.system.chars().count(),
            8_000 + TRUNCATION_NOTICE.chars().count()
        );
    }
}
