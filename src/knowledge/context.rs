use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, instrument};

use super::reader::KnowledgeReader;
use super::registry::{Registry, RegistryLoader};
use super::resolve::PathResolver;
use crate::prompt::budget::PromptLimits;

/// Where the knowledge base lives and which fixed files the assembler reads.
/// Relative paths are joined onto `base_dir`.
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    pub base_dir: PathBuf,
    pub registry_dir: PathBuf,
    pub layer0_path: PathBuf,
    pub layer1_path: PathBuf,
    pub gc_rules_path: PathBuf,
    pub gc_rules_trigger: String,
    pub gc_rules_label: String,
    pub renovation_matrix_path: PathBuf,
    pub price_list_path: PathBuf,
    pub formula_updates_path: PathBuf,
    pub multi_state_rates_path: PathBuf,
}

impl KnowledgeConfig {
    const BASE_DIR_VARS: [&'static str; 2] = ["ESTIMAIT_KNOWLEDGE_DIR", "KNOWLEDGE_BASE_DIR"];
    const GC_TRIGGER_VARS: [&'static str; 1] = ["ESTIMAIT_GC_RULES_TRIGGER"];

    pub fn from_env() -> Self {
        let base_dir = read_env(&Self::BASE_DIR_VARS)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::for_base(base_dir);
        if let Some(trigger) = read_env(&Self::GC_TRIGGER_VARS) {
            config.gc_rules_trigger = trigger.to_lowercase();
        }
        config
    }

    /// Standard knowledge-base layout under `base_dir`.
    pub fn for_base(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            registry_dir: PathBuf::from("Config"),
            layer0_path: PathBuf::from(
                "Knowledge Prompts/Layer 0/dotbrand ESTIMAIT 2 - SYSTEM INSTRUCTION PROMPT v2.2.md",
            ),
            layer1_path: PathBuf::from(
                "Knowledge Prompts/Layer 1/LAYER 1_ CORE ESTIMATION ENGINE v2.5.md",
            ),
            gc_rules_path: PathBuf::from(
                "Knowledge Prompts/GC Specific/GC_SPECIFIC_UPRITE_GENERAL_v3.0.md",
            ),
            gc_rules_trigger: "uprite".to_string(),
            gc_rules_label: "UPRITE CONSTRUCTION CORP BUSINESS RULES".to_string(),
            renovation_matrix_path: PathBuf::from("Data/RENOVATION_COST_FACTOR_MATRIX_v1.1.yaml"),
            price_list_path: PathBuf::from(
                "References/ESTIMAIT_California_Real_Price_List_v1.0.md.docx",
            ),
            formula_updates_path: PathBuf::from("References/CA_Estimation_Formula_Updates_v1.0.md"),
            multi_state_rates_path: PathBuf::from("References/MULTI_STATE_COST_RATES_v1.0.md"),
        }
    }

    pub fn path(&self, relative: &Path) -> PathBuf {
        self.base_dir.join(relative)
    }
}

fn read_env(candidates: &[&'static str]) -> Option<String> {
    candidates
        .iter()
        .find_map(|key| env::var(key).ok())
        .filter(|value| !value.trim().is_empty())
}

/// Everything the assembler needs that does not change between requests.
///
/// Built once at startup; the foundational fragments and the registry are
/// load-bearing, so any failure here aborts the process.
#[derive(Debug)]
pub struct KnowledgeContext {
    config: KnowledgeConfig,
    limits: PromptLimits,
    reader: KnowledgeReader,
    resolver: PathResolver,
    registry: Registry,
    primary_instructions: String,
    gc_rules: String,
}

pub type SharedKnowledge = Arc<KnowledgeContext>;

impl KnowledgeContext {
    #[instrument(skip_all, fields(base_dir = %config.base_dir.display()))]
    pub async fn load(config: KnowledgeConfig, limits: PromptLimits) -> anyhow::Result<Self> {
        let reader = KnowledgeReader::new(&limits);
        let resolver = PathResolver::for_knowledge_base(&config.base_dir);

        let layer0 = config.path(&config.layer0_path);
        let primary_instructions = reader.read(&layer0).await.with_context(|| {
            format!("Foundational system instruction missing at {}", layer0.display())
        })?;

        let gc_path = config.path(&config.gc_rules_path);
        let gc_rules = reader.read(&gc_path).await.with_context(|| {
            format!("GC business rules missing at {}", gc_path.display())
        })?;

        let registry_dir = config.path(&config.registry_dir);
        let registry = {
            let resolver = resolver.clone();
            tokio::task::spawn_blocking(move || RegistryLoader::new(registry_dir).load(&resolver))
                .await
                .context("Registry loader task panicked")??
        };

        info!(
            primary_chars = primary_instructions.len(),
            gc_rules_chars = gc_rules.len(),
            registry = %registry.source().display(),
            "Knowledge context ready"
        );

        Ok(Self {
            config,
            limits,
            reader,
            resolver,
            registry,
            primary_instructions,
            gc_rules,
        })
    }

    pub fn config(&self) -> &KnowledgeConfig {
        &self.config
    }

    pub fn limits(&self) -> &PromptLimits {
        &self.limits
    }

    pub fn reader(&self) -> &KnowledgeReader {
        &self.reader
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn primary_instructions(&self) -> &str {
        &self.primary_instructions
    }

    pub fn gc_rules(&self) -> &str {
        &self.gc_rules
    }
}
