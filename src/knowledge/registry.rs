use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{bail, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{info, instrument, warn};

use super::resolve::{is_deprecated, PathResolver};

const REGISTRY_PREFIX: &str = "KNOWLEDGE_PROMPT_REGISTRY_";
const REGISTRY_SUFFIX: &str = ".yaml";
const INDEX_SKIP_KEYS: [&str; 2] = ["CHANGELOG", "METADATA"];

/// One knowledge artifact declared in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Absent until resolution, and after resolution when no local file matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

/// Registry tree: layers hold categories, categories eventually hold node lists.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEntry {
    Group(Vec<(String, RegistryEntry)>),
    Nodes(Vec<RegistryNode>),
    Scalar(String),
}

#[derive(Debug, Clone)]
pub struct Registry {
    source: PathBuf,
    root: Vec<(String, RegistryEntry)>,
}

impl Registry {
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Walk group keys, e.g. `["LAYER2", "WAREHOUSE", "KNOWLEDGE"]`.
    pub fn entry(&self, keys: &[&str]) -> Option<&RegistryEntry> {
        let (first, rest) = keys.split_first()?;
        let mut current = lookup(&self.root, first)?;
        for key in rest {
            match current {
                RegistryEntry::Group(children) => current = lookup(children, key)?,
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn nodes(&self, keys: &[&str]) -> &[RegistryNode] {
        match self.entry(keys) {
            Some(RegistryEntry::Nodes(nodes)) => nodes,
            _ => &[],
        }
    }

    /// Local path of the first node under `keys`, when it resolved.
    pub fn first_local_path(&self, keys: &[&str]) -> Option<&Path> {
        self.nodes(keys).first()?.local_path.as_deref()
    }

    pub fn has_entry(&self, keys: &[&str]) -> bool {
        self.entry(keys).is_some()
    }

    /// Resolve every node's `file_path` into a fresh tree; the receiver is left untouched.
    pub fn resolved(&self, resolver: &PathResolver) -> Registry {
        Registry {
            source: self.source.clone(),
            root: self
                .root
                .iter()
                .map(|(key, entry)| (key.clone(), resolve_entry(entry, resolver)))
                .collect(),
        }
    }

    /// Condensed `[KNOWLEDGE INDEX]` listing used in place of the raw registry text.
    pub fn index_summary(&self, max_lines: usize) -> String {
        let mut lines = vec!["[KNOWLEDGE INDEX]".to_string()];
        walk_index(&self.root, 0, &mut lines);
        lines.truncate(max_lines);
        lines.join("\n")
    }
}

fn lookup<'a>(children: &'a [(String, RegistryEntry)], key: &str) -> Option<&'a RegistryEntry> {
    children
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, entry)| entry)
}

fn resolve_entry(entry: &RegistryEntry, resolver: &PathResolver) -> RegistryEntry {
    match entry {
        RegistryEntry::Group(children) => RegistryEntry::Group(
            children
                .iter()
                .map(|(key, child)| (key.clone(), resolve_entry(child, resolver)))
                .collect(),
        ),
        RegistryEntry::Nodes(nodes) => RegistryEntry::Nodes(
            nodes
                .iter()
                .map(|node| RegistryNode {
                    local_path: node
                        .file_path
                        .as_deref()
                        .and_then(|reference| resolver.resolve(reference)),
                    ..node.clone()
                })
                .collect(),
        ),
        RegistryEntry::Scalar(value) => RegistryEntry::Scalar(value.clone()),
    }
}

fn walk_index(children: &[(String, RegistryEntry)], depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    for (key, entry) in children {
        if INDEX_SKIP_KEYS.contains(&key.as_str()) {
            continue;
        }
        match entry {
            RegistryEntry::Scalar(_) => lines.push(format!("{indent}{key}:")),
            RegistryEntry::Group(grand) => {
                lines.push(format!("{indent}{key}:"));
                walk_index(grand, depth + 1, lines);
            }
            RegistryEntry::Nodes(nodes) => {
                lines.push(format!("{indent}{key}:"));
                let inner = "  ".repeat(depth + 1);
                for node in nodes {
                    match &node.status {
                        Some(status) => lines.push(format!("{inner}- {} ({status})", node.name)),
                        None => lines.push(format!("{inner}- {}", node.name)),
                    }
                }
            }
        }
    }
}

/// Locates and parses the newest `KNOWLEDGE_PROMPT_REGISTRY_v<major>.<minor>.yaml`.
pub struct RegistryLoader {
    config_dir: PathBuf,
}

impl RegistryLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn latest_registry_file(&self) -> anyhow::Result<PathBuf> {
        if !self.config_dir.is_dir() {
            bail!(
                "Registry directory not found at {}",
                self.config_dir.display()
            );
        }

        let mut names: Vec<String> = fs::read_dir(&self.config_dir)
            .with_context(|| format!("Failed to list {}", self.config_dir.display()))?
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(REGISTRY_PREFIX) && name.ends_with(REGISTRY_SUFFIX))
            .collect();
        names.sort();

        let mut best: Option<(VersionKey, &String)> = None;
        for name in &names {
            let version = registry_version(name);
            match best {
                Some((best_version, _)) if version <= best_version => {}
                _ => best = Some((version, name)),
            }
        }

        let (_, chosen) = best.with_context(|| {
            format!(
                "No {REGISTRY_PREFIX}*{REGISTRY_SUFFIX} found in {}",
                self.config_dir.display()
            )
        })?;
        info!(registry = %chosen, "Using knowledge registry");
        Ok(self.config_dir.join(chosen))
    }

    /// Parse the newest registry and resolve its file references.
    #[instrument(skip_all, fields(config_dir = %self.config_dir.display()))]
    pub fn load(&self, resolver: &PathResolver) -> anyhow::Result<Registry> {
        let path = self.latest_registry_file()?;
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read registry {}", path.display()))?;
        let registry = parse_registry(&text, path)?;
        Ok(registry.resolved(resolver))
    }
}

type VersionKey = (u64, u64);

fn registry_version(name: &str) -> VersionKey {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"(?i)v(\d+)[._](\d+)").expect("valid registry regex"));
    pattern
        .captures(name)
        .and_then(|caps| Some((caps[1].parse().ok()?, caps[2].parse().ok()?)))
        .unwrap_or((0, 0))
}

/// Parse registry text, retrying once after re-indenting version keys
/// (`v4_7:` entries pasted with stray indentation).
pub fn parse_registry(text: &str, source: PathBuf) -> anyhow::Result<Registry> {
    let documents = match parse_documents(text) {
        Ok(documents) => documents,
        Err(err) => {
            warn!(?err, "Registry YAML failed to parse; retrying after indentation repair");
            let repaired = repair_version_indentation(text);
            parse_documents(&repaired).with_context(|| {
                format!("Registry {} is not valid YAML even after repair", source.display())
            })?
        }
    };

    let mut merged = Mapping::new();
    for document in documents {
        match document {
            Value::Mapping(map) => merged.extend(map),
            Value::Null => {}
            other => warn!(kind = ?other, "Ignoring non-mapping registry document"),
        }
    }

    Ok(Registry {
        source,
        root: build_group(&merged),
    })
}

fn parse_documents(text: &str) -> Result<Vec<Value>, serde_yaml::Error> {
    serde_yaml::Deserializer::from_str(text)
        .map(Value::deserialize)
        .collect()
}

fn repair_version_indentation(text: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"\n\s{2,}(v[0-9]+_[0-9]+:)").expect("valid repair regex"));
    pattern.replace_all(text, "\n $1").into_owned()
}

fn build_group(map: &Mapping) -> Vec<(String, RegistryEntry)> {
    map.iter()
        .filter_map(|(key, value)| {
            let key = scalar_text(key)?;
            if is_deprecated(&key) {
                return None;
            }
            build_entry(value).map(|entry| (key, entry))
        })
        .collect()
}

fn build_entry(value: &Value) -> Option<RegistryEntry> {
    match value {
        Value::Mapping(map) if map.contains_key("file_path") => {
            Some(RegistryEntry::Nodes(build_node(map).into_iter().collect()))
        }
        Value::Mapping(map) => Some(RegistryEntry::Group(build_group(map))),
        Value::Sequence(items) => Some(RegistryEntry::Nodes(
            items
                .iter()
                .filter_map(Value::as_mapping)
                .filter_map(build_node)
                .collect(),
        )),
        Value::Tagged(tagged) => build_entry(&tagged.value),
        Value::Null => None,
        scalar => scalar_text(scalar).map(RegistryEntry::Scalar),
    }
}

fn build_node(map: &Mapping) -> Option<RegistryNode> {
    let field = |key: &str| map.get(key).and_then(scalar_text);
    let file_path = field("file_path");
    let name = field("name").or_else(|| {
        file_path
            .as_deref()
            .and_then(|path| Path::new(path).file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
    })?;

    if is_deprecated(&name) || file_path.as_deref().is_some_and(is_deprecated) {
        return None;
    }

    Some(RegistryNode {
        name,
        file_path,
        status: field("status"),
        version: field("version"),
        description: field("description"),
        local_path: None,
    })
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
