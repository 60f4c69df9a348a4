use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Sub-folders of the knowledge base searched, in order, after the root itself.
pub const SEARCH_SUBDIRS: [&str; 5] = ["Knowledge Prompts", "Data", "Tools", "Config", "References"];

const TOKEN_OVERLAP_THRESHOLD: f64 = 0.70;
const MIN_VERSIONLESS_LEN: usize = 5;

/// Resolves registry file references against the on-disk knowledge base.
///
/// Registry entries and the files they point at drift independently (renames,
/// version bumps, extension changes), so lookups go through a tolerant
/// multi-pass matcher instead of exact path joins.
#[derive(Debug, Clone)]
pub struct PathResolver {
    roots: Vec<PathBuf>,
}

impl PathResolver {
    /// Standard layout: the base directory followed by the known sub-folders.
    pub fn for_knowledge_base(base: &Path) -> Self {
        let mut roots = vec![base.to_path_buf()];
        roots.extend(SEARCH_SUBDIRS.iter().map(|sub| base.join(sub)));
        Self { roots }
    }

    /// Find the local file for `reference` (a path or bare file name).
    /// Returns `None` for deprecated references and when no pass matches.
    pub fn resolve(&self, reference: &str) -> Option<PathBuf> {
        if is_deprecated(reference) {
            debug!(reference, "Skipping deprecated registry reference");
            return None;
        }

        let target = base_name(reference);
        if target.is_empty() {
            return None;
        }

        for root in &self.roots {
            if !root.is_dir() {
                continue;
            }
            let candidates = collect_files(root);
            if let Some(found) = find_fuzzy(&candidates, target) {
                return Some(found);
            }
        }

        warn!(reference = target, "Could not resolve local path for registry reference");
        None
    }
}

pub fn is_deprecated(path: &str) -> bool {
    path.to_ascii_lowercase().contains("deprecated")
}

/// Recursive, name-sorted listing that never descends into deprecated folders.
fn collect_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !is_deprecated(&entry.file_name().to_string_lossy())
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

fn find_fuzzy(candidates: &[PathBuf], target: &str) -> Option<PathBuf> {
    let (target_stem, _) = split_extension(target);
    let target_norm = normalize_with_ext(target);
    let target_stem_norm = normalize(target_stem);
    let target_stem_lower = target_stem.to_lowercase();
    let target_versionless = strip_version(target_stem);

    // Pass 1: normalized exact match, tolerating compound suffixes (X.md -> X.md.docx).
    for path in candidates {
        let file_name = file_name_of(path);
        let entry_norm = normalize_with_ext(&file_name);
        if entry_norm == target_norm {
            return Some(path.clone());
        }
        let file_lower = file_name.to_lowercase();
        if !target_stem_norm.is_empty()
            && entry_norm.starts_with(&target_stem_norm)
            && (file_lower.contains(&target_stem_lower) || file_lower.contains(&target_stem_norm))
        {
            return Some(path.clone());
        }
    }

    // Pass 2: version-agnostic match; short names are too ambiguous to strip.
    if target_versionless.chars().count() > MIN_VERSIONLESS_LEN {
        for path in candidates {
            let file_name = file_name_of(path);
            let (entry_stem, _) = split_extension(&file_name);
            if strip_version(entry_stem) == target_versionless {
                return Some(path.clone());
            }
        }
    }

    // Pass 3: significant-token overlap.
    let target_tokens = tokens(target_stem);
    if target_tokens.is_empty() {
        return None;
    }
    for path in candidates {
        let file_name = file_name_of(path);
        let (entry_stem, _) = split_extension(&file_name);
        let entry_tokens = tokens(entry_stem);
        if token_overlap(&target_tokens, &entry_tokens) >= TOKEN_OVERLAP_THRESHOLD {
            return Some(path.clone());
        }
    }

    None
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"v\d+[\d.]*").expect("valid version regex"))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Last path component, accepting both `/` and `\` separators.
fn base_name(reference: &str) -> &str {
    reference
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(reference)
        .trim()
}

/// Split `name` into stem and extension (with the dot) on the last dot.
/// Leading-dot names such as `.env` have no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '.' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

fn normalize_with_ext(name: &str) -> String {
    let (stem, ext) = split_extension(name);
    format!("{}{}", normalize(stem), ext.to_lowercase())
}

fn strip_version(stem: &str) -> String {
    version_pattern().replace_all(&normalize(stem), "").into_owned()
}

fn tokens(stem: &str) -> Vec<String> {
    let lowered = stem.to_lowercase();
    version_pattern()
        .replace_all(&lowered, "")
        .split(|c: char| c.is_whitespace() || matches!(c, '.' | '_' | '-'))
        .filter(|token| token.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Fraction of target tokens that overlap (substring either way) some entry token.
fn token_overlap(target: &[String], entry: &[String]) -> f64 {
    if target.is_empty() {
        return 0.0;
    }
    let matched = target
        .iter()
        .filter(|tt| {
            entry
                .iter()
                .any(|et| et.contains(tt.as_str()) || tt.contains(et.as_str()))
        })
        .count();
    matched as f64 / target.len() as f64
}
