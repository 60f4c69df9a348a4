use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Building categories with a Layer 2 domain in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildingType {
    Healthcare,
    Lab,
    Warehouse,
    Commercial,
    Civil,
    /// Only produced by routing civil work under public-works delivery.
    PublicWorks,
}

impl BuildingType {
    /// Key of the matching `LAYER2` registry domain.
    pub fn registry_key(self) -> &'static str {
        match self {
            BuildingType::Healthcare => "HEALTHCARE",
            BuildingType::Lab => "LAB",
            BuildingType::Warehouse => "WAREHOUSE",
            BuildingType::Commercial => "COMMERCIAL",
            BuildingType::Civil => "CIVIL",
            BuildingType::PublicWorks => "PUBLIC_WORKS",
        }
    }
}

impl fmt::Display for BuildingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.registry_key())
    }
}

impl FromStr for BuildingType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let key = value
            .trim()
            .to_ascii_uppercase()
            .replace(|c: char| c == '-' || c == ' ', "_");
        Ok(match key.as_str() {
            "HEALTHCARE" => BuildingType::Healthcare,
            "LAB" | "CLEANROOM" => BuildingType::Lab,
            "WAREHOUSE" => BuildingType::Warehouse,
            "COMMERCIAL" | "OFFICE" => BuildingType::Commercial,
            "CIVIL" => BuildingType::Civil,
            "PUBLIC_WORKS" => BuildingType::PublicWorks,
            other => bail!("Unknown building type '{other}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethod {
    PublicWorksDbb,
    DesignBuild,
    Private,
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeliveryMethod::PublicWorksDbb => "PUBLIC_WORKS_DBB",
            DeliveryMethod::DesignBuild => "DESIGN_BUILD",
            DeliveryMethod::Private => "PRIVATE",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicWorksKind {
    Civil,
    Water,
    Transit,
    Marine,
    Park,
    Vertical,
}

impl fmt::Display for PublicWorksKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PublicWorksKind::Civil => "PW-CIVIL",
            PublicWorksKind::Water => "PW-WATER",
            PublicWorksKind::Transit => "PW-TRANSIT",
            PublicWorksKind::Marine => "PW-MARINE",
            PublicWorksKind::Park => "PW-PARK",
            PublicWorksKind::Vertical => "PW-VERTICAL",
        };
        f.write_str(label)
    }
}

/// Ordered keyword rule: the first rule with any keyword in the text wins.
#[derive(Debug)]
struct KeywordRule<T: 'static> {
    value: T,
    keywords: &'static [&'static str],
}

impl<T: Copy> KeywordRule<T> {
    const fn new(value: T, keywords: &'static [&'static str]) -> Self {
        Self { value, keywords }
    }

    fn evaluate(&self, text: &str) -> Option<T> {
        contains_any(text, self.keywords).then_some(self.value)
    }
}

fn first_match<T: Copy>(rules: &[KeywordRule<T>], text: &str) -> Option<T> {
    rules.iter().find_map(|rule| rule.evaluate(text))
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| text.contains(keyword))
}

const HEALTHCARE_KEYWORDS: &[&str] = &[
    "healthcare",
    "hospital",
    "clinic",
    "medical",
    "behavioral health",
];
const LAB_KEYWORDS: &[&str] = &["cleanroom", "pharmaceutical", "semiconductor"];
const LAB_STANDALONE_KEYWORD: &str = "laboratory";
const LAB_BLOCKERS: &[&str] = &["hospital", "medical"];

const BUILDING_RULES: &[KeywordRule<BuildingType>] = &[
    KeywordRule::new(BuildingType::Warehouse, &["warehouse", "distribution", "logistics"]),
    KeywordRule::new(BuildingType::Commercial, &["commercial", "office"]),
    KeywordRule::new(
        BuildingType::Civil,
        &[
            "bridge",
            "culvert",
            "highway",
            "roadway",
            "pavement",
            "sewer",
            "water main",
            "pipeline",
        ],
    ),
];

pub const PUBLIC_WORKS_HARD_TRIGGERS: &[&str] = &[
    "county of",
    "city of",
    "state of california",
    "state of washington",
    "state of oregon",
    "federal project number",
    "brlo-",
    "stip-",
    "invitation for bid",
    " ifb ",
    "notice to bidders",
    "prevailing wage",
    "davis-bacon",
    "dir registration",
    "dbe goal",
    "mbe goal",
    "sbe goal",
    "performance bond",
    "payment bond",
    "liquidated damages",
    "public contract code",
    "government code",
    "buy america",
    "certified payroll",
    "caltrans",
    "dot standard specifications",
];

pub const PUBLIC_WORKS_SOFT_TRIGGERS: &[&str] = &[
    "unit price",
    "bid security",
    "bid bond",
    "buy american",
    "swppp",
    "npdes permit",
    "addendum no.",
    "addendum 1",
    "notice to proceed",
    "contract change order",
    "force account",
    "resident engineer",
];

const SOFT_TRIGGER_THRESHOLD: usize = 2;

pub const DESIGN_BUILD_TRIGGERS: &[&str] = &[
    "request for proposal",
    " rfp ",
    "design-build",
    "design build",
    "progressive design-build",
    "design/build",
];

const PUBLIC_WORKS_RULES: &[KeywordRule<PublicWorksKind>] = &[
    KeywordRule::new(
        PublicWorksKind::Civil,
        &[
            "bridge",
            "culvert",
            "road",
            "highway",
            "pavement",
            "asphalt",
            "grading",
            "drainage",
            "utility",
            "pipeline",
            "sewer",
            "water main",
        ],
    ),
    KeywordRule::new(
        PublicWorksKind::Water,
        &["water treatment", "wastewater", "treatment plant", "pump station"],
    ),
    KeywordRule::new(
        PublicWorksKind::Transit,
        &["transit", "rail", "station", "platform", "grade separation", "fta"],
    ),
    KeywordRule::new(
        PublicWorksKind::Marine,
        &["pier", "bulkhead", "dredg", "marine", "harbor", "port"],
    ),
    KeywordRule::new(
        PublicWorksKind::Park,
        &["park", "trail", "sports field", "recreation", "playground"],
    ),
    KeywordRule::new(
        PublicWorksKind::Vertical,
        &[
            "school",
            "courthouse",
            "fire station",
            "civic",
            "library",
            "community center",
        ],
    ),
];

const RENOVATION_KEYWORDS: &[&str] = &[
    "renovation",
    "existing",
    "remodel",
    "retrofit",
    "tenant improvement",
    " ti ",
];

const PRICING_KEYWORDS: &[&str] = &[
    "stage d",
    "stage e",
    "stage f",
    "unit cost",
    "price",
    "cost per",
    "takeoff",
    "quantities",
];

const DESIGN_BID_BUILD_KEYWORDS: &[&str] = &[
    "design bid build",
    "design-bid-build",
    "dbb",
    "bid build",
    "complete drawings",
    "100% cd",
    "construction documents",
];

const SHELL_KEYWORDS: &[&str] = &["shell", "core and shell", "shell only"];

/// Building type from conversation text. Healthcare outranks lab so hospitals
/// with labs stay healthcare; a bare "laboratory" only counts without hospital context.
pub fn detect_building_type(text: &str) -> Option<BuildingType> {
    let text = text.to_lowercase();
    if contains_any(&text, HEALTHCARE_KEYWORDS) {
        return Some(BuildingType::Healthcare);
    }
    if contains_any(&text, LAB_KEYWORDS) {
        return Some(BuildingType::Lab);
    }
    if text.contains(LAB_STANDALONE_KEYWORD) && !contains_any(&text, LAB_BLOCKERS) {
        return Some(BuildingType::Lab);
    }
    first_match(BUILDING_RULES, &text)
}

pub fn detect_delivery_method(text: &str) -> DeliveryMethod {
    let text = text.to_lowercase();
    let soft_hits = PUBLIC_WORKS_SOFT_TRIGGERS
        .iter()
        .filter(|trigger| text.contains(*trigger))
        .count();

    if contains_any(&text, PUBLIC_WORKS_HARD_TRIGGERS) || soft_hits >= SOFT_TRIGGER_THRESHOLD {
        DeliveryMethod::PublicWorksDbb
    } else if contains_any(&text, DESIGN_BUILD_TRIGGERS) {
        DeliveryMethod::DesignBuild
    } else {
        DeliveryMethod::Private
    }
}

pub fn detect_public_works_kind(text: &str) -> PublicWorksKind {
    first_match(PUBLIC_WORKS_RULES, &text.to_lowercase()).unwrap_or(PublicWorksKind::Civil)
}

pub fn needs_renovation_matrix(text: &str) -> bool {
    contains_any(&text.to_lowercase(), RENOVATION_KEYWORDS)
}

pub fn needs_price_list(text: &str) -> bool {
    contains_any(&text.to_lowercase(), PRICING_KEYWORDS)
}

pub fn mentions_design_bid_build(text: &str) -> bool {
    contains_any(&text.to_lowercase(), DESIGN_BID_BUILD_KEYWORDS)
}

pub fn mentions_shell_building(text: &str) -> bool {
    contains_any(&text.to_lowercase(), SHELL_KEYWORDS)
}

/// Civil work delivered as public works routes to the public-works domain.
pub fn effective_building_type(
    classified: Option<BuildingType>,
    delivery: DeliveryMethod,
) -> Option<BuildingType> {
    match (classified, delivery) {
        (Some(BuildingType::Civil), DeliveryMethod::PublicWorksDbb) => {
            Some(BuildingType::PublicWorks)
        }
        (other, _) => other,
    }
}

/// Every categorical signal derived from one turn's combined text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectSignals {
    pub building_type: Option<BuildingType>,
    pub effective_building_type: Option<BuildingType>,
    pub delivery_method: DeliveryMethod,
    pub public_works_kind: Option<PublicWorksKind>,
    pub renovation: bool,
    pub pricing: bool,
    pub design_bid_build: bool,
    pub shell_building: bool,
}

impl ProjectSignals {
    /// Classify `combined_text`; `override_type` (the caller's explicit choice) wins over detection.
    pub fn detect(combined_text: &str, override_type: Option<BuildingType>) -> Self {
        let text = combined_text.to_lowercase();
        let building_type = override_type.or_else(|| detect_building_type(&text));
        let delivery_method = detect_delivery_method(&text);
        let effective_building_type = effective_building_type(building_type, delivery_method);
        let public_works_kind = (effective_building_type == Some(BuildingType::PublicWorks))
            .then(|| detect_public_works_kind(&text));

        Self {
            building_type,
            effective_building_type,
            delivery_method,
            public_works_kind,
            renovation: needs_renovation_matrix(&text),
            pricing: needs_price_list(&text),
            design_bid_build: mentions_design_bid_build(&text),
            shell_building: mentions_shell_building(&text),
        }
    }

    pub fn needs_checklist(&self) -> bool {
        self.shell_building || self.design_bid_build
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthcare_outranks_lab() {
        assert_eq!(
            detect_building_type("Hospital expansion with a cleanroom pharmacy"),
            Some(BuildingType::Healthcare)
        );
        assert_eq!(
            detect_building_type("semiconductor cleanroom fit-out"),
            Some(BuildingType::Lab)
        );
    }

    #[test]
    fn laboratory_needs_non_medical_context() {
        assert_eq!(detect_building_type("research laboratory"), Some(BuildingType::Lab));
        assert_eq!(
            detect_building_type("medical laboratory"),
            Some(BuildingType::Healthcare)
        );
    }

    #[test]
    fn remaining_types_follow_rule_order() {
        assert_eq!(
            detect_building_type("logistics warehouse with office mezzanine"),
            Some(BuildingType::Warehouse)
        );
        assert_eq!(detect_building_type("class A office"), Some(BuildingType::Commercial));
        assert_eq!(detect_building_type("culvert replacement"), Some(BuildingType::Civil));
        assert_eq!(detect_building_type("a nice project"), None);
    }

    #[test]
    fn delivery_method_triggers() {
        assert_eq!(
            detect_delivery_method("County of Sonoma bridge rehab"),
            DeliveryMethod::PublicWorksDbb
        );
        assert_eq!(
            detect_delivery_method("bid bond required; swppp by contractor"),
            DeliveryMethod::PublicWorksDbb
        );
        assert_eq!(
            detect_delivery_method("bid bond required"),
            DeliveryMethod::Private
        );
        assert_eq!(
            detect_delivery_method("progressive design-build delivery"),
            DeliveryMethod::DesignBuild
        );
        assert_eq!(
            detect_delivery_method("caltrans oversight, design-build"),
            DeliveryMethod::PublicWorksDbb
        );
    }

    #[test]
    fn public_works_kind_is_ordered_with_civil_default() {
        assert_eq!(detect_public_works_kind("pump station upgrade"), PublicWorksKind::Water);
        assert_eq!(detect_public_works_kind("new fire station"), PublicWorksKind::Transit);
        assert_eq!(detect_public_works_kind("courthouse annex"), PublicWorksKind::Vertical);
        assert_eq!(detect_public_works_kind("misc"), PublicWorksKind::Civil);
    }

    #[test]
    fn civil_under_public_works_routes_to_public_works() {
        let signals = ProjectSignals::detect("County of Marin culvert replacement", None);
        assert_eq!(signals.building_type, Some(BuildingType::Civil));
        assert_eq!(signals.effective_building_type, Some(BuildingType::PublicWorks));
        assert_eq!(signals.public_works_kind, Some(PublicWorksKind::Civil));

        let private = ProjectSignals::detect("private culvert replacement", None);
        assert_eq!(private.effective_building_type, Some(BuildingType::Civil));
        assert_eq!(private.public_works_kind, None);
    }

    #[test]
    fn override_wins_over_detection() {
        let signals = ProjectSignals::detect("hospital", Some(BuildingType::Warehouse));
        assert_eq!(signals.effective_building_type, Some(BuildingType::Warehouse));
        assert_eq!("public works".parse::<BuildingType>().unwrap(), BuildingType::PublicWorks);
        assert!("stadium".parse::<BuildingType>().is_err());
    }

    #[test]
    fn flags_detect_renovation_pricing_and_checklists() {
        let signals = ProjectSignals::detect(
            "Tenant improvement of existing shell; need unit cost per sf",
            None,
        );
        assert!(signals.renovation);
        assert!(signals.pricing);
        assert!(signals.shell_building);
        assert!(!signals.design_bid_build);
        assert!(signals.needs_checklist());
        assert!(!ProjectSignals::detect("greenfield", None).needs_checklist());
    }
}
