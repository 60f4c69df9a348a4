use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

const DEFAULT_CONTINGENCY_RATE: f64 = 10.0;
const DEFAULT_GC_FEE_RATE: f64 = 5.0;

/// General contractor's company settings applied to every estimate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub company_address: Option<String>,
    #[serde(default)]
    pub contingency_rate: Option<f64>,
    #[serde(default)]
    pub gc_fee_rate: Option<f64>,
}

impl CompanyProfile {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read company profile {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Company profile {} is not valid JSON", path.display()))
    }

    pub fn render(&self) -> String {
        format!(
            "== GC COMPANY PROFILE ==
Company Name: {}
HQ Address: {}
Contingency: {}%
GC Fee: {}%

INSTRUCTIONS: Always apply these rates in your estimates. Show the company name in estimate headers.
== END GC PROFILE ==",
            non_empty(&self.company_name),
            non_empty(&self.company_address),
            self.contingency_rate.unwrap_or(DEFAULT_CONTINGENCY_RATE),
            self.gc_fee_rate.unwrap_or(DEFAULT_GC_FEE_RATE),
        )
    }
}

fn non_empty(value: &Option<String>) -> &str {
    value
        .as_deref()
        .filter(|text| !text.trim().is_empty())
        .unwrap_or("Not set")
}
