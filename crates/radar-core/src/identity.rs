//! Company identity index: resolves noisy disclosure names to registry codes.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{CanonicalCompany, RawDisclosureRecord, ResolvedRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    /// Raw exchange code equals a registry code (table sources only).
    CompanyCode,
    TaxId,
    ExactName,
    BranchPrefix,
    Representative,
}

impl MatchTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::CompanyCode => "company_code",
            MatchTier::TaxId => "tax_id",
            MatchTier::ExactName => "exact_name",
            MatchTier::BranchPrefix => "branch_prefix",
            MatchTier::Representative => "representative",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched { code: String, tier: MatchTier },
    /// The name hit a representative shared by several companies; never guessed.
    Ambiguous { candidates: usize },
    Unmatched,
}

impl MatchOutcome {
    pub fn code(&self) -> Option<&str> {
        match self {
            MatchOutcome::Matched { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Read-only lookup structures built once per run from the registry snapshot.
#[derive(Debug, Clone, Default)]
pub struct CompanyIndex {
    codes: HashSet<String>,
    tax_ids: HashMap<String, String>,
    names: HashMap<String, String>,
    /// (canonical name, code), longest name first, registry order among ties.
    branches: Vec<(String, String)>,
    representatives: HashMap<String, Vec<(String, String)>>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

impl CompanyIndex {
    pub fn build<'a>(companies: impl IntoIterator<Item = &'a CanonicalCompany>) -> Self {
        let mut index = CompanyIndex::default();

        for company in companies {
            let code = company.code.trim().to_string();
            if code.is_empty() {
                continue;
            }
            index.codes.insert(code.clone());

            if let Some(tax_id) = non_empty(company.tax_id.as_deref()) {
                index.tax_ids.insert(tax_id.to_string(), code.clone());
            }

            let name = company.name.trim();
            if !name.is_empty() {
                index.names.insert(name.to_string(), code.clone());
                index.branches.push((name.to_string(), code.clone()));
            }
            if let Some(abbreviation) = non_empty(company.abbreviation.as_deref()) {
                index.names.insert(abbreviation.to_string(), code.clone());
            }

            if let Some(chairman) = non_empty(company.chairman.as_deref()) {
                index
                    .representatives
                    .entry(chairman.to_string())
                    .or_default()
                    .push((name.to_string(), code.clone()));
            }
        }

        // Stable sort keeps registry order among equal-length names.
        index
            .branches
            .sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));

        tracing::debug!(
            companies = index.codes.len(),
            tax_ids = index.tax_ids.len(),
            names = index.names.len(),
            representatives = index.representatives.len(),
            "built company identity index"
        );
        index
    }

    pub fn match_by_tax_id(&self, tax_id: Option<&str>) -> Option<&str> {
        non_empty(tax_id).and_then(|t| self.tax_ids.get(t).map(String::as_str))
    }

    pub fn match_by_name(&self, name: Option<&str>) -> Option<&str> {
        non_empty(name).and_then(|n| self.names.get(n).map(String::as_str))
    }

    /// "ParentCo Hsinchu Plant" resolves to "ParentCo".
    pub fn match_by_branch(&self, name: Option<&str>) -> Option<&str> {
        let name = non_empty(name)?;
        self.branches
            .iter()
            .find(|(canonical, _)| name.len() > canonical.len() && name.starts_with(canonical.as_str()))
            .map(|(_, code)| code.as_str())
    }

    pub fn match_by_representative(&self, name: Option<&str>) -> MatchOutcome {
        let Some(name) = non_empty(name) else {
            return MatchOutcome::Unmatched;
        };
        match self.representatives.get(name).map(Vec::as_slice) {
            Some([(_, code)]) => MatchOutcome::Matched {
                code: code.clone(),
                tier: MatchTier::Representative,
            },
            Some(candidates) if candidates.len() > 1 => MatchOutcome::Ambiguous {
                candidates: candidates.len(),
            },
            _ => MatchOutcome::Unmatched,
        }
    }

    /// Tiered cascade: tax id, exact name, branch prefix, unique representative.
    pub fn match_with_tier(&self, tax_id: Option<&str>, name: Option<&str>) -> MatchOutcome {
        if let Some(code) = self.match_by_tax_id(tax_id) {
            return MatchOutcome::Matched {
                code: code.to_string(),
                tier: MatchTier::TaxId,
            };
        }
        if non_empty(name).is_none() {
            return MatchOutcome::Unmatched;
        }
        if let Some(code) = self.match_by_name(name) {
            return MatchOutcome::Matched {
                code: code.to_string(),
                tier: MatchTier::ExactName,
            };
        }
        if let Some(code) = self.match_by_branch(name) {
            return MatchOutcome::Matched {
                code: code.to_string(),
                tier: MatchTier::BranchPrefix,
            };
        }
        self.match_by_representative(name)
    }

    pub fn match_company(&self, tax_id: Option<&str>, name: Option<&str>) -> Option<String> {
        self.match_with_tier(tax_id, name).code().map(ToString::to_string)
    }

    /// Resolve a parsed row. Table sources carry the exchange code, which is
    /// tried before the name cascade.
    pub fn resolve(&self, record: RawDisclosureRecord) -> ResolvedRecord {
        let outcome = match non_empty(record.raw_company_code.as_deref()) {
            Some(code) if self.codes.contains(code) => MatchOutcome::Matched {
                code: code.to_string(),
                tier: MatchTier::CompanyCode,
            },
            _ => self.match_with_tier(
                record.raw_tax_id.as_deref(),
                Some(record.raw_company_name.as_str()),
            ),
        };

        match outcome {
            MatchOutcome::Matched { code, tier } => ResolvedRecord {
                record,
                company_code: Some(code),
                tier: Some(tier),
            },
            MatchOutcome::Ambiguous { candidates } => {
                tracing::debug!(
                    name = %record.raw_company_name,
                    candidates,
                    "representative name is ambiguous; leaving unresolved"
                );
                ResolvedRecord::unresolved(record)
            }
            MatchOutcome::Unmatched => ResolvedRecord::unresolved(record),
        }
    }
}
