//! Plan catalog
//!
//! Static quota/feature table per [`PlanTier`] plus the versioned lookup table
//! that maps processor price ids to tiers. This is the only place a price id
//! is ever interpreted.

use std::collections::HashMap;

use estate_shared::{FeatureFlag, PlanTier};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Quotas and feature flags granted by a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub max_listings: u32,
    pub max_images_per_listing: u32,
    pub allowed_features: &'static [FeatureFlag],
}

impl PlanLimits {
    pub fn allows(&self, feature: FeatureFlag) -> bool {
        self.allowed_features.contains(&feature)
    }
}

const FREE_LIMITS: PlanLimits = PlanLimits {
    max_listings: 1,
    max_images_per_listing: 5,
    allowed_features: &[],
};

const PRO_LIMITS: PlanLimits = PlanLimits {
    max_listings: 25,
    max_images_per_listing: 16,
    allowed_features: &[
        FeatureFlag::LeadForm,
        FeatureFlag::NewsletterForm,
        FeatureFlag::WhatsAppButton,
        FeatureFlag::EmailSupport,
    ],
};

const ELITE_LIMITS: PlanLimits = PlanLimits {
    max_listings: 100,
    max_images_per_listing: 16,
    allowed_features: &[
        FeatureFlag::LeadForm,
        FeatureFlag::NewsletterForm,
        FeatureFlag::WhatsAppButton,
        FeatureFlag::EmailSupport,
        FeatureFlag::PrioritySupport,
    ],
};

/// Versioned mapping from processor price ids to tiers
///
/// File format: `{"version": 2, "references": {"price_abc": "pro"}}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanReferenceTable {
    pub version: u32,
    pub references: HashMap<String, PlanTier>,
}

impl PlanReferenceTable {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            references: HashMap::new(),
        }
    }

    /// Builder-style insert used by configuration and tests
    pub fn with_reference(mut self, reference: impl Into<String>, tier: PlanTier) -> Self {
        self.references.insert(reference.into(), tier);
        self
    }

    pub fn from_json(json: &str) -> BillingResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| BillingError::Config(format!("invalid plan reference table: {}", e)))
    }
}

/// Plan catalog shared read-only by every billing component
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    table: PlanReferenceTable,
}

impl PlanCatalog {
    pub fn new(table: PlanReferenceTable) -> Self {
        Self { table }
    }

    /// Load the reference table from `PLAN_REFERENCE_TABLE` (a JSON file path),
    /// falling back to `STRIPE_PRICE_PRO` / `STRIPE_PRICE_ELITE` as version 1.
    pub fn from_env() -> BillingResult<Self> {
        if let Some(path) = read_env("PLAN_REFERENCE_TABLE") {
            let json = std::fs::read_to_string(&path).map_err(|e| {
                BillingError::Config(format!("cannot read plan reference table {}: {}", path, e))
            })?;
            let table = PlanReferenceTable::from_json(&json)?;
            tracing::info!(
                path = %path,
                version = table.version,
                references = table.references.len(),
                "Loaded plan reference table"
            );
            return Ok(Self::new(table));
        }

        let mut table = PlanReferenceTable::new(1);
        for (var, tier) in [
            ("STRIPE_PRICE_PRO", PlanTier::Pro),
            ("STRIPE_PRICE_ELITE", PlanTier::Elite),
        ] {
            for price_id in read_env(var)
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
            {
                table.references.insert(price_id.to_string(), tier);
            }
        }

        if table.references.is_empty() {
            tracing::warn!("No paid price ids configured - every subscription resolves to Free");
        }

        Ok(Self::new(table))
    }

    /// Quotas and features for a tier
    pub fn limits_for(tier: PlanTier) -> PlanLimits {
        match tier {
            PlanTier::Free => FREE_LIMITS,
            PlanTier::Pro => PRO_LIMITS,
            PlanTier::Elite => ELITE_LIMITS,
        }
    }

    /// Map a processor price id to a tier. Unrecognized references are Free.
    pub fn tier_from_external_reference(&self, reference: &str) -> PlanTier {
        match self.table.references.get(reference.trim()) {
            Some(tier) => *tier,
            None => {
                if !reference.trim().is_empty() {
                    tracing::warn!(
                        reference = %reference,
                        table_version = self.table.version,
                        "Unrecognized plan reference, treating as free tier"
                    );
                }
                PlanTier::Free
            }
        }
    }

    pub fn table_version(&self) -> u32 {
        self.table.version
    }

    /// Price ids configured for a tier, sorted for stable output
    pub fn references_for(&self, tier: PlanTier) -> Vec<&str> {
        let mut refs: Vec<&str> = self
            .table
            .references
            .iter()
            .filter(|(_, t)| **t == tier)
            .map(|(r, _)| r.as_str())
            .collect();
        refs.sort_unstable();
        refs
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
