//! Quote Data Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::metrics::PrintMetrics;
use crate::pricing::PriceBreakdown;

/// Opaque server-generated identifier: `q_` followed by 32 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuoteId(String);

impl QuoteId {
    pub fn generate() -> Self {
        Self(format!("q_{}", Uuid::new_v4().simple()))
    }

    /// Accepts only well-formed ids, so an id is always safe as a path segment.
    pub fn parse(raw: &str) -> Option<Self> {
        let hex = raw.strip_prefix("q_")?;
        let well_formed = hex.len() == 32
            && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-chosen print parameters. Signed as part of the quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteParams {
    pub material: String,
    pub quality: String,
    pub printer: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default = "default_infill")]
    pub infill_percent: u8,
    #[serde(default)]
    pub supports: bool,
    #[serde(default)]
    pub post_processing: Vec<String>,
}

fn default_quantity() -> u32 { 1 }
fn default_infill() -> u8 { 20 }

impl QuoteParams {
    /// Lowercases keys and drops duplicate post-processing entries.
    pub fn normalized(mut self) -> Self {
        self.material = self.material.trim().to_ascii_lowercase();
        self.quality = self.quality.trim().to_ascii_lowercase();
        self.printer = self.printer.trim().to_ascii_lowercase();
        for key in &mut self.post_processing {
            *key = key.trim().to_ascii_lowercase();
        }
        self.post_processing.sort();
        self.post_processing.dedup();
        self
    }
}

/// Everything derived from slicing and pricing. Signed as part of the quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteComputed {
    pub metrics: PrintMetrics,
    pub pricing: PriceBreakdown,
}

/// Lifecycle state. `lockedAt` exists exactly when the quote is locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QuoteStatus {
    Draft,
    Locked {
        #[serde(rename = "lockedAt")]
        locked_at: DateTime<Utc>,
    },
}

impl QuoteStatus {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Draft => None,
            Self::Locked { locked_at } => Some(*locked_at),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Locked { .. } => "locked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub quote_id: QuoteId,
    pub params: QuoteParams,
    pub computed: QuoteComputed,
    #[serde(flatten)]
    pub status: QuoteStatus,
    pub signature: String,
    pub created_at: DateTime<Utc>,
    /// Model reference the quote was sliced from, relative to the uploads dir.
    pub model: String,
    /// Fingerprint of the slicer profile used; drives re-slicing on refresh.
    pub profile_fingerprint: String,
    pub config_version: String,
    /// Version of this crate that priced the quote, not the slicer's.
    pub core_version: String,
}
