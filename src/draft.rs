//! Extraction result types: the structured invoice draft and its tri-state flags.
//!
//! A draft is the output of the extractor, before entitlement resolution and
//! persistence. Fields may be empty or zero; the tri-state flags may be
//! `Unknown`. Nothing in this module collapses `Unknown` to `false` — that
//! resolution happens explicitly in the orchestrator.

use serde::{Deserialize, Serialize};

/// Three-valued flag for CIS/VAT status.
///
/// `Unknown` means the transcript contained no canonical statement either way.
/// Serialized as a tagged string so JSON round-trips can never conflate
/// "not stated" with "stated false".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    Unknown,
    True,
    False,
}

impl Default for TriState {
    fn default() -> Self {
        TriState::Unknown
    }
}

impl TriState {
    /// Resolve to a boolean. `Unknown` resolves to the given default.
    pub fn resolve_or(self, default: bool) -> bool {
        match self {
            TriState::True => true,
            TriState::False => false,
            TriState::Unknown => default,
        }
    }

    /// Whether the flag carries an explicit statement.
    pub fn is_known(self) -> bool {
        !matches!(self, TriState::Unknown)
    }
}

impl From<bool> for TriState {
    fn from(v: bool) -> Self {
        if v {
            TriState::True
        } else {
            TriState::False
        }
    }
}

/// A single materials line on a draft or invoice.
///
/// `cost` is `None` when the speaker mentioned the material without a price;
/// such lines are kept for the user to complete and are excluded from the
/// materials subtotal until a cost exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialItem {
    pub description: String,
    pub cost: Option<f64>,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
}

fn default_quantity() -> f64 {
    1.0
}

impl MaterialItem {
    pub fn new(description: impl Into<String>, cost: Option<f64>) -> Self {
        Self {
            description: description.into(),
            cost,
            quantity: 1.0,
        }
    }

    pub fn with_quantity(mut self, quantity: f64) -> Self {
        self.quantity = quantity;
        self
    }
}

/// Structured extraction result for one recording.
///
/// Always well-formed: every field is present even when empty. The orchestrator
/// resolves the tri-state flags against plan entitlements before persisting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceDraft {
    /// Customer name as spoken; empty when none was mentioned.
    pub customer_name: String,
    /// One-line description of the job.
    pub job_summary: String,
    /// Labour hours, clamped to >= 0.
    pub labour_hours: f64,
    /// Materials in the order they were mentioned.
    pub materials: Vec<MaterialItem>,
    /// Whether the speaker said this is a CIS job.
    #[serde(default)]
    pub cis_job: TriState,
    /// Whether the speaker said VAT is charged.
    #[serde(default)]
    pub vat_registered: TriState,
    /// Free-text notes worth keeping on the invoice.
    pub notes: String,
}

impl InvoiceDraft {
    /// Clamp numeric fields into their valid ranges.
    ///
    /// Extraction output is model-generated; this guarantees the draft meets
    /// its own invariants regardless of what came back.
    pub fn sanitized(mut self) -> Self {
        if !self.labour_hours.is_finite() || self.labour_hours < 0.0 {
            self.labour_hours = 0.0;
        }
        for m in &mut self.materials {
            if let Some(cost) = m.cost {
                if !cost.is_finite() || cost < 0.0 {
                    m.cost = None;
                }
            }
            if !m.quantity.is_finite() || m.quantity <= 0.0 {
                m.quantity = 1.0;
            }
            m.description = m.description.trim().to_string();
        }
        self.materials.retain(|m| !m.description.is_empty());
        self.customer_name = self.customer_name.trim().to_string();
        self.job_summary = self.job_summary.trim().to_string();
        self.notes = self.notes.trim().to_string();
        self
    }
}
