//! Tax calculation engine: labour/materials split, CIS deduction, VAT.
//!
//! Pure functions, no I/O, no state. Two invariants here are load-bearing for
//! legal correctness:
//!
//! - the CIS deduction is computed on the pre-VAT labour subtotal only, never
//!   on materials and never on the VAT-inclusive total;
//! - VAT is computed on the full subtotal (labour + materials), independent of
//!   whether CIS applies.
//!
//! All arithmetic stays in f64; rounding to 2 decimal places happens only in
//! [`TaxCalculation::rounded`] so intermediate values never compound rounding
//! error. Invalid numeric inputs are clamped to zero rather than rejected:
//! the engine is always fed from a sanitized draft.

use crate::draft::MaterialItem;
use serde::Serialize;

/// Standard UK CIS deduction rate for verified subcontractors, percent.
pub const DEFAULT_CIS_RATE: f64 = 20.0;

/// Standard UK VAT rate, percent.
pub const DEFAULT_VAT_RATE: f64 = 20.0;

/// Derived totals for one invoice. Never stored; recomputed from the stored
/// inputs on every read so displayed figures cannot drift from their source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TaxCalculation {
    pub labour_subtotal: f64,
    pub materials_subtotal: f64,
    /// labour + materials, before VAT.
    pub subtotal: f64,
    pub vat_amount: f64,
    /// What the customer owes: subtotal + VAT. The headline total regardless
    /// of CIS status.
    pub invoice_total: f64,
    /// Withheld from labour under CIS; zero when CIS does not apply.
    pub cis_deduction: f64,
    /// What the tradesperson actually receives: invoice_total - cis_deduction.
    pub net_payment: f64,
}

impl TaxCalculation {
    /// Round every figure to 2 decimal places for display.
    pub fn rounded(&self) -> TaxCalculation {
        TaxCalculation {
            labour_subtotal: round2(self.labour_subtotal),
            materials_subtotal: round2(self.materials_subtotal),
            subtotal: round2(self.subtotal),
            vat_amount: round2(self.vat_amount),
            invoice_total: round2(self.invoice_total),
            cis_deduction: round2(self.cis_deduction),
            net_payment: round2(self.net_payment),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Clamp a numeric input to a usable non-negative value.
fn clamp_non_negative(v: f64) -> f64 {
    if !v.is_finite() || v < 0.0 {
        0.0
    } else {
        v
    }
}

/// Sum of cost x quantity over materials that have a cost.
///
/// Null-cost materials are excluded from the subtotal but remain on the draft
/// for the user to complete.
pub fn materials_subtotal(materials: &[MaterialItem]) -> f64 {
    materials
        .iter()
        .filter_map(|m| {
            m.cost
                .map(|c| clamp_non_negative(c) * clamp_non_negative(m.quantity))
        })
        .sum()
}

/// Compute the full tax breakdown for an invoice.
///
/// `cis_enabled`/`vat_enabled` are resolved booleans: callers must resolve any
/// tri-state unknown before this point. Rates are percentages (20.0 = 20%).
pub fn calculate(
    labour_hours: f64,
    labour_rate: f64,
    materials: &[MaterialItem],
    cis_enabled: bool,
    cis_rate: f64,
    vat_enabled: bool,
    vat_rate: f64,
) -> TaxCalculation {
    let labour_hours = clamp_non_negative(labour_hours);
    let labour_rate = clamp_non_negative(labour_rate);
    let cis_rate = clamp_non_negative(cis_rate);
    let vat_rate = clamp_non_negative(vat_rate);

    let labour_subtotal = labour_hours * labour_rate;
    let materials_subtotal = materials_subtotal(materials);
    let subtotal = labour_subtotal + materials_subtotal;

    let vat_amount = if vat_enabled {
        subtotal * vat_rate / 100.0
    } else {
        0.0
    };

    let invoice_total = subtotal + vat_amount;

    // CIS is withheld from labour only, on the pre-VAT figure.
    let cis_deduction = if cis_enabled {
        labour_subtotal * cis_rate / 100.0
    } else {
        0.0
    };

    let net_payment = invoice_total - cis_deduction;

    TaxCalculation {
        labour_subtotal,
        materials_subtotal,
        subtotal,
        vat_amount,
        invoice_total,
        cis_deduction,
        net_payment,
    }
}
