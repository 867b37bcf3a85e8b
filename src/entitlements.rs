//! Plan access checks.
//!
//! The billing service behind these checks is external; this module defines
//! the read-only trait the pipeline calls and a session-scoped cache so a
//! single pipeline instance hits the service at most once per owner.

use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error("Plan service unavailable: {0}")]
    Unavailable(String),
}

/// Verdict for invoice creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceAllowance {
    pub allowed: bool,
    /// Human-readable reason when `allowed` is false, e.g. the monthly quota.
    pub reason: Option<String>,
}

impl InvoiceAllowance {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Per-owner entitlement snapshot.
#[derive(Debug, Clone)]
pub struct PlanEntitlements {
    pub invoice_allowance: InvoiceAllowance,
    pub vat_enabled: bool,
    pub cis_enabled: bool,
}

/// Read-only view of what an owner's plan permits.
#[async_trait]
pub trait PlanAccess: Send + Sync {
    /// May the owner create another invoice right now?
    async fn can_create_invoice(&self, owner_id: &str) -> Result<InvoiceAllowance, EntitlementError>;

    /// Does the owner's plan include VAT handling?
    async fn can_use_vat(&self, owner_id: &str) -> Result<bool, EntitlementError>;

    /// Does the owner's plan include CIS handling?
    async fn can_use_cis(&self, owner_id: &str) -> Result<bool, EntitlementError>;
}

/// Caches one [`PlanEntitlements`] snapshot per owner for the lifetime of the
/// holder.
///
/// Owned by the pipeline rather than shared globally so entitlements are
/// re-read whenever a new pipeline is constructed, but never mid-run.
#[derive(Default)]
pub struct EntitlementCache {
    by_owner: HashMap<String, PlanEntitlements>,
}

impl EntitlementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (and cache) the owner's entitlements.
    pub async fn get(
        &mut self,
        access: &dyn PlanAccess,
        owner_id: &str,
    ) -> Result<PlanEntitlements, EntitlementError> {
        if let Some(cached) = self.by_owner.get(owner_id) {
            return Ok(cached.clone());
        }

        let snapshot = PlanEntitlements {
            invoice_allowance: access.can_create_invoice(owner_id).await?,
            vat_enabled: access.can_use_vat(owner_id).await?,
            cis_enabled: access.can_use_cis(owner_id).await?,
        };
        log::info!(
            "Entitlements for owner {}: invoices={}, vat={}, cis={}",
            owner_id,
            snapshot.invoice_allowance.allowed,
            snapshot.vat_enabled,
            snapshot.cis_enabled
        );
        self.by_owner.insert(owner_id.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Drop all cached snapshots.
    pub fn clear(&mut self) {
        self.by_owner.clear();
    }
}
