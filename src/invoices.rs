//! Invoice persistence and the usage-event log.
//!
//! Invoices store their tax *inputs* (flags and rates), never computed
//! totals. Totals are recomputed from the stored inputs at display time via
//! [`crate::tax::calculate`], so a rounding or rate fix never requires a data
//! migration.

use crate::draft::MaterialItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use uuid::Uuid;

/// Errors from the file-backed stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned: {0}")]
    Lock(String),

    #[error("Invoice not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition { from: InvoiceStatus, to: InvoiceStatus },
}

/// Invoice lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    /// Legal forward transitions. Paid and Cancelled are terminal.
    pub fn can_transition_to(self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Sent) | (Draft, Cancelled) | (Sent, Paid) | (Sent, Cancelled)
        )
    }
}

/// A stored invoice. Voice-created invoices always start as `Draft`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedInvoice {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub job_summary: String,
    pub labour_hours: f64,
    pub labour_rate: f64,
    pub cis_enabled: bool,
    pub cis_rate: f64,
    pub vat_enabled: bool,
    pub vat_rate: f64,
    #[serde(default)]
    pub materials: Vec<MaterialItem>,
    #[serde(default)]
    pub notes: Option<String>,
    pub status: InvoiceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The inputs needed to create an invoice record.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub owner_id: String,
    pub customer_id: Option<String>,
    pub job_summary: String,
    pub labour_hours: f64,
    pub labour_rate: f64,
    pub cis_enabled: bool,
    pub cis_rate: f64,
    pub vat_enabled: bool,
    pub vat_rate: f64,
    pub materials: Vec<MaterialItem>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct InvoiceData {
    invoices: Vec<PersistedInvoice>,
}

/// File-backed invoice store.
pub struct InvoiceStore {
    data: RwLock<InvoiceData>,
    file_path: PathBuf,
}

impl InvoiceStore {
    pub fn new(data_dir: PathBuf) -> Self {
        let file_path = data_dir.join("invoices.json");

        if let Some(parent) = file_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let data = Self::load_from_file(&file_path).unwrap_or_default();

        Self {
            data: RwLock::new(data),
            file_path,
        }
    }

    fn load_from_file(file_path: &PathBuf) -> Option<InvoiceData> {
        let content = fs::read_to_string(file_path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn save(&self) -> Result<(), StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Lock(e.to_string()))?;

        let content = serde_json::to_string_pretty(&*data)?;
        fs::write(&self.file_path, content)?;
        Ok(())
    }

    /// Persist a new invoice with status `Draft`.
    pub fn create(&self, new: NewInvoice) -> Result<PersistedInvoice, StoreError> {
        let now = Utc::now();
        let invoice = PersistedInvoice {
            id: Uuid::new_v4().to_string(),
            owner_id: new.owner_id,
            customer_id: new.customer_id,
            job_summary: new.job_summary,
            labour_hours: new.labour_hours,
            labour_rate: new.labour_rate,
            cis_enabled: new.cis_enabled,
            cis_rate: new.cis_rate,
            vat_enabled: new.vat_enabled,
            vat_rate: new.vat_rate,
            materials: new.materials,
            notes: new.notes,
            status: InvoiceStatus::Draft,
            created_at: now,
            updated_at: now,
        };

        {
            let mut data = self
                .data
                .write()
                .map_err(|e| StoreError::Lock(e.to_string()))?;
            // Newest first.
            data.invoices.insert(0, invoice.clone());
        }
        self.save()?;

        log::info!("Created draft invoice {} for owner {}", invoice.id, invoice.owner_id);
        Ok(invoice)
    }

    pub fn get(&self, id: &str) -> Result<Option<PersistedInvoice>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(data.invoices.iter().find(|i| i.id == id).cloned())
    }

    /// All invoices for one owner, newest first.
    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<PersistedInvoice>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(data
            .invoices
            .iter()
            .filter(|i| i.owner_id == owner_id)
            .cloned()
            .collect())
    }

    /// Move an invoice to a new status, enforcing the legal lifecycle.
    pub fn set_status(
        &self,
        id: &str,
        status: InvoiceStatus,
    ) -> Result<PersistedInvoice, StoreError> {
        let updated = {
            let mut data = self
                .data
                .write()
                .map_err(|e| StoreError::Lock(e.to_string()))?;

            let invoice = data
                .invoices
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            if !invoice.status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    from: invoice.status,
                    to: status,
                });
            }

            invoice.status = status;
            invoice.updated_at = Utc::now();
            invoice.clone()
        };
        self.save()?;
        Ok(updated)
    }
}

/// A usage event recorded after successful invoice creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub owner_id: String,
    pub invoice_id: String,
    pub transcript_chars: usize,
    pub recording_secs: f32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct UsageData {
    events: Vec<UsageEvent>,
}

/// Append-only usage log for quota accounting.
///
/// Recording usage is best-effort at the call site: the pipeline succeeds
/// even if this log cannot be written, so `append` failures are logged and
/// swallowed by the caller, never propagated to the user.
pub struct UsageLog {
    data: RwLock<UsageData>,
    file_path: PathBuf,
}

impl UsageLog {
    pub fn new(data_dir: PathBuf) -> Self {
        let file_path = data_dir.join("usage.json");

        if let Some(parent) = file_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let data = fs::read_to_string(&file_path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default();

        Self {
            data: RwLock::new(data),
            file_path,
        }
    }

    pub fn append(
        &self,
        owner_id: &str,
        invoice_id: &str,
        transcript_chars: usize,
        recording_secs: f32,
    ) -> Result<(), StoreError> {
        let event = UsageEvent {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            invoice_id: invoice_id.to_string(),
            transcript_chars,
            recording_secs,
            timestamp: Utc::now(),
        };

        {
            let mut data = self
                .data
                .write()
                .map_err(|e| StoreError::Lock(e.to_string()))?;
            data.events.push(event);
        }

        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        let content = serde_json::to_string_pretty(&*data)?;
        fs::write(&self.file_path, content)?;
        Ok(())
    }

    pub fn events_for_owner(&self, owner_id: &str) -> Result<Vec<UsageEvent>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(data
            .events
            .iter()
            .filter(|e| e.owner_id == owner_id)
            .cloned()
            .collect())
    }
}
