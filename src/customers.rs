//! Customer records and idempotent resolution by name.

use crate::invoices::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use uuid::Uuid;

/// A customer belonging to one account owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Customer {
    fn new(owner_id: &str, name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CustomerData {
    customers: Vec<Customer>,
}

/// File-backed customer store.
///
/// Loads once at construction and writes the whole file per mutation. Lookup
/// is exact-match on (owner, name), so "Mrs Patel" and "mrs patel" are two
/// customers; dedupe beyond exact names belongs to the account owner.
pub struct CustomerStore {
    data: RwLock<CustomerData>,
    file_path: PathBuf,
}

impl CustomerStore {
    pub fn new(data_dir: PathBuf) -> Self {
        let file_path = data_dir.join("customers.json");

        if let Some(parent) = file_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        let data = Self::load_from_file(&file_path).unwrap_or_default();

        Self {
            data: RwLock::new(data),
            file_path,
        }
    }

    fn load_from_file(file_path: &PathBuf) -> Option<CustomerData> {
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

    /// Resolve a customer name to an id, creating the record if it does not
    /// exist yet.
    ///
    /// Returns `None` for a blank name: an invoice without a customer stays
    /// unlinked rather than pointing at an empty-named record. Calling twice
    /// with the same (owner, name) returns the same id.
    pub fn ensure_customer(
        &self,
        owner_id: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }

        {
            let data = self
                .data
                .read()
                .map_err(|e| StoreError::Lock(e.to_string()))?;
            if let Some(existing) = data
                .customers
                .iter()
                .find(|c| c.owner_id == owner_id && c.name == name)
            {
                return Ok(Some(existing.id.clone()));
            }
        }

        let customer = Customer::new(owner_id, name);
        let id = customer.id.clone();
        {
            let mut data = self
                .data
                .write()
                .map_err(|e| StoreError::Lock(e.to_string()))?;
            // Re-check under the write lock in case of a racing insert.
            if let Some(existing) = data
                .customers
                .iter()
                .find(|c| c.owner_id == owner_id && c.name == name)
            {
                return Ok(Some(existing.id.clone()));
            }
            data.customers.push(customer);
        }
        self.save()?;

        log::info!("Created customer {} for owner {}", id, owner_id);
        Ok(Some(id))
    }

    /// Look up a customer by id.
    pub fn get(&self, id: &str) -> Result<Option<Customer>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(data.customers.iter().find(|c| c.id == id).cloned())
    }

    /// All customers for one owner.
    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Customer>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(data
            .customers
            .iter()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect())
    }
}
