//! Repository contracts for the device aggregate and its read model.
//!
//! All methods run through the caller's [`DbSession`], so a command's
//! reads, its optimistic update, and the outbox append share one
//! transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use db_pool::DbSession;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::Device;
use crate::error::Result;

pub use memory::InMemoryDeviceRepository;
pub use postgres::{SqlxDeviceReadRepository, SqlxDeviceRepository};

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn exists_by_mac(
        &self,
        session: &DbSession,
        tenant_id: Uuid,
        mac_address: &str,
    ) -> Result<bool>;

    /// Insert a new device; a `(tenant_id, mac_address)` uniqueness
    /// violation surfaces as a validation error.
    async fn add(&self, session: &DbSession, device: &Device) -> Result<()>;

    async fn count_by_tenant(&self, session: &DbSession, tenant_id: Uuid) -> Result<i64>;

    /// Ordered by `(created_at ASC, id ASC)`; the order is part of the
    /// pagination contract.
    async fn list_by_tenant(
        &self,
        session: &DbSession,
        tenant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Device>>;

    async fn get_by_id(
        &self,
        session: &DbSession,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<Device>>;

    /// Conditional update: writes the new status, `updated_at`, and
    /// `version = expected_version + 1` iff the row is still at
    /// `expected_version`. Returns whether exactly one row changed; the
    /// caller disambiguates conflict from not-found by re-reading.
    async fn update(
        &self,
        session: &DbSession,
        device: &Device,
        expected_version: i32,
    ) -> Result<bool>;
}

/// A row of the denormalized `device_read_model` projection.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectedDevice {
    pub id: Uuid,
    pub mac_address: String,
    pub status: String,
    pub owner_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}
