//! In-memory device repository for tests.
//!
//! Mirrors the Postgres semantics the service relies on: tenant-scoped
//! MAC uniqueness, `(created_at, id)` listing order, and the optimistic
//! version check on update. The session argument is ignored.

use async_trait::async_trait;
use db_pool::DbSession;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::Device;
use crate::error::{AppError, Result};

use super::DeviceRepository;

/// Clones share state, so tests keep a handle for assertions while the
/// service owns its copy.
#[derive(Clone, Default)]
pub struct InMemoryDeviceRepository {
    devices: Arc<Mutex<Vec<Device>>>,
}

impl InMemoryDeviceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read of the stored aggregate, bypassing tenant scoping.
    pub fn stored(&self, device_id: Uuid) -> Option<Device> {
        self.devices.lock().iter().find(|d| d.id == device_id).cloned()
    }
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepository {
    async fn exists_by_mac(
        &self,
        _session: &DbSession,
        tenant_id: Uuid,
        mac_address: &str,
    ) -> Result<bool> {
        Ok(self
            .devices
            .lock()
            .iter()
            .any(|d| d.tenant_id == tenant_id && d.mac_address == mac_address))
    }

    async fn add(&self, _session: &DbSession, device: &Device) -> Result<()> {
        let mut devices = self.devices.lock();
        if devices
            .iter()
            .any(|d| d.tenant_id == device.tenant_id && d.mac_address == device.mac_address)
        {
            return Err(AppError::Validation(
                "MAC address already exists for tenant".into(),
            ));
        }
        devices.push(device.clone());
        Ok(())
    }

    async fn count_by_tenant(&self, _session: &DbSession, tenant_id: Uuid) -> Result<i64> {
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|d| d.tenant_id == tenant_id)
            .count() as i64)
    }

    async fn list_by_tenant(
        &self,
        _session: &DbSession,
        tenant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Device>> {
        let mut scoped: Vec<Device> = self
            .devices
            .lock()
            .iter()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect();
        scoped.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(scoped
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn get_by_id(
        &self,
        _session: &DbSession,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<Device>> {
        Ok(self
            .devices
            .lock()
            .iter()
            .find(|d| d.tenant_id == tenant_id && d.id == device_id)
            .cloned())
    }

    async fn update(
        &self,
        _session: &DbSession,
        device: &Device,
        expected_version: i32,
    ) -> Result<bool> {
        let mut devices = self.devices.lock();
        let Some(stored) = devices.iter_mut().find(|d| {
            d.tenant_id == device.tenant_id && d.id == device.id && d.version == expected_version
        }) else {
            return Ok(false);
        };
        *stored = Device {
            version: expected_version + 1,
            ..device.clone()
        };
        Ok(true)
    }
}
