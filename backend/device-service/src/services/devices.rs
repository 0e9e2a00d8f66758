//! Device application service.
//!
//! Composes `get -> mutate -> update(expected) -> outbox append` on one
//! database session per command. When the optimistic update touches no
//! row, a re-read disambiguates a version conflict from a vanished
//! device.

use chrono::{DateTime, Utc};
use db_pool::DbSession;
use event_schema::{DeviceEventPayload, DEVICE_ACTIVATED, DEVICE_CREATED, DEVICE_RETIRED};
use serde::Serialize;
use transactional_outbox::{OutboxEvent, OutboxRepository};
use tracing::info;
use uuid::Uuid;

use crate::auth::RequestContext;
use crate::domain::{normalize_mac, Device, DeviceStatus};
use crate::error::{AppError, Result};
use crate::repository::DeviceRepository;

#[derive(Debug, Clone)]
pub struct CreateDeviceCommand {
    pub mac_address: String,
}

#[derive(Debug, Clone)]
pub struct ChangeDeviceStatusCommand {
    pub reason: String,
    pub expected_version: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct ListDevicesQuery {
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    pub id: Uuid,
    pub mac_address: String,
    pub status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

impl From<&Device> for DeviceView {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id,
            mac_address: device.mac_address.clone(),
            status: device.status,
            created_at: device.created_at,
            updated_at: device.updated_at,
            version: device.version,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageMeta {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
    pub has_next: bool,
    pub order_by: [&'static str; 2],
}

pub struct DeviceService<R, O> {
    repo: R,
    outbox: O,
}

impl<R: DeviceRepository, O: OutboxRepository> DeviceService<R, O> {
    pub fn new(repo: R, outbox: O) -> Self {
        Self { repo, outbox }
    }

    pub async fn create(
        &self,
        session: &DbSession,
        ctx: &RequestContext,
        cmd: CreateDeviceCommand,
    ) -> Result<DeviceView> {
        let mac = normalize_mac(&cmd.mac_address)?;
        if self.repo.exists_by_mac(session, ctx.tenant_id, &mac).await? {
            return Err(AppError::Validation(
                "MAC address already exists for tenant".into(),
            ));
        }

        let device = Device::register(ctx.tenant_id, mac, Utc::now());
        self.repo.add(session, &device).await?;

        let event = OutboxEvent::new(
            ctx.tenant_id,
            DEVICE_CREATED,
            DeviceEventPayload::created(device.id, &ctx.user_id).to_json(),
        );
        self.outbox.append(session, &event).await?;

        info!(device_id = %device.id, tenant_id = %ctx.tenant_id, "device registered");
        Ok(DeviceView::from(&device))
    }

    pub async fn get(
        &self,
        session: &DbSession,
        ctx: &RequestContext,
        device_id: Uuid,
    ) -> Result<DeviceView> {
        let device = self
            .repo
            .get_by_id(session, ctx.tenant_id, device_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Device not found".into()))?;
        Ok(DeviceView::from(&device))
    }

    pub async fn list(
        &self,
        session: &DbSession,
        ctx: &RequestContext,
        query: ListDevicesQuery,
    ) -> Result<(Vec<DeviceView>, PageMeta)> {
        let total = self.repo.count_by_tenant(session, ctx.tenant_id).await?;
        let devices = self
            .repo
            .list_by_tenant(session, ctx.tenant_id, query.limit, query.offset)
            .await?;
        let data: Vec<DeviceView> = devices.iter().map(DeviceView::from).collect();
        let page = PageMeta {
            limit: query.limit,
            offset: query.offset,
            total,
            has_next: query.offset + (data.len() as i64) < total,
            order_by: ["created_at", "id"],
        };
        Ok((data, page))
    }

    pub async fn retire(
        &self,
        session: &DbSession,
        ctx: &RequestContext,
        device_id: Uuid,
        cmd: ChangeDeviceStatusCommand,
    ) -> Result<DeviceView> {
        self.change_status(session, ctx, device_id, cmd, DeviceStatus::Retired)
            .await
    }

    pub async fn activate(
        &self,
        session: &DbSession,
        ctx: &RequestContext,
        device_id: Uuid,
        cmd: ChangeDeviceStatusCommand,
    ) -> Result<DeviceView> {
        self.change_status(session, ctx, device_id, cmd, DeviceStatus::Active)
            .await
    }

    async fn change_status(
        &self,
        session: &DbSession,
        ctx: &RequestContext,
        device_id: Uuid,
        cmd: ChangeDeviceStatusCommand,
        target: DeviceStatus,
    ) -> Result<DeviceView> {
        if cmd.expected_version < 1 {
            return Err(AppError::Validation(
                "expected_version must be at least 1".into(),
            ));
        }

        let device = self
            .repo
            .get_by_id(session, ctx.tenant_id, device_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Device not found".into()))?;

        let now = Utc::now();
        let changed = match target {
            DeviceStatus::Retired => device.retire(&cmd.reason, now)?,
            DeviceStatus::Active => device.activate(&cmd.reason, now)?,
        };

        let updated = self
            .repo
            .update(session, &changed, cmd.expected_version)
            .await?;
        if !updated {
            let still_exists = self
                .repo
                .get_by_id(session, ctx.tenant_id, device_id)
                .await?
                .is_some();
            if !still_exists {
                return Err(AppError::NotFound("Device not found".into()));
            }
            return Err(AppError::Conflict(
                "Device was updated by another request".into(),
            ));
        }

        let event_type = match target {
            DeviceStatus::Retired => DEVICE_RETIRED,
            DeviceStatus::Active => DEVICE_ACTIVATED,
        };
        let event = OutboxEvent::new(
            ctx.tenant_id,
            event_type,
            DeviceEventPayload::status_changed(device.id, &ctx.user_id, &cmd.reason).to_json(),
        );
        self.outbox.append(session, &event).await?;

        info!(
            device_id = %device.id,
            tenant_id = %ctx.tenant_id,
            status = target.as_str(),
            "device status changed"
        );

        // Reflect the persisted row: the conditional update bumped the
        // version past the expected one.
        let persisted = Device {
            version: cmd.expected_version + 1,
            ..changed
        };
        Ok(DeviceView::from(&persisted))
    }
}
