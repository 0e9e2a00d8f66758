//! PostgreSQL repositories.

use async_trait::async_trait;
use db_pool::DbSession;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::domain::{Device, DeviceStatus};
use crate::error::{AppError, Result};

use super::{DeviceRepository, ProjectedDevice};

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

pub struct SqlxDeviceRepository;

fn to_device(row: &PgRow) -> Result<Device> {
    let status: String = row.try_get("status").map_err(AppError::from)?;
    Ok(Device {
        id: row.try_get("id").map_err(AppError::from)?,
        tenant_id: row.try_get("tenant_id").map_err(AppError::from)?,
        mac_address: row.try_get("mac_address").map_err(AppError::from)?,
        status: DeviceStatus::parse(&status)?,
        created_at: row.try_get("created_at").map_err(AppError::from)?,
        updated_at: row.try_get("updated_at").map_err(AppError::from)?,
        version: row.try_get("version").map_err(AppError::from)?,
    })
}

#[async_trait]
impl DeviceRepository for SqlxDeviceRepository {
    async fn exists_by_mac(
        &self,
        session: &DbSession,
        tenant_id: Uuid,
        mac_address: &str,
    ) -> Result<bool> {
        let mut conn = session.acquire().await;
        let row = sqlx::query(
            "SELECT id FROM devices WHERE tenant_id = $1 AND mac_address = $2 LIMIT 1",
        )
        .bind(tenant_id)
        .bind(mac_address)
        .fetch_optional(conn.conn()?)
        .await?;
        Ok(row.is_some())
    }

    async fn add(&self, session: &DbSession, device: &Device) -> Result<()> {
        let mut conn = session.acquire().await;
        let result = sqlx::query(
            r#"
            INSERT INTO devices (id, tenant_id, mac_address, status, created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(device.id)
        .bind(device.tenant_id)
        .bind(&device.mac_address)
        .bind(device.status.as_str())
        .bind(device.created_at)
        .bind(device.updated_at)
        .bind(device.version)
        .execute(conn.conn()?)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(AppError::Validation(
                    "MAC address already exists for tenant".into(),
                ))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn count_by_tenant(&self, session: &DbSession, tenant_id: Uuid) -> Result<i64> {
        let mut conn = session.acquire().await;
        let row = sqlx::query("SELECT COUNT(*)::BIGINT AS total FROM devices WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(conn.conn()?)
            .await?;
        Ok(row.try_get("total")?)
    }

    async fn list_by_tenant(
        &self,
        session: &DbSession,
        tenant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Device>> {
        let mut conn = session.acquire().await;
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, mac_address, status, created_at, updated_at, version
            FROM devices
            WHERE tenant_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(conn.conn()?)
        .await?;

        rows.iter().map(to_device).collect()
    }

    async fn get_by_id(
        &self,
        session: &DbSession,
        tenant_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<Device>> {
        let mut conn = session.acquire().await;
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, mac_address, status, created_at, updated_at, version
            FROM devices
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(device_id)
        .fetch_optional(conn.conn()?)
        .await?;

        row.as_ref().map(to_device).transpose()
    }

    async fn update(
        &self,
        session: &DbSession,
        device: &Device,
        expected_version: i32,
    ) -> Result<bool> {
        let mut conn = session.acquire().await;
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET status = $4, mac_address = $5, updated_at = $6, version = $7
            WHERE tenant_id = $1 AND id = $2 AND version = $3
            "#,
        )
        .bind(device.tenant_id)
        .bind(device.id)
        .bind(expected_version)
        .bind(device.status.as_str())
        .bind(&device.mac_address)
        .bind(device.updated_at)
        .bind(expected_version + 1)
        .execute(conn.conn()?)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Read-only access to the denormalized `device_read_model`.
pub struct SqlxDeviceReadRepository;

impl SqlxDeviceReadRepository {
    pub async fn list_by_tenant(
        &self,
        session: &DbSession,
        tenant_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<ProjectedDevice>, i64)> {
        let mut conn = session.acquire().await;
        let conn = conn.conn()?;

        let count_row =
            sqlx::query("SELECT COUNT(*)::BIGINT AS total FROM device_read_model WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(&mut *conn)
                .await?;
        let total: i64 = count_row.try_get("total")?;

        let rows = sqlx::query(
            r#"
            SELECT id, mac_address, status, owner_email, created_at, updated_at, version
            FROM device_read_model
            WHERE tenant_id = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?;

        let devices = rows
            .into_iter()
            .map(|row| {
                Ok(ProjectedDevice {
                    id: row.try_get("id")?,
                    mac_address: row.try_get("mac_address")?,
                    status: row.try_get("status")?,
                    owner_email: row.try_get("owner_email")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                    version: row.try_get("version")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;

        Ok((devices, total))
    }
}
