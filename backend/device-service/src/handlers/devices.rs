//! HTTP endpoints for device commands and queries.
//!
//! Handlers are thin: open a session, run the application service,
//! commit on success. Single objects come back as `{"data": …}`, lists
//! as `{"data": […], "page": …}`.

use actix_web::{web, HttpResponse};
use db_pool::DbSession;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use transactional_outbox::SqlxOutboxRepository;
use uuid::Uuid;

use crate::auth::RequestContext;
use crate::error::{AppError, Result};
use crate::repository::{SqlxDeviceReadRepository, SqlxDeviceRepository};
use crate::services::{
    ChangeDeviceStatusCommand, CreateDeviceCommand, DeviceService, ListDevicesQuery, PageMeta,
};

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/devices")
            .route("", web::post().to(create_device))
            .route("", web::get().to(list_devices))
            .route("/projected", web::get().to(list_projected_devices))
            .route("/{device_id}", web::get().to(get_device))
            .route("/{device_id}/retire", web::post().to(retire_device))
            .route("/{device_id}/activate", web::post().to(activate_device)),
    );
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceBody {
    pub mac_address: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangeStatusBody {
    pub reason: String,
    pub expected_version: i32,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
struct DataResponse<T: Serialize> {
    data: T,
}

#[derive(Serialize)]
struct ListResponse<T: Serialize> {
    data: Vec<T>,
    page: PageMeta,
}

fn page_query(params: &ListParams) -> Result<ListDevicesQuery> {
    let limit = params.limit.unwrap_or(50);
    let offset = params.offset.unwrap_or(0);
    if !(1..=1000).contains(&limit) {
        return Err(AppError::Validation(
            "limit must be between 1 and 1000".into(),
        ));
    }
    if offset < 0 {
        return Err(AppError::Validation("offset must not be negative".into()));
    }
    Ok(ListDevicesQuery { limit, offset })
}

fn service() -> DeviceService<SqlxDeviceRepository, SqlxOutboxRepository> {
    DeviceService::new(SqlxDeviceRepository, SqlxOutboxRepository)
}

/// Commit on success, roll back on error.
async fn finish<T>(session: DbSession, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            session.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let _ = session.rollback().await;
            Err(err)
        }
    }
}

async fn create_device(
    pool: web::Data<PgPool>,
    ctx: RequestContext,
    body: web::Json<CreateDeviceBody>,
) -> Result<HttpResponse> {
    let session = DbSession::begin(&pool).await?;
    let result = service()
        .create(
            &session,
            &ctx,
            CreateDeviceCommand {
                mac_address: body.mac_address.clone(),
            },
        )
        .await;
    let view = finish(session, result).await?;
    Ok(HttpResponse::Created().json(DataResponse { data: view }))
}

async fn list_devices(
    pool: web::Data<PgPool>,
    ctx: RequestContext,
    params: web::Query<ListParams>,
) -> Result<HttpResponse> {
    let query = page_query(&params)?;
    let session = DbSession::begin(&pool).await?;
    let result = service().list(&session, &ctx, query).await;
    let (data, page) = finish(session, result).await?;
    Ok(HttpResponse::Ok().json(ListResponse { data, page }))
}

async fn list_projected_devices(
    pool: web::Data<PgPool>,
    ctx: RequestContext,
    params: web::Query<ListParams>,
) -> Result<HttpResponse> {
    let query = page_query(&params)?;
    let session = DbSession::begin(&pool).await?;
    let result = SqlxDeviceReadRepository
        .list_by_tenant(&session, ctx.tenant_id, query.limit, query.offset)
        .await;
    let (data, total) = finish(session, result).await?;
    let page = PageMeta {
        limit: query.limit,
        offset: query.offset,
        total,
        has_next: query.offset + (data.len() as i64) < total,
        order_by: ["created_at", "id"],
    };
    Ok(HttpResponse::Ok().json(ListResponse { data, page }))
}

async fn get_device(
    pool: web::Data<PgPool>,
    ctx: RequestContext,
    device_id: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let session = DbSession::begin(&pool).await?;
    let result = service().get(&session, &ctx, *device_id).await;
    let view = finish(session, result).await?;
    Ok(HttpResponse::Ok().json(DataResponse { data: view }))
}

async fn retire_device(
    pool: web::Data<PgPool>,
    ctx: RequestContext,
    device_id: web::Path<Uuid>,
    body: web::Json<ChangeStatusBody>,
) -> Result<HttpResponse> {
    let session = DbSession::begin(&pool).await?;
    let result = service()
        .retire(
            &session,
            &ctx,
            *device_id,
            ChangeDeviceStatusCommand {
                reason: body.reason.clone(),
                expected_version: body.expected_version,
            },
        )
        .await;
    let view = finish(session, result).await?;
    Ok(HttpResponse::Ok().json(DataResponse { data: view }))
}

async fn activate_device(
    pool: web::Data<PgPool>,
    ctx: RequestContext,
    device_id: web::Path<Uuid>,
    body: web::Json<ChangeStatusBody>,
) -> Result<HttpResponse> {
    let session = DbSession::begin(&pool).await?;
    let result = service()
        .activate(
            &session,
            &ctx,
            *device_id,
            ChangeDeviceStatusCommand {
                reason: body.reason.clone(),
                expected_version: body.expected_version,
            },
        )
        .await;
    let view = finish(session, result).await?;
    Ok(HttpResponse::Ok().json(DataResponse { data: view }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_query_applies_defaults() {
        let query = page_query(&ListParams {
            limit: None,
            offset: None,
        })
        .unwrap();
        assert_eq!(query.limit, 50);
        assert_eq!(query.offset, 0);
    }

    #[test]
    fn page_query_rejects_out_of_range_values() {
        for (limit, offset) in [(Some(0), None), (Some(1001), None), (None, Some(-1))] {
            assert!(page_query(&ListParams { limit, offset }).is_err());
        }
        assert!(page_query(&ListParams {
            limit: Some(1000),
            offset: Some(0)
        })
        .is_ok());
    }
}
