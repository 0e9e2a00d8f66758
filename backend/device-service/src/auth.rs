//! Internal request identity.
//!
//! Every request must carry the shared-secret `x-internal-token` plus the
//! `x-tenant-id` / `x-user-id` identity headers set by the gateway. The
//! user id is an opaque identity string, not necessarily a UUID: the
//! worker's saga compensation calls authenticate as `system`.

use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use futures::future::{ready, Ready};
use uuid::Uuid;

use crate::config::Config;
use crate::error::AppError;

/// Identity extracted from the internal headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: Uuid,
    pub user_id: String,
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn extract(req: &HttpRequest) -> Result<RequestContext, AppError> {
    let config = req
        .app_data::<web::Data<Config>>()
        .ok_or_else(|| AppError::Database("service configuration missing".into()))?;

    let token = header(req, "x-internal-token");
    if token != Some(config.auth.internal_token.as_str()) {
        return Err(AppError::Unauthorized("Invalid internal token".into()));
    }

    let tenant = header(req, "x-tenant-id").unwrap_or("");
    let user = header(req, "x-user-id").unwrap_or("");
    if tenant.is_empty() || user.is_empty() {
        return Err(AppError::Unauthorized(
            "Missing internal identity headers".into(),
        ));
    }

    let tenant_id = Uuid::parse_str(tenant)
        .map_err(|_| AppError::Unauthorized("Invalid tenant_id".into()))?;

    Ok(RequestContext {
        tenant_id,
        user_id: user.to_string(),
    })
}

impl FromRequest for RequestContext {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(extract(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn config() -> web::Data<Config> {
        std::env::remove_var("DEVICE_SERVICE_TOKEN");
        web::Data::new(Config::from_env())
    }

    #[actix_web::test]
    async fn accepts_valid_headers() {
        let tenant = Uuid::new_v4();
        let req = TestRequest::default()
            .app_data(config())
            .insert_header(("x-internal-token", "dev-shared-secret"))
            .insert_header(("x-tenant-id", tenant.to_string()))
            .insert_header(("x-user-id", "system"))
            .to_http_request();

        let ctx = extract(&req).unwrap();
        assert_eq!(ctx.tenant_id, tenant);
        assert_eq!(ctx.user_id, "system");
    }

    #[actix_web::test]
    async fn rejects_missing_or_wrong_token() {
        let req = TestRequest::default()
            .app_data(config())
            .insert_header(("x-tenant-id", Uuid::new_v4().to_string()))
            .insert_header(("x-user-id", "u-1"))
            .to_http_request();
        assert!(matches!(extract(&req), Err(AppError::Unauthorized(_))));

        let req = TestRequest::default()
            .app_data(config())
            .insert_header(("x-internal-token", "wrong"))
            .insert_header(("x-tenant-id", Uuid::new_v4().to_string()))
            .insert_header(("x-user-id", "u-1"))
            .to_http_request();
        assert!(matches!(extract(&req), Err(AppError::Unauthorized(_))));
    }

    #[actix_web::test]
    async fn rejects_missing_identity_and_bad_tenant() {
        let req = TestRequest::default()
            .app_data(config())
            .insert_header(("x-internal-token", "dev-shared-secret"))
            .to_http_request();
        assert!(matches!(extract(&req), Err(AppError::Unauthorized(_))));

        let req = TestRequest::default()
            .app_data(config())
            .insert_header(("x-internal-token", "dev-shared-secret"))
            .insert_header(("x-tenant-id", "not-a-uuid"))
            .insert_header(("x-user-id", "u-1"))
            .to_http_request();
        assert!(matches!(extract(&req), Err(AppError::Unauthorized(_))));
    }
}
