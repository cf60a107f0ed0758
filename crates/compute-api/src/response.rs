//! Response envelope, error mapping and NDJSON bodies.

use axum::Json;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_core::Stream;
use serde::Serialize;

use compute_service::{ServiceError, ServiceResult};
use compute_state::ResourceRef;
use compute_watch::{Delta, NdjsonStream, WatchResult, ndjson};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiError>,
}

#[derive(Serialize)]
struct ApiError {
    code: &'static str,
    message: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        ServiceError::FailedPrecondition(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::AlreadyExists(_) => StatusCode::CONFLICT,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(err: &ServiceError) -> Response {
    let status = status_for(err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "request failed");
    }
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ApiError {
                code: err.code(),
                message: err.to_string(),
            }),
        }),
    )
        .into_response()
}

/// 200 with the value, or the mapped error.
pub(crate) fn respond<T: Serialize>(result: ServiceResult<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => error_response(&e),
    }
}

pub(crate) fn created<T: Serialize>(result: ServiceResult<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::CREATED, ApiResponse::ok(data)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Stream deltas as newline-delimited JSON.
pub(crate) fn ndjson<S, R>(result: ServiceResult<S>) -> Response
where
    S: Stream<Item = WatchResult<Delta<R>>> + Unpin + Send + 'static,
    R: Serialize + Send + 'static,
{
    match result {
        Ok(stream) => (
            [(header::CONTENT_TYPE, ndjson::CONTENT_TYPE)],
            Body::from_stream(NdjsonStream::new(stream)),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// Parse the `{by}/{value}` path segments used to address a resource.
pub(crate) fn resource_ref(by: &str, value: String) -> ServiceResult<ResourceRef> {
    match by {
        "id" => Ok(ResourceRef::Id(value)),
        "name" => Ok(ResourceRef::Name(value)),
        other => Err(ServiceError::invalid(format!(
            "resources are addressed by id or name, not {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (ServiceError::invalid("x"), StatusCode::BAD_REQUEST),
            (ServiceError::precondition("x"), StatusCode::BAD_REQUEST),
            (ServiceError::not_found("x"), StatusCode::NOT_FOUND),
            (ServiceError::AlreadyExists("x".into()), StatusCode::CONFLICT),
            (ServiceError::Conflict("x".into()), StatusCode::CONFLICT),
            (ServiceError::PermissionDenied("x".into()), StatusCode::FORBIDDEN),
            (ServiceError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err), status, "{err}");
        }
    }

    #[test]
    fn resource_ref_accepts_id_and_name() {
        assert_eq!(resource_ref("id", "abc".into()).unwrap(), ResourceRef::Id("abc".into()));
        assert_eq!(resource_ref("name", "vm".into()).unwrap(), ResourceRef::Name("vm".into()));
        assert!(resource_ref("label", "vm".into()).is_err());
    }
}
