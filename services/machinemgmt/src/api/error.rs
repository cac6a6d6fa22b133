use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use infra_bootimage::ImageError;
use serde::Serialize;

/// RFC 7807 problem details body.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://machinemgmt.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message).retryable()
    }

    pub fn retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.problem.instance = Some(instance.into());
        self
    }
}

impl From<ImageError> for ApiError {
    fn from(err: ImageError) -> Self {
        let instance = format!("/{}", err.key());
        let api_error = match &err {
            ImageError::NotFound { .. } => {
                Self::not_found("image_not_found", "Bootstrap image not found")
            }
            ImageError::ObjectRead { .. } => {
                Self::bad_gateway("object_read_failed", err.to_string()).retryable()
            }
            ImageError::ChecksumMismatch { .. } => {
                Self::bad_gateway("checksum_mismatch", err.to_string())
            }
            ImageError::Cancelled { .. } => {
                Self::unavailable("request_cancelled", "Server is shutting down")
            }
        };
        api_error.with_instance(instance)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infra_bootimage::{ReadFailure, StoreError};

    #[test]
    fn test_image_error_mapping() {
        let not_found: ApiError = ImageError::NotFound {
            key: "bootstrap/a.img".into(),
        }
        .into();
        assert_eq!(not_found.status, StatusCode::NOT_FOUND);
        assert_eq!(not_found.problem.code, "image_not_found");
        assert_eq!(
            not_found.problem.instance.as_deref(),
            Some("/bootstrap/a.img")
        );

        let read: ApiError = ImageError::ObjectRead {
            key: "bootstrap/a.img".into(),
            source: ReadFailure::Metadata {
                attempts: 5,
                source: StoreError::Unavailable("503".into()),
            },
        }
        .into();
        assert_eq!(read.status, StatusCode::BAD_GATEWAY);
        assert!(read.problem.retryable);

        let mismatch: ApiError = ImageError::ChecksumMismatch {
            key: "bootstrap/a.img".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert_eq!(mismatch.status, StatusCode::BAD_GATEWAY);
        assert_eq!(mismatch.problem.code, "checksum_mismatch");
        assert!(!mismatch.problem.retryable);

        let cancelled: ApiError = ImageError::Cancelled {
            key: "bootstrap/a.img".into(),
        }
        .into();
        assert_eq!(cancelled.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_problem_content_type() {
        let response = ApiError::bad_request("invalid_image_id", "bad id").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
