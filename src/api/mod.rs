use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{agent::Agent, agent::spec::CreateRequest, error::Error};

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub ip_address: String,
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// Request-level failures become structured responses; the daemon keeps
// serving the rest of the fleet.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        if status.is_server_error() {
            error!("request failed: {self:#?}");
        }
        (
            status,
            Json(ErrorBody {
                error: self.kind(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

async fn create(
    axum::extract::State(agent): axum::extract::State<Arc<Agent>>,
    Json(request): Json<CreateRequest>,
) -> Result<Json<CreateResponse>, Error> {
    let (ip, id) = agent.create_vm(request).await?;
    Ok(Json(CreateResponse {
        ip_address: ip.to_string(),
        id,
    }))
}

async fn delete(
    axum::extract::State(agent): axum::extract::State<Arc<Agent>>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    agent.delete_vm(&request.id).await?;
    Ok(Json(serde_json::json!({})))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

pub fn router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/create", post(create))
        .route("/delete", post(delete))
        .route("/health", get(health))
        .with_state(agent)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn test_health_always_succeeds() {
        let router = Router::new().route("/health", get(health));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_error_statuses_follow_the_taxonomy() {
        assert_eq!(
            status_for(&Error::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::PoolExhausted),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::MachineStartFailed("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_error_body_is_structured() {
        let response = Error::NotFound("abc".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["message"], "no instance with id abc");
    }

    #[test]
    fn test_create_request_accepts_optional_cloud_init() {
        let request: CreateRequest = serde_json::from_str(
            r#"{"root_image_path":"/images/base.img","kernel_path":"/boot/vmlinux"}"#,
        )
        .unwrap();
        assert!(request.cloud_init_path.is_none());

        let request: CreateRequest = serde_json::from_str(
            r#"{
                "root_image_path": "/images/base.img",
                "kernel_path": "/boot/vmlinux",
                "cloud_init_path": "/configs/user-data.yml"
            }"#,
        )
        .unwrap();
        assert!(request.cloud_init_path.is_some());
    }
}
