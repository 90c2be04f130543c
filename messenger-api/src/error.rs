use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use messenger_core::MessengerError;
use tracing;

/// REST error body: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug)]
pub struct ApiError(pub MessengerError);

impl From<MessengerError> for ApiError {
    fn from(e: MessengerError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            MessengerError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            MessengerError::NotPermitted(_) => (StatusCode::FORBIDDEN, "not_permitted"),
            MessengerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            MessengerError::CacheUnavailable(_) | MessengerError::BrokerUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        // Internal details stay in the log.
        let message = if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = serde_json::json!({
            "error": {
                "code": code,
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        let not_found = ApiError(MessengerError::NotFound("push device".to_string()));
        assert_eq!(not_found.status_and_code(), (StatusCode::NOT_FOUND, "not_found"));

        let storage = ApiError(MessengerError::Storage("boom".to_string()));
        assert_eq!(storage.status_and_code().0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
