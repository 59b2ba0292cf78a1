use crate::error::Result;
use crate::llm::ApiError;
use reqwest::{Response, StatusCode};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Passes successful responses through and turns everything else into an [`ApiError`].
pub async fn check_response_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let response_text = response
        .text()
        .await
        .map_err(|e| ApiError::NetworkError(e.to_string()))?;
    Err(error_for_status(status, &response_text).into())
}

fn error_for_status(status: StatusCode, response_text: &str) -> ApiError {
    let Ok(error_response) = serde_json::from_str::<ErrorResponse>(response_text) else {
        return ApiError::Unknown(format!("Status {}: {}", status, response_text));
    };
    let message = error_response.error.message;
    match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimit(message),
        StatusCode::UNAUTHORIZED => ApiError::Authentication(message),
        StatusCode::BAD_REQUEST => ApiError::InvalidRequest(message),
        status if status.is_server_error() => ApiError::ServiceError(message),
        _ => ApiError::Unknown(message),
    }
}

/// Rough token count: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}
