//! Model discovery against the backend's OpenAI-compatible `/models` endpoint.

use std::time::Duration;

use crate::error::{ProxyError, Result};
use crate::translate::openai_types::ModelsResponse;
use crate::translate::response::upstream_status_error;

/// Fetch the list of models the backend serves.
///
/// # Errors
/// Returns `ProxyError::Upstream` if the request fails or the response cannot be
/// parsed, and `ProxyError::Timeout` if the backend does not answer in time.
pub async fn fetch_backend_models(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<ModelsResponse> {
    let mut request = client.get(url);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let fetch = async {
        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::upstream(format!("Failed to fetch models: {e}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ProxyError::upstream(format!("Failed to read models response: {e}")))?;
        Ok::<_, ProxyError>((status, body))
    };

    let (status, body) = tokio::time::timeout(timeout, fetch)
        .await
        .map_err(|_| ProxyError::timeout(timeout))??;

    if status >= 400 {
        return Err(upstream_status_error(status, &body));
    }

    serde_json::from_str(&body)
        .map_err(|e| ProxyError::upstream(format!("Failed to parse models response: {e}")))
}

/// Model ids in a listing, in backend order.
#[must_use]
pub fn model_ids(models: &ModelsResponse) -> Vec<&str> {
    models.data.iter().map(|m| m.id.as_str()).collect()
}
