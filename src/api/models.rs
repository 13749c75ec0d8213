use crate::api::{ModelInfo, ModelsResponse};
use crate::core::llm::{format_api_error, LlmError};
use crate::utils::url::construct_api_url;

/// Lists the models an OpenAI-compatible endpoint advertises.
pub async fn fetch_models(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
) -> Result<ModelsResponse, LlmError> {
    let models_url = construct_api_url(base_url, "models");
    let response = client
        .get(models_url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {api_key}"))
        .send()
        .await
        .map_err(|err| LlmError::Http(err.to_string()))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(LlmError::Api {
            status,
            message: format_api_error(&error_text),
        });
    }

    response
        .json::<ModelsResponse>()
        .await
        .map_err(|err| LlmError::InvalidResponse(err.to_string()))
}

pub fn sort_models(models: &mut [ModelInfo]) {
    // Newest first; undated models go last, by id.
    models.sort_by(|a, b| match (a.created, b.created) {
        (Some(a_created), Some(b_created)) => b_created.cmp(&a_created),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    });
}
