use std::sync::Arc;

use poem_openapi::payload::Json;
use poem_openapi::types::ToJSON;
use poem_openapi::{ApiResponse, Object, OpenApi};
use tracing::info;

use crate::api::{ApiTags, Envelope};
use crate::repo::gip_callback::{GipCallbackRepo, NewGipCallback};

#[derive(ApiResponse, Debug)]
pub enum CallbackApiError {
    /// Malformed callback body
    #[oai(status = 400)]
    BadRequest(Json<Envelope>),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<Envelope>),
}

/// Asynchronous gateway callback. The body is persisted verbatim; all
/// interpretation happens in the callback processor.
#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct GipCallbackRequest {
    pub function_code: String,
    pub session_id: String,
    pub action_code: String,
    pub tracking_number: Option<String>,
    pub reference_number: Option<String>,
    pub amount: Option<String>,
    pub narration: Option<String>,
}

pub struct CallbackApi {
    gip_callback_repo: Arc<dyn GipCallbackRepo + Sync + Send>,
}

#[OpenApi(prefix_path = "/v1", tag = ApiTags::Callback)]
impl CallbackApi {
    pub fn new(gip_callback_repo: Arc<dyn GipCallbackRepo + Sync + Send>) -> Self {
        Self { gip_callback_repo }
    }

    /// Receive an asynchronous callback from the clearing gateway
    #[oai(path = "/callback", method = "post", operation_id = "gip_callback")]
    async fn gip_callback(
        &self,
        request: Json<GipCallbackRequest>,
    ) -> Result<Json<Envelope>, CallbackApiError> {
        let request = request.0;

        if request.session_id.trim().is_empty() {
            return Err(CallbackApiError::BadRequest(Envelope::failure(
                "VALIDATION_ERROR",
                "sessionId must not be empty".to_string(),
            )));
        }

        let payload = request.to_json().map(|value| value.to_string());
        let callback = NewGipCallback {
            session_id: request.session_id.clone(),
            function_code: request.function_code.clone(),
            action_code: request.action_code.clone(),
            tracking_number: request.tracking_number,
            reference_number: request.reference_number,
            amount: request.amount,
            payload,
        };

        let callback_id = self
            .gip_callback_repo
            .enqueue(&callback)
            .await
            .map_err(|error| {
                CallbackApiError::InternalError(Envelope::failure(
                    "INTERNAL_ERROR",
                    format!("Failed to store callback: {error}"),
                ))
            })?;

        info!(
            callback_id = %callback_id,
            session_id = %request.session_id,
            function_code = %request.function_code,
            action_code = %request.action_code,
            "Gateway callback stored"
        );

        Ok(Json(Envelope {
            response_code: "000".to_string(),
            response_message: "Callback received".to_string(),
            status: "SUCCESS".to_string(),
        }))
    }
}
