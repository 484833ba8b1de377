use poem::Route;
use poem_openapi::auth::ApiKey;
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApiService, SecurityScheme, Tags};

use crate::service::Services;
use crate::VERSION;

pub mod callback;
pub mod healthcheck;
pub mod transfer;

#[derive(Tags)]
enum ApiTags {
    Transfer,
    Callback,
    HealthCheck,
}

/// Institution API key, paired with [`ApiSecretAuth`]; the service layer
/// resolves the pair to an institution.
#[derive(SecurityScheme)]
#[oai(ty = "api_key", key_name = "x-api-key", key_in = "header")]
pub struct ApiKeyAuth(pub ApiKey);

#[derive(SecurityScheme)]
#[oai(ty = "api_key", key_name = "x-api-secret", key_in = "header")]
pub struct ApiSecretAuth(pub ApiKey);

/// The standard response envelope without a data section, used for errors
/// and bare acknowledgements.
#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct Envelope {
    pub response_code: String,
    pub response_message: String,
    pub status: String,
}

impl Envelope {
    pub fn failure(response_code: &str, response_message: String) -> Json<Envelope> {
        Json(Envelope {
            response_code: response_code.to_string(),
            response_message,
            status: "FAILED".to_string(),
        })
    }
}

pub fn combined_routes(services: &Services) -> Route {
    let api_service = make_open_api_service(services);

    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();

    Route::new()
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/specs", spec)
}

type ApiServices = (
    transfer::TransferApi,
    callback::CallbackApi,
    healthcheck::HealthcheckApi,
);

pub fn make_open_api_service(services: &Services) -> OpenApiService<ApiServices, ()> {
    OpenApiService::new(
        (
            transfer::TransferApi::new(
                services.auth_service.clone(),
                services.transfer_service.clone(),
            ),
            callback::CallbackApi::new(services.gip_callback_repo.clone()),
            healthcheck::HealthcheckApi,
        ),
        "GIP Switch API",
        VERSION,
    )
}
