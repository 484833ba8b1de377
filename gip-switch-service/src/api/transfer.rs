use std::sync::Arc;

use gip_switch_common::model::ReferenceNumber;
use gip_switch_common::SafeDisplay;
use poem_openapi::param::Path;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi};
use uuid::Uuid;

use crate::api::{ApiKeyAuth, ApiSecretAuth, ApiTags, Envelope};
use crate::model::{parse_amount, NewTransfer, Transaction};
use crate::repo::transaction::GipEventRecord;
use crate::service::auth::{AuthService, InstitutionContext};
use crate::service::transfer::{NameEnquiry, TransferService};
use crate::service::TransferError;

#[derive(ApiResponse, Debug)]
pub enum TransferApiError {
    /// Request failed validation
    #[oai(status = 400)]
    BadRequest(Json<Envelope>),
    /// Unknown or mismatched API credentials
    #[oai(status = 401)]
    Unauthorized(Json<Envelope>),
    /// Transaction not found
    #[oai(status = 404)]
    NotFound(Json<Envelope>),
    /// Reference number already used by this institution
    #[oai(status = 409)]
    DuplicateReference(Json<Envelope>),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<Envelope>),
    /// The clearing gateway did not accept the dispatch
    #[oai(status = 502)]
    GatewayUnreachable(Json<Envelope>),
}

impl From<TransferError> for TransferApiError {
    fn from(value: TransferError) -> Self {
        let message = value.to_safe_string();
        match value {
            TransferError::Validation(_) => {
                TransferApiError::BadRequest(Envelope::failure("VALIDATION_ERROR", message))
            }
            TransferError::Unauthorized(_) => {
                TransferApiError::Unauthorized(Envelope::failure("UNAUTHORIZED", message))
            }
            TransferError::NotFound(_) => {
                TransferApiError::NotFound(Envelope::failure("NOT_FOUND", message))
            }
            TransferError::DuplicateReference(_) => TransferApiError::DuplicateReference(
                Envelope::failure("DUPLICATE_REFERENCE", message),
            ),
            TransferError::GatewayUnreachable(_) => TransferApiError::GatewayUnreachable(
                Envelope::failure("GATEWAY_UNREACHABLE", message),
            ),
            TransferError::InternalRepoError(_) | TransferError::Internal(_) => {
                TransferApiError::InternalError(Envelope::failure("INTERNAL_ERROR", message))
            }
        }
    }
}

type Result<T> = std::result::Result<T, TransferApiError>;

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct NameEnquiryRequest {
    pub destination_bank_code: String,
    pub account_number: String,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct NameEnquiryData {
    pub session_id: String,
    pub account_name: Option<String>,
    pub action_code: Option<String>,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct NameEnquiryResponse {
    pub response_code: String,
    pub response_message: String,
    pub status: String,
    pub data: Option<NameEnquiryData>,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct FundsTransferRequest {
    pub reference_number: String,
    pub source_bank_code: String,
    pub source_account_number: String,
    pub source_account_name: String,
    pub destination_bank_code: String,
    pub destination_account_number: String,
    pub destination_account_name: String,
    /// Positive decimal with at most two decimal places.
    pub amount: String,
    pub narration: String,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct FundsTransferData {
    pub transaction_id: Uuid,
    pub session_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct FundsTransferResponse {
    pub response_code: String,
    pub response_message: String,
    pub status: String,
    pub data: Option<FundsTransferData>,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct StatusQueryRequest {
    pub reference_number: String,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct TransactionData {
    pub transaction_id: Uuid,
    pub reference_number: String,
    pub session_id: String,
    pub status: String,
    pub amount: String,
    pub ftd_action_code: Option<String>,
    pub ftc_action_code: Option<String>,
    pub reversal_action_code: Option<String>,
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct TransactionStatusResponse {
    pub response_code: String,
    pub response_message: String,
    pub status: String,
    pub data: Option<TransactionData>,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct GipEventData {
    pub event_seq: i64,
    pub kind: String,
    pub session_id: String,
    pub tracking_number: Option<String>,
    pub action_code: Option<String>,
    pub outcome: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct TransactionDetailsData {
    pub transaction: TransactionData,
    pub events: Vec<GipEventData>,
}

#[derive(Debug, Clone, Object)]
#[oai(rename_all = "camelCase")]
pub struct TransactionDetailsResponse {
    pub response_code: String,
    pub response_message: String,
    pub status: String,
    pub data: Option<TransactionDetailsData>,
}

impl From<&Transaction> for TransactionData {
    fn from(transaction: &Transaction) -> Self {
        Self {
            transaction_id: transaction.id,
            reference_number: transaction.reference_number.0.clone(),
            session_id: transaction.session_id.0.clone(),
            status: transaction.status.to_string(),
            amount: crate::model::format_amount(&transaction.amount),
            ftd_action_code: transaction.ftd_action_code.as_ref().map(|c| c.0.clone()),
            ftc_action_code: transaction.ftc_action_code.as_ref().map(|c| c.0.clone()),
            reversal_action_code: transaction
                .reversal_action_code
                .as_ref()
                .map(|c| c.0.clone()),
            status_message: transaction.status_message.clone(),
        }
    }
}

impl From<&GipEventRecord> for GipEventData {
    fn from(event: &GipEventRecord) -> Self {
        Self {
            event_seq: event.event_seq,
            kind: event.kind.clone(),
            session_id: event.session_id.clone(),
            tracking_number: event.tracking_number.clone(),
            action_code: event.action_code.clone(),
            outcome: event.outcome.clone(),
            created_at: event.created_at,
        }
    }
}

pub struct TransferApi {
    auth_service: Arc<AuthService>,
    transfer_service: Arc<TransferService>,
}

#[OpenApi(prefix_path = "/v1", tag = ApiTags::Transfer)]
impl TransferApi {
    pub fn new(auth_service: Arc<AuthService>, transfer_service: Arc<TransferService>) -> Self {
        Self {
            auth_service,
            transfer_service,
        }
    }

    /// Resolve the account holder name at a destination bank
    #[oai(path = "/nec", method = "post", operation_id = "name_enquiry")]
    async fn name_enquiry(
        &self,
        request: Json<NameEnquiryRequest>,
        key: ApiKeyAuth,
        secret: ApiSecretAuth,
    ) -> Result<Json<NameEnquiryResponse>> {
        let context = self.authenticate(&key, &secret)?;

        let enquiry = NameEnquiry {
            destination_bank_code: request.0.destination_bank_code,
            account_number: request.0.account_number,
        };
        let result = self
            .transfer_service
            .name_enquiry(&context, &enquiry)
            .await?;

        let action_code = result
            .action_code
            .as_ref()
            .map(|code| code.0.clone())
            .unwrap_or_default();
        let resolved = result.account_name.is_some();
        Ok(Json(NameEnquiryResponse {
            response_code: action_code.clone(),
            response_message: if resolved {
                "Account name resolved".to_string()
            } else {
                "Account name not resolved".to_string()
            },
            status: if resolved { "SUCCESS" } else { "FAILED" }.to_string(),
            data: Some(NameEnquiryData {
                session_id: result.session_id.0,
                account_name: result.account_name,
                action_code: result.action_code.map(|code| code.0),
            }),
        }))
    }

    /// Submit a funds transfer; the outcome is delivered asynchronously
    #[oai(path = "/ft", method = "post", operation_id = "funds_transfer")]
    async fn funds_transfer(
        &self,
        request: Json<FundsTransferRequest>,
        key: ApiKeyAuth,
        secret: ApiSecretAuth,
    ) -> Result<Json<FundsTransferResponse>> {
        let context = self.authenticate(&key, &secret)?;
        let request = request.0;

        let amount = parse_amount(&request.amount)
            .map_err(|message| TransferApiError::from(TransferError::Validation(message)))?;
        if request.reference_number.trim().is_empty() {
            return Err(TransferError::Validation(
                "Reference number must not be empty".to_string(),
            )
            .into());
        }

        let transfer = NewTransfer {
            reference_number: ReferenceNumber(request.reference_number),
            source_bank_code: request.source_bank_code,
            source_account_number: request.source_account_number,
            source_account_name: request.source_account_name,
            destination_bank_code: request.destination_bank_code,
            destination_account_number: request.destination_account_number,
            destination_account_name: request.destination_account_name,
            amount,
            narration: request.narration,
            client_callback_url: request.callback_url,
        };

        let accepted = self
            .transfer_service
            .funds_transfer(&context, transfer)
            .await?;

        Ok(Json(FundsTransferResponse {
            response_code: "000".to_string(),
            response_message: "Transfer accepted".to_string(),
            status: "PENDING".to_string(),
            data: Some(FundsTransferData {
                transaction_id: accepted.transaction_id,
                session_id: accepted.session_id.0,
                status: accepted.status.to_string(),
            }),
        }))
    }

    /// Query the current status of a transfer by reference number
    #[oai(path = "/tsq", method = "post", operation_id = "status_query")]
    async fn status_query(
        &self,
        request: Json<StatusQueryRequest>,
        key: ApiKeyAuth,
        secret: ApiSecretAuth,
    ) -> Result<Json<TransactionStatusResponse>> {
        let context = self.authenticate(&key, &secret)?;

        let transaction = self
            .transfer_service
            .status_query(&context, &ReferenceNumber(request.0.reference_number))
            .await?;

        Ok(Json(TransactionStatusResponse {
            response_code: "000".to_string(),
            response_message: "Status query successful".to_string(),
            status: "SUCCESS".to_string(),
            data: Some(TransactionData::from(&transaction)),
        }))
    }

    /// Fetch a transaction with its gateway event history
    #[oai(
        path = "/transactions/:id",
        method = "get",
        operation_id = "get_transaction"
    )]
    async fn get_transaction(
        &self,
        id: Path<Uuid>,
        key: ApiKeyAuth,
        secret: ApiSecretAuth,
    ) -> Result<Json<TransactionDetailsResponse>> {
        let context = self.authenticate(&key, &secret)?;

        let details = self
            .transfer_service
            .get_transaction(&context, &id.0)
            .await?;

        Ok(Json(TransactionDetailsResponse {
            response_code: "000".to_string(),
            response_message: "Transaction found".to_string(),
            status: "SUCCESS".to_string(),
            data: Some(TransactionDetailsData {
                transaction: TransactionData::from(&details.transaction),
                events: details.events.iter().map(GipEventData::from).collect(),
            }),
        }))
    }

    fn authenticate(
        &self,
        key: &ApiKeyAuth,
        secret: &ApiSecretAuth,
    ) -> Result<InstitutionContext> {
        self.auth_service
            .authenticate(&key.0.key, &secret.0.key)
            .map_err(|error| TransferApiError::from(TransferError::from(error)))
    }
}
