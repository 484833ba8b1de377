use async_trait::async_trait;
use gip_switch_common::model::{ActionCode, FunctionCode, SessionId};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::config::GipGatewayConfig;
use crate::gateway::{
    GatewayAck, GatewayError, GipGateway, LegDispatch, NameEnquiryDispatch, TsqStatus,
};

/// Gateway wire request. All functions share one envelope; absent fields are
/// omitted from the JSON body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GipRequestBody {
    function_code: String,
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_bank_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_account_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_account_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_bank_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_account_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_account_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    narration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_url: Option<String>,
}

impl GipRequestBody {
    fn new(function_code: FunctionCode, session_id: &SessionId) -> Self {
        Self {
            function_code: function_code.code().to_string(),
            session_id: session_id.0.clone(),
            source_bank_code: None,
            source_account_number: None,
            source_account_name: None,
            destination_bank_code: None,
            destination_account_number: None,
            destination_account_name: None,
            amount: None,
            narration: None,
            callback_url: None,
        }
    }

    fn for_leg(
        function_code: FunctionCode,
        dispatch: &LegDispatch,
        callback_url: &Url,
    ) -> Self {
        Self {
            source_bank_code: Some(dispatch.source_bank_code.clone()),
            source_account_number: Some(dispatch.source_account_number.clone()),
            source_account_name: Some(dispatch.source_account_name.clone()),
            destination_bank_code: Some(dispatch.destination_bank_code.clone()),
            destination_account_number: Some(dispatch.destination_account_number.clone()),
            destination_account_name: Some(dispatch.destination_account_name.clone()),
            amount: Some(dispatch.amount.clone()),
            narration: Some(dispatch.narration.clone()),
            callback_url: Some(callback_url.to_string()),
            ..Self::new(function_code, &dispatch.session_id)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GipResponseBody {
    #[serde(default)]
    response_code: Option<String>,
    #[serde(default)]
    action_code: Option<String>,
    #[serde(default)]
    account_name: Option<String>,
    #[serde(default)]
    tracking_number: Option<String>,
}

pub struct HttpGipGateway {
    client: reqwest::Client,
    config: GipGatewayConfig,
}

impl HttpGipGateway {
    pub fn new(config: GipGatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Initialization(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn post(
        &self,
        url: &Url,
        body: &GipRequestBody,
    ) -> Result<(GipResponseBody, serde_json::Value), GatewayError> {
        debug!(
            function_code = %body.function_code,
            session_id = %body.session_id,
            url = %url,
            "Dispatching gateway request"
        );
        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::UnexpectedStatus(status.as_u16()));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        let parsed: GipResponseBody = serde_json::from_value(raw.clone())
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        Ok((parsed, raw))
    }

    fn ack(parsed: GipResponseBody, raw: serde_json::Value) -> GatewayAck {
        GatewayAck {
            action_code: parsed.action_code.map(ActionCode),
            account_name: parsed.account_name,
            tracking_number: parsed.tracking_number,
            raw,
        }
    }
}

#[async_trait]
impl GipGateway for HttpGipGateway {
    async fn name_enquiry(
        &self,
        dispatch: &NameEnquiryDispatch,
    ) -> Result<GatewayAck, GatewayError> {
        let body = GipRequestBody {
            destination_bank_code: Some(dispatch.destination_bank_code.clone()),
            destination_account_number: Some(dispatch.account_number.clone()),
            ..GipRequestBody::new(FunctionCode::NameEnquiry, &dispatch.session_id)
        };
        let (parsed, raw) = self.post(&self.config.nec_url, &body).await?;
        Ok(Self::ack(parsed, raw))
    }

    async fn funds_transfer_debit(
        &self,
        dispatch: &LegDispatch,
    ) -> Result<GatewayAck, GatewayError> {
        let body = GipRequestBody::for_leg(
            FunctionCode::FundsTransferDebit,
            dispatch,
            &self.config.callback_url,
        );
        let (parsed, raw) = self.post(&self.config.ftd_url, &body).await?;
        Ok(Self::ack(parsed, raw))
    }

    async fn funds_transfer_credit(
        &self,
        dispatch: &LegDispatch,
    ) -> Result<GatewayAck, GatewayError> {
        let body = GipRequestBody::for_leg(
            FunctionCode::FundsTransferCredit,
            dispatch,
            &self.config.callback_url,
        );
        let (parsed, raw) = self.post(&self.config.ftc_url, &body).await?;
        Ok(Self::ack(parsed, raw))
    }

    async fn reversal(&self, dispatch: &LegDispatch) -> Result<GatewayAck, GatewayError> {
        let body = GipRequestBody::for_leg(
            FunctionCode::Reversal,
            dispatch,
            &self.config.callback_url,
        );
        let (parsed, raw) = self.post(self.config.reversal_url(), &body).await?;
        Ok(Self::ack(parsed, raw))
    }

    async fn status_query(&self, session_id: &SessionId) -> Result<TsqStatus, GatewayError> {
        let body = GipRequestBody::new(FunctionCode::StatusQuery, session_id);
        let (parsed, raw) = self.post(&self.config.tsq_url, &body).await?;
        Ok(TsqStatus {
            response_code: parsed.response_code.unwrap_or_default(),
            action_code: parsed.action_code.unwrap_or_default(),
            raw,
        })
    }
}
