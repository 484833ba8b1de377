use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gip_switch_common::config::{DbSqliteConfig, RetryConfig};
use gip_switch_common::model::{ActionCode, CredentialId, InstitutionId, ReferenceNumber, SessionId};
use gip_switch_service::config::{
    LegTimeoutsConfig, ReversalWorkerConfig, TsqWorkerConfig, WebhookWorkerConfig,
};
use gip_switch_service::db;
use gip_switch_service::gateway::{
    GatewayAck, GatewayError, GipGateway, LegDispatch, NameEnquiryDispatch, TsqStatus,
};
use gip_switch_service::model::{parse_amount, DeliveryStatus, NewTransfer, TransactionStatus};
use gip_switch_service::repo::audit::{AuditRepo, DbAuditRepo};
use gip_switch_service::repo::client_callback::{
    ClientCallbackRepo, DbClientCallbackRepo, NewClientCallback,
};
use gip_switch_service::repo::gip_callback::{DbGipCallbackRepo, GipCallbackRepo, NewGipCallback};
use gip_switch_service::repo::transaction::{DbTransactionRepo, TransactionRepo};
use gip_switch_service::service::auth::InstitutionContext;
use gip_switch_service::service::lifecycle::LifecycleService;
use gip_switch_service::service::transfer::{NameEnquiry, TransferService};
use gip_switch_service::service::TransferError;
use gip_switch_service::webhook::{WebhookDelivery, WebhookSender};
use gip_switch_service::workers::ClientCallbackDeliverer;
use uuid::Uuid;

struct SqliteDb {
    db_path: String,
}

impl Default for SqliteDb {
    fn default() -> Self {
        Self {
            db_path: format!("/tmp/gip-switch-test-{}.db", Uuid::new_v4()),
        }
    }
}

impl Drop for SqliteDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
    }
}

#[derive(Default)]
struct ScriptedGateway {
    debit_dispatches: AtomicUsize,
    credit_dispatches: AtomicUsize,
    reversal_dispatches: AtomicUsize,
    fail_dispatches: AtomicBool,
    tsq_responses: Mutex<VecDeque<(String, String)>>,
}

impl ScriptedGateway {
    fn ack() -> GatewayAck {
        GatewayAck {
            action_code: None,
            account_name: None,
            tracking_number: Some("TRK0001".to_string()),
            raw: serde_json::json!({"accepted": true}),
        }
    }

    fn push_tsq_response(&self, response_code: &str, action_code: &str) {
        self.tsq_responses
            .lock()
            .unwrap()
            .push_back((response_code.to_string(), action_code.to_string()));
    }
}

#[async_trait]
impl GipGateway for ScriptedGateway {
    async fn name_enquiry(
        &self,
        _dispatch: &NameEnquiryDispatch,
    ) -> Result<GatewayAck, GatewayError> {
        Ok(GatewayAck {
            action_code: Some(ActionCode("000".to_string())),
            account_name: Some("JANE K DOE".to_string()),
            tracking_number: None,
            raw: serde_json::json!({"accountName": "JANE K DOE", "actionCode": "000"}),
        })
    }

    async fn funds_transfer_debit(
        &self,
        _dispatch: &LegDispatch,
    ) -> Result<GatewayAck, GatewayError> {
        if self.fail_dispatches.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }
        self.debit_dispatches.fetch_add(1, Ordering::SeqCst);
        Ok(Self::ack())
    }

    async fn funds_transfer_credit(
        &self,
        _dispatch: &LegDispatch,
    ) -> Result<GatewayAck, GatewayError> {
        if self.fail_dispatches.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("connection refused".to_string()));
        }
        self.credit_dispatches.fetch_add(1, Ordering::SeqCst);
        Ok(Self::ack())
    }

    async fn reversal(&self, _dispatch: &LegDispatch) -> Result<GatewayAck, GatewayError> {
        self.reversal_dispatches.fetch_add(1, Ordering::SeqCst);
        Ok(Self::ack())
    }

    async fn status_query(&self, _session_id: &SessionId) -> Result<TsqStatus, GatewayError> {
        let (response_code, action_code) = self
            .tsq_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(("000".to_string(), "990".to_string()));
        Ok(TsqStatus {
            response_code,
            action_code,
            raw: serde_json::json!({"resolved": "scripted"}),
        })
    }
}

struct ScriptedWebhookSender {
    responses: Mutex<VecDeque<u16>>,
    deliveries: AtomicUsize,
}

impl ScriptedWebhookSender {
    fn new(responses: Vec<u16>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            deliveries: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl WebhookSender for ScriptedWebhookSender {
    async fn deliver(&self, _url: &str, _payload: &str) -> Result<WebhookDelivery, String> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        let http_status = self.responses.lock().unwrap().pop_front().unwrap_or(200);
        Ok(WebhookDelivery {
            http_status,
            body_snippet: String::new(),
        })
    }
}

struct TestSwitch {
    _db: SqliteDb,
    transaction_repo: Arc<dyn TransactionRepo + Sync + Send>,
    gip_callback_repo: Arc<dyn GipCallbackRepo + Sync + Send>,
    client_callback_repo: Arc<dyn ClientCallbackRepo + Sync + Send>,
    audit_repo: Arc<dyn AuditRepo + Sync + Send>,
    gateway: Arc<ScriptedGateway>,
    transfer_service: TransferService,
    lifecycle: LifecycleService,
    context: InstitutionContext,
}

fn fast_tsq_config() -> TsqWorkerConfig {
    TsqWorkerConfig {
        poll_interval: Duration::from_millis(10),
        base_interval: Duration::ZERO,
        max_interval: Duration::from_secs(60),
        max_attempts: 3,
        batch_size: 10,
    }
}

fn fast_reversal_config() -> ReversalWorkerConfig {
    ReversalWorkerConfig {
        poll_interval: Duration::from_millis(10),
        max_attempts: 3,
        callback_timeout: Duration::ZERO,
        batch_size: 10,
    }
}

fn webhook_config() -> WebhookWorkerConfig {
    WebhookWorkerConfig {
        poll_interval: Duration::from_millis(10),
        max_attempts: 5,
        initial_delay: Duration::from_secs(5),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_secs(3600),
        request_timeout: Duration::from_secs(1),
        batch_size: 10,
    }
}

impl TestSwitch {
    async fn new(leg_timeouts: LegTimeoutsConfig) -> Self {
        Self::with_configs(leg_timeouts, fast_tsq_config(), fast_reversal_config()).await
    }

    async fn with_configs(
        leg_timeouts: LegTimeoutsConfig,
        tsq: TsqWorkerConfig,
        reversal: ReversalWorkerConfig,
    ) -> Self {
        let sqlite_db = SqliteDb::default();
        let db_config = DbSqliteConfig {
            database: sqlite_db.db_path.clone(),
            max_connections: 10,
        };

        db::sqlite_migrate(&db_config).await.unwrap();
        let db_pool = Arc::new(db::create_sqlite_pool(&db_config).await.unwrap());

        let transaction_repo: Arc<dyn TransactionRepo + Sync + Send> =
            Arc::new(DbTransactionRepo::new(db_pool.clone()));
        let gip_callback_repo: Arc<dyn GipCallbackRepo + Sync + Send> =
            Arc::new(DbGipCallbackRepo::new(db_pool.clone()));
        let client_callback_repo: Arc<dyn ClientCallbackRepo + Sync + Send> =
            Arc::new(DbClientCallbackRepo::new(db_pool.clone()));
        let audit_repo: Arc<dyn AuditRepo + Sync + Send> =
            Arc::new(DbAuditRepo::new(db_pool.clone()));

        let gateway = Arc::new(ScriptedGateway::default());
        let gateway_dyn: Arc<dyn GipGateway + Sync + Send> = gateway.clone();

        let dispatch_retries = RetryConfig {
            max_attempts: 2,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        };

        let transfer_service = TransferService::new(
            transaction_repo.clone(),
            audit_repo.clone(),
            gateway_dyn.clone(),
            dispatch_retries,
            leg_timeouts.clone(),
        );

        let inconclusive = ["909", "912", "990"]
            .iter()
            .map(|code| code.to_string())
            .collect();
        let lifecycle = LifecycleService::new(
            transaction_repo.clone(),
            gip_callback_repo.clone(),
            gateway_dyn,
            inconclusive,
            tsq,
            reversal,
            webhook_config(),
            leg_timeouts,
        );

        let context = InstitutionContext {
            institution_id: InstitutionId(Uuid::new_v4()),
            credential_id: CredentialId(Uuid::new_v4()),
            name: "First Example Bank".to_string(),
            participant_code: "090123".to_string(),
        };

        Self {
            _db: sqlite_db,
            transaction_repo,
            gip_callback_repo,
            client_callback_repo,
            audit_repo,
            gateway,
            transfer_service,
            lifecycle,
            context,
        }
    }

    fn transfer_request(&self, reference: &str) -> NewTransfer {
        NewTransfer {
            reference_number: ReferenceNumber(reference.to_string()),
            source_bank_code: "090123".to_string(),
            source_account_number: "0011223344".to_string(),
            source_account_name: "ALICE SENDER".to_string(),
            destination_bank_code: "090456".to_string(),
            destination_account_number: "9988776655".to_string(),
            destination_account_name: "BOB RECEIVER".to_string(),
            amount: parse_amount("100.00").unwrap(),
            narration: "Invoice 42".to_string(),
            client_callback_url: Some("http://bank.example/hooks/gip".to_string()),
        }
    }

    async fn submit_transfer(&self, reference: &str) -> (Uuid, String) {
        let accepted = self
            .transfer_service
            .funds_transfer(&self.context, self.transfer_request(reference))
            .await
            .unwrap();
        (accepted.transaction_id, accepted.session_id.0)
    }

    async fn push_callback(&self, session_id: &str, function_code: &str, action_code: &str) {
        self.gip_callback_repo
            .enqueue(&NewGipCallback {
                session_id: session_id.to_string(),
                function_code: function_code.to_string(),
                action_code: action_code.to_string(),
                tracking_number: Some("TRK0001".to_string()),
                reference_number: None,
                amount: Some("100.00".to_string()),
                payload: Some(format!(
                    "{{\"sessionId\":\"{session_id}\",\"actionCode\":\"{action_code}\"}}"
                )),
            })
            .await
            .unwrap();
    }

    async fn status_of(&self, id: &Uuid) -> TransactionStatus {
        let record = self.transaction_repo.get(id).await.unwrap().unwrap();
        TransactionStatus::from_str(&record.status).unwrap()
    }

    async fn assert_events_strictly_increasing(&self, id: &Uuid) {
        let events = self.transaction_repo.events(id).await.unwrap();
        assert!(!events.is_empty());
        for (index, event) in events.iter().enumerate() {
            assert_eq!(event.event_seq, index as i64 + 1);
        }
    }
}

fn no_timeouts() -> LegTimeoutsConfig {
    LegTimeoutsConfig {
        name_enquiry: Duration::from_secs(60),
        ftd_callback: Duration::from_secs(1800),
        ftc_callback: Duration::from_secs(1800),
        transaction: Duration::from_secs(3600),
    }
}

#[tokio::test]
async fn happy_path_completes_transfer() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (id, session_id) = switch.submit_transfer("REF-HAPPY-1").await;

    assert_eq!(switch.status_of(&id).await, TransactionStatus::FtdPending);
    assert_eq!(switch.gateway.debit_dispatches.load(Ordering::SeqCst), 1);

    switch.push_callback(&session_id, "241", "000").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();

    assert_eq!(switch.status_of(&id).await, TransactionStatus::FtcPending);
    assert_eq!(switch.gateway.credit_dispatches.load(Ordering::SeqCst), 1);

    switch.push_callback(&session_id, "240", "000").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();

    assert_eq!(switch.status_of(&id).await, TransactionStatus::Completed);

    let webhooks = switch
        .client_callback_repo
        .get_by_transaction(&id)
        .await
        .unwrap();
    assert_eq!(webhooks.len(), 1);
    assert!(webhooks[0].payload.contains("\"status\":\"SUCCESS\""));
    assert!(webhooks[0].payload.contains("\"amount\":\"100.00\""));

    switch.assert_events_strictly_increasing(&id).await;
}

#[tokio::test]
async fn inconclusive_ftd_resolves_through_tsq() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (id, session_id) = switch.submit_transfer("REF-TSQ-1").await;

    switch.push_callback(&session_id, "241", "990").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();
    assert_eq!(switch.status_of(&id).await, TransactionStatus::FtdTsq);

    switch.gateway.push_tsq_response("000", "000");
    switch.lifecycle.run_tsq_batch(10).await.unwrap();

    assert_eq!(switch.status_of(&id).await, TransactionStatus::FtcPending);
    assert_eq!(switch.gateway.credit_dispatches.load(Ordering::SeqCst), 1);

    let record = switch.transaction_repo.get(&id).await.unwrap().unwrap();
    assert_eq!(record.tsq_attempts, 1);
    assert_eq!(record.ftd_action_code.as_deref(), Some("000"));
}

#[tokio::test]
async fn ftc_failure_triggers_reversal() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (id, session_id) = switch.submit_transfer("REF-REV-1").await;

    switch.push_callback(&session_id, "241", "000").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();
    switch.push_callback(&session_id, "240", "910").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();
    assert_eq!(switch.status_of(&id).await, TransactionStatus::FtcFailed);

    switch.lifecycle.run_reversal_batch(10).await.unwrap();
    assert_eq!(
        switch.status_of(&id).await,
        TransactionStatus::ReversalPending
    );
    assert_eq!(switch.gateway.reversal_dispatches.load(Ordering::SeqCst), 1);

    switch.push_callback(&session_id, "242", "000").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();

    assert_eq!(switch.status_of(&id).await, TransactionStatus::Failed);
    let record = switch.transaction_repo.get(&id).await.unwrap().unwrap();
    assert_eq!(record.reversal_action_code.as_deref(), Some("000"));

    let webhooks = switch
        .client_callback_repo
        .get_by_transaction(&id)
        .await
        .unwrap();
    assert_eq!(webhooks.len(), 1);
    assert!(webhooks[0].payload.contains("\"status\":\"FAILED\""));
    assert!(webhooks[0].payload.contains("\"reason\":\"REVERSED\""));
}

#[tokio::test]
async fn duplicate_ftd_callback_is_ignored() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (id, session_id) = switch.submit_transfer("REF-DUP-1").await;

    switch.push_callback(&session_id, "241", "000").await;
    switch.push_callback(&session_id, "241", "000").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();
    switch.push_callback(&session_id, "240", "000").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();

    assert_eq!(switch.status_of(&id).await, TransactionStatus::Completed);
    assert_eq!(switch.gateway.credit_dispatches.load(Ordering::SeqCst), 1);

    let events = switch.transaction_repo.events(&id).await.unwrap();
    let ignored: Vec<_> = events
        .iter()
        .filter(|event| event.outcome.as_deref() == Some("IGNORED"))
        .collect();
    assert_eq!(ignored.len(), 1);
    assert_eq!(ignored[0].kind, "FTD_CALLBACK");

    switch.assert_events_strictly_increasing(&id).await;
}

#[tokio::test]
async fn unknown_session_and_function_are_ignored() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (_, session_id) = switch.submit_transfer("REF-IGN-1").await;

    switch.push_callback("999999000000000000000000000000", "241", "000").await;
    switch.push_callback(&session_id, "777", "000").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();

    let batch = switch.gip_callback_repo.fetch_batch(10).await.unwrap();
    assert!(batch.is_empty(), "all callbacks should be resolved");
}

#[tokio::test]
async fn duplicate_reference_is_rejected() {
    let switch = TestSwitch::new(no_timeouts()).await;
    switch.submit_transfer("REF-UNIQUE-1").await;

    let result = switch
        .transfer_service
        .funds_transfer(&switch.context, switch.transfer_request("REF-UNIQUE-1"))
        .await;
    assert!(matches!(result, Err(TransferError::DuplicateReference(_))));
}

#[tokio::test]
async fn failed_dispatch_leaves_transaction_initiated() {
    let switch = TestSwitch::new(no_timeouts()).await;
    switch.gateway.fail_dispatches.store(true, Ordering::SeqCst);

    let result = switch
        .transfer_service
        .funds_transfer(&switch.context, switch.transfer_request("REF-DOWN-1"))
        .await;
    assert!(matches!(result, Err(TransferError::GatewayUnreachable(_))));

    let record = switch
        .transaction_repo
        .get_by_reference(&switch.context.institution_id.0, "REF-DOWN-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TransactionStatus::Initiated.to_string());
}

#[tokio::test]
async fn ftd_failure_notifies_client() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (id, session_id) = switch.submit_transfer("REF-FTDF-1").await;

    switch.push_callback(&session_id, "241", "305").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();

    assert_eq!(switch.status_of(&id).await, TransactionStatus::FtdFailed);
    let webhooks = switch
        .client_callback_repo
        .get_by_transaction(&id)
        .await
        .unwrap();
    assert_eq!(webhooks.len(), 1);
    assert!(webhooks[0].payload.contains("\"reason\":\"FTD_FAILED\""));
}

#[tokio::test]
async fn reversal_decline_raises_critical_alert_without_webhook() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (id, session_id) = switch.submit_transfer("REF-REVF-1").await;

    switch.push_callback(&session_id, "241", "000").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();
    switch.push_callback(&session_id, "240", "910").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();
    switch.lifecycle.run_reversal_batch(10).await.unwrap();

    switch.push_callback(&session_id, "242", "911").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();

    assert_eq!(
        switch.status_of(&id).await,
        TransactionStatus::ReversalFailed
    );

    let critical = switch.audit_repo.critical_entries(10).await.unwrap();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].kind, "REVERSAL_FAILED");

    let webhooks = switch
        .client_callback_repo
        .get_by_transaction(&id)
        .await
        .unwrap();
    assert!(webhooks.is_empty());
}

#[tokio::test]
async fn reversal_exhaustion_holds_row_and_alerts_once() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (id, session_id) = switch.submit_transfer("REF-REVX-1").await;

    switch.push_callback(&session_id, "241", "000").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();
    switch.push_callback(&session_id, "240", "910").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();

    // Each batch dispatches once; the zero callback timeout makes the row
    // stale again immediately, so three batches exhaust the attempts.
    for _ in 0..3 {
        switch.lifecycle.run_reversal_batch(10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(switch.gateway.reversal_dispatches.load(Ordering::SeqCst), 3);

    switch.lifecycle.run_reversal_batch(10).await.unwrap();
    switch.lifecycle.run_reversal_batch(10).await.unwrap();

    assert_eq!(
        switch.status_of(&id).await,
        TransactionStatus::ReversalPending
    );
    assert_eq!(switch.gateway.reversal_dispatches.load(Ordering::SeqCst), 3);

    let critical = switch.audit_repo.critical_entries(10).await.unwrap();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].kind, "REVERSAL_EXHAUSTED");
}

#[tokio::test]
async fn silent_ftd_leg_times_out_and_resolves_via_tsq() {
    let leg_timeouts = LegTimeoutsConfig {
        ftd_callback: Duration::ZERO,
        ..no_timeouts()
    };
    let switch = TestSwitch::new(leg_timeouts).await;
    let (id, _) = switch.submit_transfer("REF-TIME-1").await;

    tokio::time::sleep(Duration::from_millis(5)).await;
    switch.lifecycle.sweep_timeouts(10).await.unwrap();
    assert_eq!(switch.status_of(&id).await, TransactionStatus::Timeout);

    switch.gateway.push_tsq_response("000", "000");
    switch.lifecycle.run_tsq_batch(10).await.unwrap();

    assert_eq!(switch.status_of(&id).await, TransactionStatus::FtcPending);
}

#[tokio::test]
async fn tsq_not_found_fails_debit_leg() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (id, session_id) = switch.submit_transfer("REF-381-1").await;

    switch.push_callback(&session_id, "241", "909").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();

    switch.gateway.push_tsq_response("000", "381");
    switch.lifecycle.run_tsq_batch(10).await.unwrap();

    assert_eq!(switch.status_of(&id).await, TransactionStatus::FtdFailed);
    let webhooks = switch
        .client_callback_repo
        .get_by_transaction(&id)
        .await
        .unwrap();
    assert_eq!(webhooks.len(), 1);
}

#[tokio::test]
async fn tsq_exhaustion_escalates_with_critical_alert() {
    let tsq = TsqWorkerConfig {
        max_attempts: 2,
        ..fast_tsq_config()
    };
    let switch =
        TestSwitch::with_configs(no_timeouts(), tsq, fast_reversal_config()).await;
    let (id, session_id) = switch.submit_transfer("REF-TSQX-1").await;

    switch.push_callback(&session_id, "241", "990").await;
    switch.lifecycle.process_callbacks(10).await.unwrap();

    // Both scripted responses are indeterminate; the second exhausts the
    // attempts and holds the row for the operator.
    switch.gateway.push_tsq_response("000", "990");
    switch.lifecycle.run_tsq_batch(10).await.unwrap();
    switch.gateway.push_tsq_response("000", "990");
    switch.lifecycle.run_tsq_batch(10).await.unwrap();
    switch.lifecycle.run_tsq_batch(10).await.unwrap();

    assert_eq!(switch.status_of(&id).await, TransactionStatus::FtdTsq);
    let record = switch.transaction_repo.get(&id).await.unwrap().unwrap();
    assert_eq!(record.tsq_attempts, 2);
    assert!(record.escalated_at.is_some());

    let critical = switch.audit_repo.critical_entries(10).await.unwrap();
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].kind, "TSQ_EXHAUSTED");
}

#[tokio::test]
async fn name_enquiry_resolves_and_audits() {
    let switch = TestSwitch::new(no_timeouts()).await;

    let result = switch
        .transfer_service
        .name_enquiry(
            &switch.context,
            &NameEnquiry {
                destination_bank_code: "090456".to_string(),
                account_number: "9988776655".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(result.account_name.as_deref(), Some("JANE K DOE"));
    assert_eq!(result.session_id.0.len(), 30);
}

#[tokio::test]
async fn webhook_delivery_backs_off_and_succeeds() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (id, _) = switch.submit_transfer("REF-HOOK-1").await;

    let callback_id = switch
        .client_callback_repo
        .enqueue(
            &id,
            &NewClientCallback {
                url: "http://bank.example/hooks/gip".to_string(),
                payload: "{\"status\":\"SUCCESS\"}".to_string(),
                max_attempts: 5,
                next_attempt_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    let sender = Arc::new(ScriptedWebhookSender::new(vec![503, 503, 503, 503, 200]));
    let deliverer = ClientCallbackDeliverer::new(
        switch.client_callback_repo.clone(),
        sender.clone(),
        webhook_config(),
    );

    let expected_delays = [10u64, 20, 40, 80];
    for expected in expected_delays {
        let before = Utc::now();
        let record = switch
            .client_callback_repo
            .get_by_transaction(&id)
            .await
            .unwrap()
            .into_iter()
            .find(|record| record.id == callback_id)
            .unwrap();
        deliverer.deliver_one(&record).await.unwrap();

        let record = switch
            .client_callback_repo
            .get_by_transaction(&id)
            .await
            .unwrap()
            .into_iter()
            .find(|record| record.id == callback_id)
            .unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending.to_string());
        let delay = (record.next_attempt_at - before).num_seconds();
        assert!(
            (expected as i64 - 1..=expected as i64 + 1).contains(&delay),
            "attempt {} rescheduled after {delay}s, expected ~{expected}s",
            record.attempts
        );
    }

    let record = switch
        .client_callback_repo
        .get_by_transaction(&id)
        .await
        .unwrap()
        .into_iter()
        .find(|record| record.id == callback_id)
        .unwrap();
    deliverer.deliver_one(&record).await.unwrap();

    let record = switch
        .client_callback_repo
        .get_by_transaction(&id)
        .await
        .unwrap()
        .into_iter()
        .find(|record| record.id == callback_id)
        .unwrap();
    assert_eq!(record.status, DeliveryStatus::Delivered.to_string());
    assert_eq!(record.attempts, 5);
    assert_eq!(record.last_http_status, Some(200));
    assert_eq!(sender.deliveries.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn webhook_delivery_fails_after_max_attempts() {
    let switch = TestSwitch::new(no_timeouts()).await;
    let (id, _) = switch.submit_transfer("REF-HOOK-2").await;

    let callback_id = switch
        .client_callback_repo
        .enqueue(
            &id,
            &NewClientCallback {
                url: "http://bank.example/hooks/gip".to_string(),
                payload: "{\"status\":\"FAILED\"}".to_string(),
                max_attempts: 3,
                next_attempt_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    let sender = Arc::new(ScriptedWebhookSender::new(vec![500, 500, 500]));
    let deliverer = ClientCallbackDeliverer::new(
        switch.client_callback_repo.clone(),
        sender,
        webhook_config(),
    );

    for _ in 0..3 {
        let record = switch
            .client_callback_repo
            .get_by_transaction(&id)
            .await
            .unwrap()
            .into_iter()
            .find(|record| record.id == callback_id)
            .unwrap();
        deliverer.deliver_one(&record).await.unwrap();
    }

    let record = switch
        .client_callback_repo
        .get_by_transaction(&id)
        .await
        .unwrap()
        .into_iter()
        .find(|record| record.id == callback_id)
        .unwrap();
    assert_eq!(record.status, DeliveryStatus::Failed.to_string());
    assert_eq!(record.attempts, 3);
    assert_eq!(record.last_http_status, Some(500));
}
