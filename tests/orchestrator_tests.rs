//! Orchestrator fallback scenarios against a scripted transport.

use std::collections::VecDeque;

use tuya_pull::activation::{ActivationOutcome, ActivationSession};
use tuya_pull::config::PullConfig;
use tuya_pull::device::{DeviceIdentity, DeviceVersions, KeySet, ProvisioningToken};
use tuya_pull::errors::{ActivationError, ActivationResult};
use tuya_pull::messages::{ActivationData, ActivationParams, ActivationResponse};
use tuya_pull::transport::ActivationTransport;

const UUID: &str = "aaaabbbbccccdddd";
const AUTH_KEY: &str = "0123456789abcdef0123456789abcdef";
const PRODUCT_KEY: &str = "ppppqqqqrrrrssss";
const FIRMWARE_KEY: &str = "ffffgggghhhhiiii";

/// Transport that replays scripted responses and records every attempt.
struct MockTransport {
    responses: VecDeque<ActivationResult<ActivationResponse>>,
    attempts: Vec<ActivationData>,
    param_timestamps: Vec<u64>,
}

impl MockTransport {
    fn new(responses: Vec<ActivationResult<ActivationResponse>>) -> Self {
        Self {
            responses: responses.into(),
            attempts: Vec::new(),
            param_timestamps: Vec::new(),
        }
    }
}

impl ActivationTransport for MockTransport {
    async fn send_attempt(
        &mut self,
        params: &ActivationParams,
        data: &ActivationData,
    ) -> ActivationResult<ActivationResponse> {
        self.param_timestamps.push(params.t);
        self.attempts.push(data.clone());
        self.responses
            .pop_front()
            .expect("orchestrator made more attempts than the script allows")
    }
}

fn failure(code: &str) -> ActivationResult<ActivationResponse> {
    Ok(serde_json::from_value(serde_json::json!({
        "success": false,
        "errorCode": code,
        "errorMsg": format!("{code} from test script"),
        "t": 1700000000u64,
    }))
    .unwrap())
}

fn success() -> ActivationResult<ActivationResponse> {
    Ok(serde_json::from_value(serde_json::json!({
        "success": true,
        "result": { "schemaId": "123", "schema": "[{\"id\":1}]" },
        "t": 1700000000u64,
    }))
    .unwrap())
}

fn session(product_key: Option<&str>, firmware_key: Option<&str>) -> ActivationSession {
    let identity = DeviceIdentity::new(Some(UUID), Some(AUTH_KEY), None).unwrap();
    let keys = KeySet::new(
        product_key.map(str::to_string),
        firmware_key.map(str::to_string),
    )
    .unwrap();
    let versions = DeviceVersions {
        soft_ver: "1.0.0".to_string(),
        ..Default::default()
    };
    ActivationSession::new(identity, keys, versions, PullConfig::default()).unwrap()
}

fn token() -> ProvisioningToken {
    ProvisioningToken::parse("AZ12345678ABCD").unwrap()
}

#[tokio::test]
async fn retryable_code_flips_flag_and_succeeds_without_firmware_fallback() {
    let session = session(Some(PRODUCT_KEY), None);
    let mut transport = MockTransport::new(vec![failure("NOT_EXISTS"), success()]);

    let outcome = session.run_attempts(&mut transport, &token()).await.unwrap();

    let ActivationOutcome::Activated { schema_id, schema } = outcome else {
        panic!("expected activation to succeed");
    };
    assert_eq!(schema_id, "123");
    assert!(schema.contains("id"));

    // Exactly two attempts, both with the product key, flag flipped on the
    // second, and no firmware-key attempt.
    assert_eq!(transport.attempts.len(), 2);
    assert_eq!(
        transport.attempts[0].product_key.as_deref(),
        Some(PRODUCT_KEY)
    );
    assert_eq!(transport.attempts[0].options, "{\"isFK\":false}");
    assert_eq!(
        transport.attempts[1].product_key.as_deref(),
        Some(PRODUCT_KEY)
    );
    assert_eq!(transport.attempts[1].options, "{\"isFK\":true}");
    assert!(transport.attempts.iter().all(|a| a.firmware_key.is_none()));
}

#[tokio::test]
async fn expire_terminates_after_one_attempt_without_firmware_key() {
    let session = session(Some(PRODUCT_KEY), None);
    let mut transport = MockTransport::new(vec![failure("EXPIRE")]);

    let outcome = session.run_attempts(&mut transport, &token()).await.unwrap();

    let ActivationOutcome::Rejected(response) = outcome else {
        panic!("expected rejection");
    };
    assert!(response.is_expired());
    assert_eq!(transport.attempts.len(), 1);
}

#[tokio::test]
async fn expire_suppresses_firmware_fallback_even_when_configured() {
    let session = session(Some(PRODUCT_KEY), Some(FIRMWARE_KEY));
    let mut transport = MockTransport::new(vec![failure("EXPIRE")]);

    let outcome = session.run_attempts(&mut transport, &token()).await.unwrap();

    // EXPIRE means the token is stale, not that the key type is wrong.
    let ActivationOutcome::Rejected(response) = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(response.error_code.as_deref(), Some("EXPIRE"));
    assert_eq!(transport.attempts.len(), 1);
}

#[tokio::test]
async fn firmware_only_starts_with_flag_set_then_flips() {
    let session = session(None, Some(FIRMWARE_KEY));
    let mut transport = MockTransport::new(vec![failure("FIRMWARE_NOT_MATCH"), success()]);

    let outcome = session.run_attempts(&mut transport, &token()).await.unwrap();
    assert!(matches!(outcome, ActivationOutcome::Activated { .. }));

    assert_eq!(transport.attempts.len(), 2);
    assert_eq!(
        transport.attempts[0].firmware_key.as_deref(),
        Some(FIRMWARE_KEY)
    );
    assert_eq!(transport.attempts[0].options, "{\"isFK\":true}");
    assert_eq!(transport.attempts[1].options, "{\"isFK\":false}");
    assert!(transport.attempts.iter().all(|a| a.product_key.is_none()));
}

#[tokio::test]
async fn non_retryable_product_failure_falls_back_to_firmware_key() {
    let session = session(Some(PRODUCT_KEY), Some(FIRMWARE_KEY));
    // Unknown code: not retryable (no flag flip on the product path), not
    // EXPIRE (firmware fallback still happens).
    let mut transport = MockTransport::new(vec![failure("SOME_FUTURE_CODE"), success()]);

    let outcome = session.run_attempts(&mut transport, &token()).await.unwrap();
    assert!(matches!(outcome, ActivationOutcome::Activated { .. }));

    assert_eq!(transport.attempts.len(), 2);
    assert!(transport.attempts[0].product_key.is_some());
    assert!(transport.attempts[1].firmware_key.is_some());
    assert_eq!(transport.attempts[1].options, "{\"isFK\":true}");
}

#[tokio::test]
async fn retryable_product_failures_then_firmware_retries_run_all_four_attempts() {
    let session = session(Some(PRODUCT_KEY), Some(FIRMWARE_KEY));
    let mut transport = MockTransport::new(vec![
        failure("NOT_EXISTS"),
        failure("APP_PRODUCT_UNSUPPORT"),
        failure("FIRMWARE_NOT_MATCH"),
        failure("NOT_EXISTS"),
    ]);

    let outcome = session.run_attempts(&mut transport, &token()).await.unwrap();

    // Final failure is the last response, verbatim.
    let ActivationOutcome::Rejected(response) = outcome else {
        panic!("expected rejection");
    };
    assert_eq!(response.error_code.as_deref(), Some("NOT_EXISTS"));

    assert_eq!(transport.attempts.len(), 4);
    let flags: Vec<&str> = transport
        .attempts
        .iter()
        .map(|a| a.options.as_str())
        .collect();
    assert_eq!(
        flags,
        vec![
            "{\"isFK\":false}",
            "{\"isFK\":true}",
            "{\"isFK\":true}",
            "{\"isFK\":false}",
        ]
    );
}

#[tokio::test]
async fn timestamp_is_shared_between_query_and_body_across_attempts() {
    let session = session(Some(PRODUCT_KEY), Some(FIRMWARE_KEY));
    let mut transport = MockTransport::new(vec![
        failure("NOT_EXISTS"),
        failure("APP_PRODUCT_UNSUPPORT"),
        failure("FIRMWARE_NOT_MATCH"),
        failure("NOT_EXISTS"),
    ]);

    session.run_attempts(&mut transport, &token()).await.unwrap();

    // One timestamp per run: every attempt's query `t` matches its body `t`,
    // and all four attempts share the same value.
    assert_eq!(transport.attempts.len(), 4);
    let t = transport.attempts[0].t;
    assert!(transport.attempts.iter().all(|a| a.t == t));
    assert_eq!(transport.param_timestamps, vec![t; 4]);
    // 2023-01-01 onwards
    assert!(t > 1_672_531_200);
}

#[tokio::test]
async fn transport_failure_aborts_the_run() {
    let session = session(Some(PRODUCT_KEY), Some(FIRMWARE_KEY));
    let mut transport = MockTransport::new(vec![Err(ActivationError::Transport(
        "connection reset".to_string(),
    ))]);

    let err = session
        .run_attempts(&mut transport, &token())
        .await
        .unwrap_err();
    assert!(matches!(err, ActivationError::Transport(_)));
    assert_eq!(transport.attempts.len(), 1);
}

#[tokio::test]
async fn request_body_carries_the_stripped_token() {
    let session = session(Some(PRODUCT_KEY), None);
    let mut transport = MockTransport::new(vec![success()]);

    session.run_attempts(&mut transport, &token()).await.unwrap();

    assert_eq!(transport.attempts[0].token, "12345678");
    assert_eq!(transport.attempts[0].soft_ver, "1.0.0");
    assert_eq!(transport.attempts[0].baseline_ver, "40.00");
    assert_eq!(transport.attempts[0].protocol_ver, "2.2");
}
