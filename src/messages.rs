//! Wire structures for the `tuya.device.active` call.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Query parameters for one activation request.
///
/// The parameter set is fixed: action name, expiry flag, epoch timestamp,
/// device uuid, and the protocol literal `4.4`. Serialization order is
/// handled downstream by the signing step, which sorts keys
/// lexicographically.
#[derive(Debug, Clone)]
pub struct ActivationParams {
    /// Epoch timestamp shared with the body's `t` field
    pub t: u64,
    /// Device uuid
    pub uuid: String,
}

impl ActivationParams {
    /// Fixed action name of the activation endpoint.
    pub const ACTION: &'static str = "tuya.device.active";
    /// Fixed protocol version literal.
    pub const PROTOCOL: &'static str = "4.4";

    /// Render as the key/value map consumed by the query signer.
    pub fn to_query_map(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("a".to_string(), Self::ACTION.to_string());
        params.insert("t".to_string(), self.t.to_string());
        params.insert("uuid".to_string(), self.uuid.clone());
        params.insert("v".to_string(), Self::PROTOCOL.to_string());
        params.insert("et".to_string(), "1".to_string());
        params
    }
}

/// Which credential an attempt presents, and under which body field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptKey {
    /// Sent as `productKey`
    Product(String),
    /// Sent as `firmwareKey`
    Firmware(String),
}

impl AttemptKey {
    /// The key material regardless of kind.
    pub fn key(&self) -> &str {
        match self {
            AttemptKey::Product(k) | AttemptKey::Firmware(k) => k,
        }
    }
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptKey::Product(_) => write!(f, "product key"),
            AttemptKey::Firmware(_) => write!(f, "firmware key"),
        }
    }
}

/// Request body for one activation attempt.
///
/// Exactly one of `product_key`/`firmware_key` is present per attempt,
/// though across the attempt sequence both may be tried. `options` is a
/// literal JSON fragment carried as a string, exactly as the server expects
/// it.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationData {
    pub token: String,
    #[serde(rename = "productKey", skip_serializing_if = "Option::is_none")]
    pub product_key: Option<String>,
    #[serde(rename = "firmwareKey", skip_serializing_if = "Option::is_none")]
    pub firmware_key: Option<String>,
    #[serde(rename = "softVer")]
    pub soft_ver: String,
    #[serde(rename = "protocolVer")]
    pub protocol_ver: String,
    #[serde(rename = "baselineVer")]
    pub baseline_ver: String,
    /// Literal JSON fragment `{"isFK":<bool>}`
    pub options: String,
    #[serde(rename = "cadVer")]
    pub cad_ver: String,
    #[serde(rename = "cdVer")]
    pub cd_ver: String,
    pub t: u64,
}

impl ActivationData {
    /// Build the body for one attempt.
    pub fn new(
        token: &str,
        key: &AttemptKey,
        versions: &crate::device::DeviceVersions,
        is_fk: bool,
        t: u64,
    ) -> Self {
        let (product_key, firmware_key) = match key {
            AttemptKey::Product(k) => (Some(k.clone()), None),
            AttemptKey::Firmware(k) => (None, Some(k.clone())),
        };

        Self {
            token: token.to_string(),
            product_key,
            firmware_key,
            soft_ver: versions.soft_ver.clone(),
            protocol_ver: versions.protocol_ver.clone(),
            baseline_ver: versions.baseline_ver.clone(),
            options: format!("{{\"isFK\":{is_fk}}}"),
            cad_ver: versions.cad_ver.clone(),
            cd_ver: versions.cd_ver.clone(),
            t,
        }
    }
}

/// Error codes returned by the activation server.
///
/// These correspond to the server's `errorCode` string vocabulary and let
/// the orchestrator drive its fallback logic without string comparisons at
/// every decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorCode {
    /// The presented key does not match the device firmware
    FirmwareNotMatch,
    /// The app-side product is not supported for this key
    AppProductUnsupport,
    /// The key is unknown to the server
    NotExists,
    /// The provisioning token is stale or belongs to another region
    Expire,
    /// Any other code (forward compatibility)
    Unknown,
}

impl ServerErrorCode {
    /// Parse the server's error code string.
    pub fn parse(code: &str) -> Self {
        match code {
            "FIRMWARE_NOT_MATCH" => ServerErrorCode::FirmwareNotMatch,
            "APP_PRODUCT_UNSUPPORT" => ServerErrorCode::AppProductUnsupport,
            "NOT_EXISTS" => ServerErrorCode::NotExists,
            "EXPIRE" => ServerErrorCode::Expire,
            _ => ServerErrorCode::Unknown,
        }
    }

    /// True for the codes worth one more attempt with the flag flipped.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServerErrorCode::FirmwareNotMatch
                | ServerErrorCode::AppProductUnsupport
                | ServerErrorCode::NotExists
        )
    }
}

/// Successful activation payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaResult {
    /// Server-side schema identifier
    #[serde(rename = "schemaId")]
    pub schema_id: String,
    /// The schema itself, a JSON document carried as text
    pub schema: String,
}

/// Decoded activation response.
///
/// `success: true` carries a [`SchemaResult`]; `success: false` carries an
/// `errorCode` (and usually an `errorMsg`) instead.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivationResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Option<SchemaResult>,
    #[serde(rename = "errorCode", default)]
    pub error_code: Option<String>,
    #[serde(rename = "errorMsg", default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub t: Option<u64>,
}

impl ActivationResponse {
    /// The typed error code, `Unknown` when absent or unrecognized.
    pub fn code(&self) -> ServerErrorCode {
        self.error_code
            .as_deref()
            .map(ServerErrorCode::parse)
            .unwrap_or(ServerErrorCode::Unknown)
    }

    /// True when the failure is worth one more attempt with `isFK` flipped.
    pub fn is_retryable_failure(&self) -> bool {
        !self.success && self.code().is_retryable()
    }

    /// True when the token itself is stale or wrong-region.
    pub fn is_expired(&self) -> bool {
        !self.success && self.code() == ServerErrorCode::Expire
    }
}

/// The outer HTTP response body.
///
/// `result` holds the base64 of the AES-encrypted activation response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    pub result: String,
}
