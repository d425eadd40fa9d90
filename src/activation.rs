//! The activation orchestrator.
//!
//! Drives up to four attempts against the regional server, selecting the
//! credential and the `isFK` flag from what the previous attempt returned:
//!
//! ```text
//! AttemptA  product key,  isFK=false
//! AttemptB  product key,  isFK=true    (only after a retryable code)
//! AttemptC  firmware key, isFK=true    (when product attempts failed
//!                                       with anything but EXPIRE, or no
//!                                       product key exists)
//! AttemptD  firmware key, isFK=false   (only after a retryable code)
//! ```
//!
//! `EXPIRE` means the token itself is stale or wrong-region, not that the
//! key type is wrong, so it stops the fallback chain. The final failure is
//! reported verbatim — the server's own payload, not a synthesized message.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::PullConfig;
use crate::device::{DeviceIdentity, DeviceVersions, KeySet, ProvisioningToken};
use crate::errors::{ActivationError, ActivationResult};
use crate::listener;
use crate::messages::{ActivationData, ActivationParams, ActivationResponse, AttemptKey};
use crate::transport::{ActivationTransport, Endpoint, HttpTransport};

/// Final outcome of an activation run.
#[derive(Debug, Clone)]
pub enum ActivationOutcome {
    /// The server returned a schema.
    Activated {
        /// Server-side schema identifier
        schema_id: String,
        /// The schema document as JSON text
        schema: String,
    },
    /// Every attempt failed; the last server response, verbatim.
    Rejected(ActivationResponse),
}

/// One activation session: validated credentials plus configuration.
///
/// Network attempts are strictly sequential — each attempt's outcome
/// decides whether the next one happens at all.
pub struct ActivationSession {
    identity: DeviceIdentity,
    keys: KeySet,
    versions: DeviceVersions,
    config: PullConfig,
    initial_secret: Option<Vec<u8>>,
}

impl ActivationSession {
    /// Validate inputs and build a session.
    pub fn new(
        identity: DeviceIdentity,
        keys: KeySet,
        versions: DeviceVersions,
        config: PullConfig,
    ) -> ActivationResult<Self> {
        versions.validate()?;
        Ok(Self {
            identity,
            keys,
            versions,
            config,
            initial_secret: None,
        })
    }

    /// Supply a PSK secret known out of band, selecting the v2 identity
    /// lineage from the first connection.
    pub fn with_psk_secret(mut self, secret: Vec<u8>) -> Self {
        self.initial_secret = Some(secret);
        self
    }

    /// Run the full activation flow.
    ///
    /// When `token` is absent or not the expected 14 characters, the UDP
    /// listener blocks until the companion app broadcasts one or `cancel`
    /// fires.
    pub async fn activate(
        &self,
        token: Option<String>,
        cancel: CancellationToken,
    ) -> ActivationResult<ActivationOutcome> {
        let raw_token = match token {
            Some(t) if t.len() == 14 => t,
            Some(t) => {
                warn!(
                    len = t.len(),
                    "provided token is not 14 characters, waiting for a broadcast token"
                );
                listener::listen_for_token(self.config.listener.port, cancel).await?
            }
            None => {
                info!(
                    port = self.config.listener.port,
                    "no token provided, waiting for a broadcast token"
                );
                listener::listen_for_token(self.config.listener.port, cancel).await?
            }
        };

        let token = ProvisioningToken::parse(&raw_token)?;
        info!(region = %token.region(), token = token.token(), "provisioning token accepted");

        let endpoint = Endpoint::for_region(&self.config.network, token.region());
        let mut transport = HttpTransport::new(
            endpoint,
            self.identity.clone(),
            self.config.network.clone(),
            self.initial_secret.clone(),
        );

        self.run_attempts(&mut transport, &token).await
    }

    /// Drive the attempt state machine over any transport.
    pub async fn run_attempts<T: ActivationTransport>(
        &self,
        transport: &mut T,
        token: &ProvisioningToken,
    ) -> ActivationResult<ActivationOutcome> {
        let t = epoch_seconds();
        let params = ActivationParams {
            t,
            uuid: self.identity.uuid().to_string(),
        };

        let mut last: Option<ActivationResponse> = None;

        if let Some(product_key) = &self.keys.product_key {
            let key = AttemptKey::Product(product_key.clone());
            let response = self
                .attempt(transport, &params, token, &key, false, t)
                .await?;

            let response = if response.is_retryable_failure() {
                // Maybe it needed the alternate flag; retry before giving
                // up on this key type.
                self.attempt(transport, &params, token, &key, true, t).await?
            } else {
                response
            };
            last = Some(response);
        }

        let product_path_exhausted = match &last {
            None => true,
            Some(r) => !r.success && !r.is_expired(),
        };

        if product_path_exhausted {
            if let Some(firmware_key) = &self.keys.firmware_key {
                let key = AttemptKey::Firmware(firmware_key.clone());
                let response = self
                    .attempt(transport, &params, token, &key, true, t)
                    .await?;

                let response = if response.is_retryable_failure() {
                    self.attempt(transport, &params, token, &key, false, t)
                        .await?
                } else {
                    response
                };
                last = Some(response);
            }
        }

        // KeySet guarantees at least one key, so at least one attempt ran.
        let response = last.ok_or_else(|| {
            ActivationError::InvalidCredentials("no activation attempt was possible".to_string())
        })?;

        if response.success {
            let result = response.result.ok_or_else(|| {
                ActivationError::Decode(
                    "server reported success without a schema payload".to_string(),
                )
            })?;
            info!(schema_id = %result.schema_id, "device activated");
            return Ok(ActivationOutcome::Activated {
                schema_id: result.schema_id,
                schema: result.schema,
            });
        }

        warn!(
            error_code = response.error_code.as_deref().unwrap_or("-"),
            "activation rejected by server"
        );
        Ok(ActivationOutcome::Rejected(response))
    }

    async fn attempt<T: ActivationTransport>(
        &self,
        transport: &mut T,
        params: &ActivationParams,
        token: &ProvisioningToken,
        key: &AttemptKey,
        is_fk: bool,
        t: u64,
    ) -> ActivationResult<ActivationResponse> {
        info!(key = %key, is_fk, "sending activation attempt");
        let data = ActivationData::new(token.token(), key, &self.versions, is_fk, t);
        transport.send_attempt(params, &data).await
    }
}

/// Current epoch time in seconds.
fn epoch_seconds() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
