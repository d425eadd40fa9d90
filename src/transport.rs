//! HTTP/1.1 framing and the PSK-wrapped (or plain) socket transport.
//!
//! The activation server speaks plain HTTP/1.1 over TCP, or the same thing
//! inside a TLS 1.2 session negotiated with the `PSK-AES128-CBC-SHA256`
//! cipher suite. Its parser is not guaranteed tolerant of header
//! reordering, so the request is built literally with a deterministic
//! header order rather than through an HTTP client library.
//!
//! Responses are read until the declared `Content-Length` is satisfied or
//! the connection closes; a truncated body is a protocol error. The body's
//! JSON envelope carries the encrypted payload base64 encoded in its
//! `result` field, which is handed to the codec for decryption.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use openssl::error::ErrorStack;
use openssl::ssl::{Ssl, SslContext, SslMethod, SslVersion};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::codec;
use crate::config::NetworkConfig;
use crate::device::{DeviceIdentity, Region};
use crate::errors::{ActivationError, ActivationResult};
use crate::messages::{ActivationData, ActivationParams, ActivationResponse, ResponseEnvelope};
use crate::psk::{self, PskState};

/// TLS 1.2 cipher suite the activation server negotiates.
const PSK_CIPHER: &str = "PSK-AES128-CBC-SHA256";

/// A resolved regional activation endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Hostname, e.g. `a.tuyaus.com`
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Request path
    pub path: String,
    /// Whether the connection is wrapped in PSK TLS
    pub psk_wrapped: bool,
}

impl Endpoint {
    /// Resolve the endpoint for a region from the network configuration.
    pub fn for_region(network: &NetworkConfig, region: Region) -> Self {
        let psk_wrapped = network.scheme == "https";
        Self {
            host: format!(
                "{}{}{}",
                network.host_prefix,
                region.code(),
                network.host_suffix
            ),
            port: network.port.unwrap_or(if psk_wrapped { 443 } else { 80 }),
            path: network.path.clone(),
            psk_wrapped,
        }
    }
}

/// One activation request/response exchange.
///
/// The orchestrator drives attempts through this seam; tests substitute a
/// scripted implementation.
pub trait ActivationTransport {
    /// Send one activation attempt and decode the server's response.
    fn send_attempt(
        &mut self,
        params: &ActivationParams,
        data: &ActivationData,
    ) -> impl std::future::Future<Output = ActivationResult<ActivationResponse>>;
}

/// Transport over a fresh TCP (or PSK TLS) connection per attempt.
///
/// The PSK secret derived during the first handshake is kept in the shared
/// [`PskState`], so later connections in the same session reuse it through
/// the v2 identity lineage.
pub struct HttpTransport {
    endpoint: Endpoint,
    identity: DeviceIdentity,
    network: NetworkConfig,
    psk: Arc<Mutex<PskState>>,
    /// Derivation failures inside the handshake callback land here, since
    /// the callback can only signal OpenSSL-level errors.
    handshake_error: Arc<Mutex<Option<ActivationError>>>,
}

impl HttpTransport {
    /// Build a transport for one session.
    ///
    /// `initial_secret` selects the v2 derivation lineage from the first
    /// connection when a PSK is already known out of band.
    pub fn new(
        endpoint: Endpoint,
        identity: DeviceIdentity,
        network: NetworkConfig,
        initial_secret: Option<Vec<u8>>,
    ) -> Self {
        Self {
            endpoint,
            identity,
            network,
            psk: Arc::new(Mutex::new(PskState::from_optional_secret(initial_secret))),
            handshake_error: Arc::new(Mutex::new(None)),
        }
    }

    async fn exchange(&self, request: &[u8]) -> ActivationResult<Vec<u8>> {
        let tcp = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)).await?;

        if self.endpoint.psk_wrapped {
            let mut stream = self.psk_handshake(tcp).await?;
            stream.write_all(request).await?;
            stream.flush().await?;
            read_http_response(&mut stream, self.network.max_response_bytes).await
        } else {
            let mut stream = tcp;
            stream.write_all(request).await?;
            stream.flush().await?;
            read_http_response(&mut stream, self.network.max_response_bytes).await
        }
    }

    /// Wrap a TCP stream in the PSK TLS session.
    async fn psk_handshake(
        &self,
        tcp: TcpStream,
    ) -> ActivationResult<tokio_openssl::SslStream<TcpStream>> {
        let mut builder = SslContext::builder(SslMethod::tls_client())?;
        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_cipher_list(PSK_CIPHER)?;

        let psk = self.psk.clone();
        let error_slot = self.handshake_error.clone();
        let uuid = self.identity.uuid().to_string();
        let auth_key = self.identity.auth_key().to_string();

        builder.set_psk_client_callback(move |_ssl, hint, identity_buf, psk_buf| {
            let hint = hint.unwrap_or(&[]);
            let mut state = psk.lock().expect("PSK state lock poisoned");

            let (derived, next) = match psk::derive_for_state(&state, &uuid, &auth_key, hint) {
                Ok(pair) => pair,
                Err(e) => {
                    *error_slot.lock().expect("handshake error slot poisoned") = Some(e);
                    return Err(ErrorStack::get());
                }
            };

            // The identity travels as a C string and needs its terminator.
            if derived.identity.len() + 1 > identity_buf.len()
                || derived.secret.len() > psk_buf.len()
            {
                *error_slot.lock().expect("handshake error slot poisoned") =
                    Some(ActivationError::Transport(
                        "PSK identity or key does not fit the handshake buffers".to_string(),
                    ));
                return Err(ErrorStack::get());
            }

            identity_buf[..derived.identity.len()].copy_from_slice(&derived.identity);
            identity_buf[derived.identity.len()] = 0;
            psk_buf[..derived.secret.len()].copy_from_slice(&derived.secret);

            let len = derived.secret.len();
            *state = next;
            Ok(len)
        });

        let ctx = builder.build();
        let ssl = Ssl::new(&ctx)?;
        let mut stream = tokio_openssl::SslStream::new(ssl, tcp)
            .map_err(|e| ActivationError::Transport(format!("TLS stream setup failed: {e}")))?;

        if let Err(e) = Pin::new(&mut stream).connect().await {
            // Prefer the derivation error recorded by the callback over the
            // generic OpenSSL handshake failure.
            if let Some(derivation_err) = self
                .handshake_error
                .lock()
                .expect("handshake error slot poisoned")
                .take()
            {
                return Err(derivation_err);
            }
            return Err(ActivationError::Transport(format!(
                "PSK handshake failed: {e}"
            )));
        }

        Ok(stream)
    }
}

impl ActivationTransport for HttpTransport {
    async fn send_attempt(
        &mut self,
        params: &ActivationParams,
        data: &ActivationData,
    ) -> ActivationResult<ActivationResponse> {
        let auth_key = self.identity.auth_key().to_string();
        let query = codec::sign_query(&params.to_query_map(), &auth_key);
        let body = codec::encrypt_body(data, &auth_key)?;
        let path_and_query = format!("{}?{}", self.endpoint.path, query);

        let request = build_request(
            "POST",
            &self.endpoint.host,
            &path_and_query,
            &body,
            &self.network.user_agent,
        );

        debug!(
            host = %self.endpoint.host,
            psk = self.endpoint.psk_wrapped,
            body_bytes = body.len(),
            "sending activation request"
        );

        let raw = self.exchange(&request).await?;
        let response = decode_response_body(&raw, &auth_key)?;

        info!(
            success = response.success,
            error_code = response.error_code.as_deref().unwrap_or("-"),
            "activation response received"
        );
        Ok(response)
    }
}

/// Build one literal HTTP/1.1 request.
///
/// Header order is deterministic: Host, User-Agent, Connection, then the
/// body headers when a body is present.
pub fn build_request(
    method: &str,
    host: &str,
    path_and_query: &str,
    body: &str,
    user_agent: &str,
) -> Vec<u8> {
    let mut request = format!("{method} {path_and_query} HTTP/1.1\r\n");
    request.push_str(&format!("Host: {host}\r\n"));
    request.push_str(&format!("User-Agent: {user_agent}\r\n"));
    request.push_str("Connection: keep-alive\r\n");

    if !body.is_empty() {
        request.push_str("Content-Type: application/x-www-form-urlencoded; charset=UTF-8\r\n");
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }

    request.push_str("\r\n");
    request.push_str(body);
    request.into_bytes()
}

/// Read one HTTP response, returning the body bytes.
///
/// Reads until the `Content-Length` boundary is satisfied, or until the
/// connection closes when no length is declared. A body shorter than the
/// declared length, or headers that never complete, is a protocol error.
/// The activation server never chunk-encodes, and with keep-alive requested
/// a chunked response would stall the close-based path, so any
/// `Transfer-Encoding` header is rejected outright.
pub async fn read_http_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    cap: usize,
) -> ActivationResult<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let mut header_end: Option<usize> = None;
    let mut content_length: Option<usize> = None;

    loop {
        if let (Some(end), Some(length)) = (header_end, content_length) {
            if buf.len() - end >= length {
                return Ok(buf[end..end + length].to_vec());
            }
        }

        if buf.len() >= cap {
            return Err(ActivationError::Decode(format!(
                "response exceeded read-size cap of {cap} bytes"
            )));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return match (header_end, content_length) {
                (Some(end), Some(length)) if buf.len() - end < length => {
                    Err(ActivationError::Decode(format!(
                        "response body truncated: got {} of {length} bytes",
                        buf.len() - end
                    )))
                }
                (Some(end), Some(length)) => Ok(buf[end..end + length].to_vec()),
                (Some(end), None) => Ok(buf[end..].to_vec()),
                (None, _) => Err(ActivationError::Decode(
                    "connection closed before response headers completed".to_string(),
                )),
            };
        }
        buf.extend_from_slice(&chunk[..n]);

        if header_end.is_none() {
            if let Some(pos) = find_header_boundary(&buf) {
                reject_transfer_encoding(&buf[..pos])?;
                header_end = Some(pos + 4);
                content_length = parse_content_length(&buf[..pos])?;
            }
        }
    }
}

/// Locate the `\r\n\r\n` separating headers from body.
fn find_header_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Fail on a `Transfer-Encoding` header: this reader only understands
/// `Content-Length` or read-to-close framing.
fn reject_transfer_encoding(headers: &[u8]) -> ActivationResult<()> {
    for line in headers.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line).unwrap_or("").trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("transfer-encoding") {
            return Err(ActivationError::Decode(format!(
                "unsupported Transfer-Encoding {:?} in response",
                value.trim()
            )));
        }
    }
    Ok(())
}

/// Extract a `Content-Length` value from the raw header block, if present.
fn parse_content_length(headers: &[u8]) -> ActivationResult<Option<usize>> {
    for line in headers.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line).unwrap_or("").trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.eq_ignore_ascii_case("content-length") {
            let length = value.trim().parse::<usize>().map_err(|_| {
                ActivationError::Decode(format!("invalid Content-Length value {value:?}"))
            })?;
            return Ok(Some(length));
        }
    }
    Ok(None)
}

/// Decode a raw HTTP body into an [`ActivationResponse`].
///
/// Envelope JSON → base64 `result` field → AES-128-ECB decrypt → response
/// JSON. Every stage failure is a decode error aborting the run.
pub fn decode_response_body(raw: &[u8], auth_key: &str) -> ActivationResult<ActivationResponse> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| ActivationError::Decode(format!("response body is not UTF-8: {e}")))?;

    let envelope: ResponseEnvelope = serde_json::from_str(text.trim())
        .map_err(|e| ActivationError::Decode(format!("invalid response envelope: {e}")))?;

    let ciphertext = B64
        .decode(envelope.result.as_bytes())
        .map_err(|e| ActivationError::Decode(format!("invalid base64 in result field: {e}")))?;

    let plaintext = codec::decrypt_body(&ciphertext, auth_key)?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| ActivationError::Decode(format!("invalid activation response JSON: {e}")))
}
