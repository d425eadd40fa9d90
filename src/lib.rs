//! tuya-pull - A client for the Tuya device-activation endpoint.
//!
//! Given a device's uuid, auth key, and a product or firmware key from a
//! firmware dump, this crate performs the `tuya.device.active` call and
//! returns the device's data point schema. The activation call requires a
//! short-lived provisioning token; the official mobile apps broadcast one
//! over UDP during device setup, and [`listener`] can capture it.
//!
//! # Layers
//!
//! - [`psk`] - PSK identity/secret derivation for the TLS handshake
//! - [`codec`] - query signing and AES-128-ECB body encryption
//! - [`transport`] - literal HTTP/1.1 framing over plain or PSK sockets
//! - [`activation`] - the multi-attempt orchestrator
//! - [`listener`] - UDP token frame decoder
//!
//! # Example
//!
//! ```rust,ignore
//! use tokio_util::sync::CancellationToken;
//! use tuya_pull::activation::ActivationSession;
//! use tuya_pull::config::PullConfig;
//! use tuya_pull::device::{DeviceIdentity, DeviceVersions, KeySet};
//!
//! let identity = DeviceIdentity::new(Some(uuid), Some(auth_key), None)?;
//! let keys = KeySet::new(Some(product_key), None)?;
//! let versions = DeviceVersions { soft_ver, ..Default::default() };
//! let session = ActivationSession::new(identity, keys, versions, PullConfig::load()?)?;
//! let outcome = session.activate(Some(token), CancellationToken::new()).await?;
//! ```

pub mod activation;
pub mod codec;
pub mod config;
pub mod device;
pub mod errors;
pub mod listener;
pub mod messages;
pub mod psk;
pub mod transport;
