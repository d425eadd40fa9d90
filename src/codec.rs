//! Request signing and body encryption for the activation endpoint.
//!
//! The cryptographic profile is fixed by the server and non-negotiable:
//! query parameters are signed with MD5 over a `||`-joined rendering, and
//! the JSON body travels AES-128-ECB encrypted (PKCS#7 padded) under the
//! first 16 bytes of the auth key, hex encoded. ECB is a protocol
//! requirement here — substituting another mode produces bodies the server
//! cannot read.

use std::collections::BTreeMap;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use md5::{Digest, Md5};
use serde::Serialize;

use crate::errors::{ActivationError, ActivationResult};

type Aes128EcbEnc = ecb::Encryptor<aes::Aes128>;
type Aes128EcbDec = ecb::Decryptor<aes::Aes128>;

/// Build the signed query string from a parameter map.
///
/// Parameters are serialized as `key=value` pairs joined with `&`, in
/// strictly lexicographic key order (the `BTreeMap` guarantees it — the
/// signature is computed over the sorted rendering and the server re-sorts
/// the same way). The signature input replaces `&` with `||` and appends
/// `||<authKey>`; the lowercase-hex MD5 of that input is appended as
/// `&sign=<signature>`.
pub fn sign_query(params: &BTreeMap<String, String>, auth_key: &str) -> String {
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut signature_input = query.replace('&', "||");
    signature_input.push_str("||");
    signature_input.push_str(auth_key);

    let signature = hex::encode(Md5::digest(signature_input.as_bytes()));
    format!("{query}&sign={signature}")
}

/// First 16 bytes of the auth key, used as the AES-128 key.
fn body_key(auth_key: &str) -> ActivationResult<&[u8]> {
    let bytes = auth_key.as_bytes();
    if bytes.len() < 16 {
        return Err(ActivationError::InvalidCredentials(format!(
            "auth key too short for AES key material: {} bytes",
            bytes.len()
        )));
    }
    Ok(&bytes[..16])
}

/// Serialize and encrypt a request body.
///
/// The body is rendered as compact JSON (no inserted whitespace), PKCS#7
/// padded to the 16-byte block size, AES-128-ECB encrypted, and wrapped as
/// the literal form string `data=<HEX>` with uppercase hex.
pub fn encrypt_body<T: Serialize>(body: &T, auth_key: &str) -> ActivationResult<String> {
    let json = serde_json::to_vec(body)
        .map_err(|e| ActivationError::Decode(format!("failed to serialize body: {e}")))?;

    let cipher = Aes128EcbEnc::new_from_slice(body_key(auth_key)?)
        .map_err(|e| ActivationError::InvalidCredentials(format!("bad AES key: {e}")))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(&json);

    Ok(format!("data={}", hex::encode_upper(ciphertext)))
}

/// Decrypt a response body extracted from the envelope.
///
/// `raw` is the ciphertext after base64 decoding upstream. A padding
/// failure means a corrupt or wrong-key response and propagates as a decode
/// error rather than being swallowed.
pub fn decrypt_body(raw: &[u8], auth_key: &str) -> ActivationResult<Vec<u8>> {
    let cipher = Aes128EcbDec::new_from_slice(body_key(auth_key)?)
        .map_err(|e| ActivationError::InvalidCredentials(format!("bad AES key: {e}")))?;

    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(raw)
        .map_err(|_| ActivationError::Decode("invalid PKCS#7 padding in response body".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const AUTH_KEY: &str = "0123456789abcdef0123456789abcdef";

    fn sample_params() -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("a".to_string(), "tuya.device.active".to_string());
        params.insert("t".to_string(), "1700000000".to_string());
        params.insert("uuid".to_string(), "aaaabbbbccccdddd".to_string());
        params.insert("v".to_string(), "4.4".to_string());
        params.insert("et".to_string(), "1".to_string());
        params
    }

    #[test]
    fn signed_query_matches_known_digest() {
        let signed = sign_query(&sample_params(), AUTH_KEY);
        assert_eq!(
            signed,
            "a=tuya.device.active&et=1&t=1700000000&uuid=aaaabbbbccccdddd&v=4.4\
             &sign=4951010368cf7a7dab4c4ba678376802"
        );
    }

    #[test]
    fn signed_query_orders_keys_lexicographically() {
        let signed = sign_query(&sample_params(), AUTH_KEY);
        let query = signed.split("&sign=").next().unwrap();
        let keys: Vec<&str> = query
            .split('&')
            .map(|pair| pair.split('=').next().unwrap())
            .collect();

        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn encrypted_body_matches_known_ciphertext() {
        let body = json!({ "token": "12345678" });
        let encrypted = encrypt_body(&body, AUTH_KEY).unwrap();
        assert_eq!(
            encrypted,
            "data=42F9E5945B45FE336E9A8D6CB039A3A4D34D5FDFD4E389449930D39D93647537"
        );
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let body = json!({
            "token": "12345678",
            "productKey": "ppppqqqqrrrrssss",
            "softVer": "1.0.0",
            "options": "{\"isFK\":false}",
            "t": 1700000000u64,
        });

        let encrypted = encrypt_body(&body, AUTH_KEY).unwrap();
        let hex_part = encrypted.strip_prefix("data=").unwrap();
        let raw = hex::decode(hex_part).unwrap();

        let decrypted = decrypt_body(&raw, AUTH_KEY).unwrap();
        let round_tripped: serde_json::Value = serde_json::from_slice(&decrypted).unwrap();
        assert_eq!(round_tripped, body);
    }

    #[test]
    fn decrypt_rejects_corrupt_padding() {
        let body = json!({ "token": "12345678" });
        let encrypted = encrypt_body(&body, AUTH_KEY).unwrap();
        let mut raw = hex::decode(encrypted.strip_prefix("data=").unwrap()).unwrap();

        // Flip a bit in the final block so the padding no longer verifies.
        let last = raw.len() - 1;
        raw[last] ^= 0xff;

        let err = decrypt_body(&raw, AUTH_KEY).unwrap_err();
        assert!(matches!(err, ActivationError::Decode(_)));
    }

    #[test]
    fn ciphertext_hex_is_uppercase() {
        let body = json!({ "token": "12345678" });
        let encrypted = encrypt_body(&body, AUTH_KEY).unwrap();
        let hex_part = encrypted.strip_prefix("data=").unwrap();
        assert!(hex_part
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }
}
