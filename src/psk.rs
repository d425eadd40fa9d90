//! PSK identity derivation for the activation TLS handshake.
//!
//! The server negotiates `PSK-AES128-CBC-SHA256` and supplies an identity
//! hint during the handshake. From that hint and the device credentials we
//! derive the `(secret, identity)` pair that completes key agreement. Two
//! mutually exclusive lineages exist:
//!
//! - **v1** — no secret is known yet. The secret is minted by AES-128-CBC
//!   encrypting part of a freshly built identity under a key taken from the
//!   hint.
//! - **v2** — a secret is already held (carried over from a previous
//!   handshake or supplied out of band). Only a fresh identity is built.
//!
//! Both identities travel through a NUL-terminated-string channel inside the
//! TLS stack, so every `0x00` byte is replaced with ASCII `'?'` before use.
//!
//! These routines run synchronously inside the handshake callback: no I/O,
//! no blocking, only byte manipulation plus one draw from the OS RNG.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::Sha256;

use crate::errors::{ActivationError, ActivationResult};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// Version tag prepended to a v1 identity before NUL substitution.
const V1_TAG: u8 = 0x01;
/// Version tag prepended to a v2 identity before NUL substitution.
const V2_TAG: u8 = 0x02;

/// A derived `(secret, identity)` pair ready for the PSK callback.
///
/// `identity` is the NUL-substituted buffer *without* the leading version
/// tag, exactly as the server expects it on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskIdentity {
    /// Pre-shared secret completing key agreement.
    pub secret: Vec<u8>,
    /// Identity bytes presented to the server. Contains no `0x00` byte.
    pub identity: Vec<u8>,
}

/// Whether a PSK secret is already held for this session.
///
/// The secret is derived at most once: the first v1 handshake moves the
/// state from `Underived` to `Derived`, and every later connection in the
/// same session reuses the stored secret through the v2 lineage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PskState {
    /// No secret yet; the next handshake uses the v1 derivation.
    Underived,
    /// A secret is held; subsequent handshakes use the v2 derivation.
    Derived(Vec<u8>),
}

impl PskState {
    /// Build the initial state, honoring an out-of-band secret if present.
    pub fn from_optional_secret(secret: Option<Vec<u8>>) -> Self {
        match secret {
            Some(s) if !s.is_empty() => PskState::Derived(s),
            _ => PskState::Underived,
        }
    }
}

/// Draw 16 random bytes for the identity nonce.
fn random_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    let mut rng = OsRng;

    // If OsRng fails here, the environment is badly broken → hard panic is acceptable.
    rng.try_fill_bytes(&mut nonce)
        .expect("OsRng failed to generate PSK nonce");

    nonce
}

/// Replace every NUL byte with ASCII `'?'`.
fn substitute_nuls(buf: &mut [u8]) {
    for b in buf.iter_mut() {
        if *b == 0 {
            *b = b'?';
        }
    }
}

/// v1 derivation with a random nonce. See [`derive_v1_with_nonce`].
pub fn derive_v1(uuid: &str, auth_key: &str, hint: &[u8]) -> ActivationResult<PskIdentity> {
    derive_v1_with_nonce(uuid, auth_key, hint, &random_nonce())
}

/// v1 derivation: mint a fresh secret from the server hint.
///
/// Builds `initId = 0x01 ‖ nonce ‖ MD5(uuid) ‖ '_' ‖ MD5(authKey)` (50
/// bytes), NUL-substitutes it, then encrypts `initId[1..33]` with
/// AES-128-CBC under `key = MD5(hint[last 16])`, `iv = MD5(initId[1..])`.
/// The ciphertext is the secret; `initId[1..]` is the identity.
///
/// A hint shorter than 16 bytes is a malformed handshake and fails the
/// connection attempt.
pub fn derive_v1_with_nonce(
    uuid: &str,
    auth_key: &str,
    hint: &[u8],
    nonce: &[u8; 16],
) -> ActivationResult<PskIdentity> {
    if hint.len() < 16 {
        return Err(ActivationError::HintTooShort(hint.len()));
    }

    let auth_hash = Md5::digest(auth_key.as_bytes());
    let uuid_hash = Md5::digest(uuid.as_bytes());

    // 1 + 16 + 16 + 1 + 16 = 50 bytes
    let mut init_id = Vec::with_capacity(50);
    init_id.push(V1_TAG);
    init_id.extend_from_slice(nonce);
    init_id.extend_from_slice(&uuid_hash);
    init_id.push(b'_');
    init_id.extend_from_slice(&auth_hash);
    substitute_nuls(&mut init_id);

    let iv = Md5::digest(&init_id[1..]);
    let key = Md5::digest(&hint[hint.len() - 16..]);

    // Encrypt the 32 bytes after the version tag, exactly two blocks, no padding.
    let mut blocks = [0u8; 32];
    blocks.copy_from_slice(&init_id[1..33]);
    let mut cipher = Aes128CbcEnc::new(&key, &iv);
    for chunk in blocks.chunks_exact_mut(16) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
    }

    Ok(PskIdentity {
        secret: blocks.to_vec(),
        identity: init_id[1..].to_vec(),
    })
}

/// v2 derivation with a random nonce. See [`derive_v2_with_nonce`].
pub fn derive_v2(uuid: &str, secret: &[u8]) -> PskIdentity {
    derive_v2_with_nonce(uuid, secret, &random_nonce())
}

/// v2 derivation: reuse an existing secret, build only a fresh identity.
///
/// `initId = 0x02 ‖ nonce ‖ SHA-256(uuid)`, NUL-substituted, with the
/// version tag stripped for the wire. The held secret is never mutated.
pub fn derive_v2_with_nonce(uuid: &str, secret: &[u8], nonce: &[u8; 16]) -> PskIdentity {
    let uuid_hash = Sha256::digest(uuid.as_bytes());

    let mut init_id = Vec::with_capacity(49);
    init_id.push(V2_TAG);
    init_id.extend_from_slice(nonce);
    init_id.extend_from_slice(&uuid_hash);
    substitute_nuls(&mut init_id);

    PskIdentity {
        secret: secret.to_vec(),
        identity: init_id[1..].to_vec(),
    }
}

/// Derive the handshake pair for the current state, returning the updated
/// state alongside the pair.
///
/// `Underived` runs v1 and transitions to `Derived`; `Derived` runs v2 and
/// stays put. The returned state replaces the caller's copy, so the secret
/// is written at most once per session.
pub fn derive_for_state(
    state: &PskState,
    uuid: &str,
    auth_key: &str,
    hint: &[u8],
) -> ActivationResult<(PskIdentity, PskState)> {
    match state {
        PskState::Underived => {
            let derived = derive_v1(uuid, auth_key, hint)?;
            let next = PskState::Derived(derived.secret.clone());
            Ok((derived, next))
        }
        PskState::Derived(secret) => {
            let derived = derive_v2(uuid, secret);
            Ok((derived, state.clone()))
        }
    }
}
