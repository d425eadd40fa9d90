//! Device credentials, provisioning tokens, and pre-flight validation.

use std::fmt;

use crate::errors::{ActivationError, ActivationResult};

/// Credentials identifying one device to the activation server.
///
/// Built through [`DeviceIdentity::new`], which enforces the length
/// invariants the server silently depends on: a 16-character uuid and a
/// 32-character auth key (the auth key doubles as raw AES key material).
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    uuid: String,
    auth_key: String,
}

impl DeviceIdentity {
    /// Validate and build a device identity.
    ///
    /// When the uuid is absent or not 16 characters, a 16-character product
    /// key (if one is configured) is used in its place. This matches what
    /// devices with shared uuid/product-key material expect.
    pub fn new(
        uuid: Option<&str>,
        auth_key: Option<&str>,
        product_key: Option<&str>,
    ) -> ActivationResult<Self> {
        let uuid = match uuid {
            Some(u) if u.len() == 16 => u.to_string(),
            _ => match product_key {
                Some(pk) if pk.len() == 16 => pk.to_string(),
                _ => {
                    return Err(ActivationError::InvalidCredentials(
                        "uuid was not found or was invalid (expected 16 characters)".to_string(),
                    ))
                }
            },
        };

        let auth_key = match auth_key {
            Some(k) if k.len() == 32 => k.to_string(),
            _ => {
                return Err(ActivationError::InvalidCredentials(
                    "auth_key was not found or was invalid (expected 32 characters)".to_string(),
                ))
            }
        };

        Ok(Self { uuid, auth_key })
    }

    /// The 16-character device uuid.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The 32-character auth key.
    pub fn auth_key(&self) -> &str {
        &self.auth_key
    }
}

/// Product and/or firmware keys for the activation attempts.
///
/// At least one must be present; empty strings are treated as absent.
#[derive(Debug, Clone)]
pub struct KeySet {
    /// Product key from the firmware dump, if any
    pub product_key: Option<String>,
    /// Firmware key, if any
    pub firmware_key: Option<String>,
}

impl KeySet {
    /// Build a key set, normalizing empty strings to `None`.
    pub fn new(product_key: Option<String>, firmware_key: Option<String>) -> ActivationResult<Self> {
        let product_key = product_key.filter(|k| !k.is_empty());
        let firmware_key = firmware_key.filter(|k| !k.is_empty());

        if product_key.is_none() && firmware_key.is_none() {
            return Err(ActivationError::InvalidCredentials(
                "product_key or firmware_key was not found, at least one must be provided"
                    .to_string(),
            ));
        }

        Ok(Self {
            product_key,
            firmware_key,
        })
    }
}

/// Version strings sent in the activation body.
#[derive(Debug, Clone)]
pub struct DeviceVersions {
    /// Device software version (`softVer`)
    pub soft_ver: String,
    /// Baseline version (`baselineVer`)
    pub baseline_ver: String,
    /// CAD version (`cadVer`)
    pub cad_ver: String,
    /// CD version (`cdVer`)
    pub cd_ver: String,
    /// Protocol version (`protocolVer`)
    pub protocol_ver: String,
}

impl Default for DeviceVersions {
    fn default() -> Self {
        Self {
            soft_ver: String::new(),
            baseline_ver: "40.00".to_string(),
            cad_ver: "1.0.2".to_string(),
            cd_ver: "1.0.0".to_string(),
            protocol_ver: "2.2".to_string(),
        }
    }
}

impl DeviceVersions {
    /// Validate the minimum-length thresholds the server enforces.
    pub fn validate(&self) -> ActivationResult<()> {
        if self.soft_ver.len() < 5 {
            return Err(ActivationError::InvalidCredentials(
                "softVer was not found or was invalid (expected >= 5 characters)".to_string(),
            ));
        }
        if self.cad_ver.len() < 5 {
            return Err(ActivationError::InvalidCredentials(
                "cadVer was not found or was invalid (expected >= 5 characters)".to_string(),
            ));
        }
        if self.baseline_ver.len() < 5 {
            return Err(ActivationError::InvalidCredentials(
                "baselineVer was not found or was invalid (expected >= 5 characters)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Regional activation server, decoded from the token prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Us,
    Eu,
    Cn,
}

impl Region {
    /// Map a two-character token prefix to its region.
    pub fn from_token_prefix(prefix: &str) -> ActivationResult<Self> {
        match prefix {
            "AZ" => Ok(Region::Us),
            "EU" => Ok(Region::Eu),
            "AY" => Ok(Region::Cn),
            other => Err(ActivationError::UnknownRegion(other.to_string())),
        }
    }

    /// The region code embedded in the endpoint hostname.
    pub fn code(&self) -> &'static str {
        match self {
            Region::Us => "us",
            Region::Eu => "eu",
            Region::Cn => "cn",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A parsed provisioning token.
///
/// The raw 14-character token broadcast by the companion app is a
/// 2-character region tag, 8 significant characters, and 4 trailing
/// characters that are discarded.
#[derive(Debug, Clone)]
pub struct ProvisioningToken {
    region: Region,
    token: String,
}

impl ProvisioningToken {
    /// Parse a raw token into its region and 8-character protocol token.
    pub fn parse(raw: &str) -> ActivationResult<Self> {
        // The token alphabet is ASCII; anything else also breaks the
        // fixed byte offsets below.
        if !raw.is_ascii() {
            return Err(ActivationError::MalformedToken(format!(
                "token {raw:?} contains non-ASCII characters"
            )));
        }
        if raw.len() < 2 {
            return Err(ActivationError::MalformedToken(format!(
                "token {raw:?} is too short to carry a region tag"
            )));
        }

        let (prefix, rest) = raw.split_at(2);
        let region = Region::from_token_prefix(prefix)?;

        if rest.len() < 8 {
            return Err(ActivationError::MalformedToken(format!(
                "expected 8 token characters after the region tag, got {}",
                rest.len()
            )));
        }

        Ok(Self {
            region,
            token: rest[..8].to_string(),
        })
    }

    /// The regional server this token belongs to.
    pub fn region(&self) -> Region {
        self.region
    }

    /// The 8-character token sent in the activation body.
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_accepts_valid_credentials() {
        let id = DeviceIdentity::new(
            Some("aaaabbbbccccdddd"),
            Some("0123456789abcdef0123456789abcdef"),
            None,
        )
        .unwrap();
        assert_eq!(id.uuid(), "aaaabbbbccccdddd");
        assert_eq!(id.auth_key().len(), 32);
    }

    #[test]
    fn identity_falls_back_to_product_key() {
        let id = DeviceIdentity::new(
            None,
            Some("0123456789abcdef0123456789abcdef"),
            Some("ppppqqqqrrrrssss"),
        )
        .unwrap();
        assert_eq!(id.uuid(), "ppppqqqqrrrrssss");
    }

    #[test]
    fn identity_rejects_bad_lengths() {
        assert!(DeviceIdentity::new(Some("short"), Some("0123456789abcdef0123456789abcdef"), None)
            .is_err());
        assert!(DeviceIdentity::new(Some("aaaabbbbccccdddd"), Some("tooshort"), None).is_err());
        assert!(DeviceIdentity::new(None, None, None).is_err());
    }

    #[test]
    fn key_set_requires_at_least_one_key() {
        assert!(KeySet::new(None, None).is_err());
        assert!(KeySet::new(Some(String::new()), Some(String::new())).is_err());

        let keys = KeySet::new(Some("ppppqqqqrrrrssss".to_string()), None).unwrap();
        assert!(keys.product_key.is_some());
        assert!(keys.firmware_key.is_none());
    }

    #[test]
    fn versions_enforce_minimum_lengths() {
        let mut versions = DeviceVersions {
            soft_ver: "1.0.0".to_string(),
            ..Default::default()
        };
        assert!(versions.validate().is_ok());

        versions.soft_ver = "1.0".to_string();
        assert!(versions.validate().is_err());
    }

    #[test]
    fn region_decodes_known_prefixes() {
        assert_eq!(Region::from_token_prefix("AZ").unwrap(), Region::Us);
        assert_eq!(Region::from_token_prefix("EU").unwrap(), Region::Eu);
        assert_eq!(Region::from_token_prefix("AY").unwrap(), Region::Cn);
        assert!(Region::from_token_prefix("ZZ").is_err());
    }

    #[test]
    fn token_parse_strips_region_and_trailing_characters() {
        let token = ProvisioningToken::parse("AZ12345678ABCD").unwrap();
        assert_eq!(token.region(), Region::Us);
        assert_eq!(token.token(), "12345678");
    }

    #[test]
    fn token_parse_rejects_short_tokens() {
        assert!(ProvisioningToken::parse("A").is_err());
        assert!(ProvisioningToken::parse("AZ1234").is_err());
    }

    #[test]
    fn token_parse_rejects_non_ascii_tokens() {
        // Multibyte characters would straddle the fixed byte offsets; the
        // parser must report a malformed token, not panic.
        let err = ProvisioningToken::parse("AZ日本語aaaaaa").unwrap_err();
        assert!(matches!(err, ActivationError::MalformedToken(_)));

        let err = ProvisioningToken::parse("ÅZ12345678ABCD").unwrap_err();
        assert!(matches!(err, ActivationError::MalformedToken(_)));
    }
}
