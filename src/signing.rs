//! Quote Signing - HMAC-SHA256 over the canonical quote fields
//!
//! Signed message: `printquote.v1\n` followed by the canonical JSON of
//! `{"computed": .., "params": .., "quoteId": ..}` (see `hashing`).
//! Status and timestamps are not signed; locking never changes a signature.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;

use crate::config::ConfigError;
use crate::hashing::canonical_json;
use crate::quote::{Quote, QuoteComputed, QuoteId, QuoteParams};

type HmacSha256 = Hmac<Sha256>;

const DOMAIN: &str = "printquote.v1\n";
const MIN_KEY_BYTES: usize = 16;
pub const SIGNATURE_HEX_LEN: usize = 64;

/// Server-held secret. Never serialized, never printed.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, ConfigError> {
        let bytes = bytes.into();
        if bytes.len() < MIN_KEY_BYTES {
            return Err(ConfigError::Secret(format!(
                "must be at least {MIN_KEY_BYTES} bytes"
            )));
        }
        Ok(Self(bytes))
    }

    /// Plain text secret, or `base64:<data>` for binary keys.
    pub fn from_secret(raw: &str) -> Result<Self, ConfigError> {
        match raw.strip_prefix("base64:") {
            Some(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| ConfigError::Secret(format!("invalid base64: {e}")))?;
                Self::new(bytes)
            }
            None => Self::new(raw.as_bytes()),
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedFields<'a> {
    quote_id: &'a QuoteId,
    params: &'a QuoteParams,
    computed: &'a QuoteComputed,
}

/// Exact bytes fed to the MAC.
pub fn signing_payload(
    quote_id: &QuoteId,
    params: &QuoteParams,
    computed: &QuoteComputed,
) -> Result<String, serde_json::Error> {
    let fields = SignedFields { quote_id, params, computed };
    Ok(format!("{DOMAIN}{}", canonical_json(&fields)?))
}

#[derive(Debug, Clone)]
pub struct QuoteSigner {
    key: SigningKey,
}

impl QuoteSigner {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn sign(
        &self,
        quote_id: &QuoteId,
        params: &QuoteParams,
        computed: &QuoteComputed,
    ) -> Result<String, serde_json::Error> {
        let payload = signing_payload(quote_id, params, computed)?;
        Ok(hex::encode(self.mac(payload.as_bytes())))
    }

    /// Recomputes the signature for `quote` and compares it, as text, in
    /// constant time. Only the exact lowercase hex string verifies.
    pub fn verify(&self, quote: &Quote, signature: &str) -> Result<bool, serde_json::Error> {
        let payload = signing_payload(&quote.quote_id, &quote.params, &quote.computed)?;
        let expected = hex::encode(self.mac(payload.as_bytes()));
        if signature.len() != expected.len() {
            return Ok(false);
        }
        Ok(expected.as_bytes().ct_eq(signature.as_bytes()).into())
    }

    fn mac(&self, payload: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key.0)
            .unwrap_or_else(|_| unreachable!("HMAC key length is unrestricted"));
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Signatures are exactly 64 lowercase-or-uppercase hex characters.
pub fn is_well_formed(signature: &str) -> bool {
    signature.len() == SIGNATURE_HEX_LEN && signature.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::PrintMetrics;
    use crate::pricing::PriceBreakdown;
    use crate::quote::QuoteStatus;
    use chrono::Utc;

    pub(crate) fn test_signer() -> QuoteSigner {
        QuoteSigner::new(SigningKey::new("unit-test-secret-0123456789").unwrap())
    }

    pub(crate) fn sample_quote(signer: &QuoteSigner) -> Quote {
        let quote_id = QuoteId::parse("q_0123456789abcdef0123456789abcdef").unwrap();
        let params = QuoteParams {
            material: "pla".into(),
            quality: "standard".into(),
            printer: "prusa_mk3s".into(),
            quantity: 1,
            infill_percent: 20,
            supports: false,
            post_processing: vec![],
        };
        let computed = QuoteComputed {
            metrics: PrintMetrics {
                filament_length_mm: 16800.42,
                filament_weight_g: 50.0,
                print_time_s: 3600,
                slicer_version: Some("2.7.1".into()),
            },
            pricing: PriceBreakdown {
                quantity: 1,
                base_cost: 150.0,
                material_cost: 40.0,
                electricity_cost: 7.0,
                depreciation_cost: 50.0,
                other_costs: 0.0,
                subtotal: 247.0,
                markup_multiplier: 1.0,
                markup: 0.0,
                post_processing_cost: 0.0,
                tax_rate: 0.18,
                tax: 44.46,
                total: 291.46,
                currency: "INR".into(),
                currency_symbol: "₹".into(),
            },
        };
        let signature = signer.sign(&quote_id, &params, &computed).unwrap();
        Quote {
            quote_id,
            params,
            computed,
            status: QuoteStatus::Draft,
            signature,
            created_at: Utc::now(),
            model: "part.stl".into(),
            profile_fingerprint: "f".repeat(64),
            config_version: "0".repeat(16),
            core_version: crate::ENGINE_VERSION.into(),
        }
    }

    #[test]
    fn test_canonical_payload_is_exact() {
        let quote = sample_quote(&test_signer());
        let payload = signing_payload(&quote.quote_id, &quote.params, &quote.computed).unwrap();
        let expected = concat!(
            "printquote.v1\n",
            r#"{"computed":{"metrics":{"filamentLengthMm":16800.42,"filamentWeightG":50,"printTimeS":3600,"slicerVersion":"2.7.1"},"#,
            r#""pricing":{"baseCost":150,"currency":"INR","currencySymbol":"₹","depreciationCost":50,"electricityCost":7,"#,
            r#""markup":0,"markupMultiplier":1,"materialCost":40,"otherCosts":0,"postProcessingCost":0,"quantity":1,"subtotal":247,"#,
            r#""tax":44.46,"taxRate":0.18,"total":291.46}},"#,
            r#""params":{"infillPercent":20,"material":"pla","postProcessing":[],"printer":"prusa_mk3s","quality":"standard","quantity":1,"supports":false},"#,
            r#""quoteId":"q_0123456789abcdef0123456789abcdef"}"#,
        );
        assert_eq!(payload, expected);
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = test_signer();
        let quote = sample_quote(&signer);
        assert_eq!(quote.signature.len(), SIGNATURE_HEX_LEN);
        assert!(is_well_formed(&quote.signature));
        assert!(signer.verify(&quote, &quote.signature).unwrap());
    }

    #[test]
    fn test_status_is_not_signed() {
        let signer = test_signer();
        let mut quote = sample_quote(&signer);
        quote.status = QuoteStatus::Locked { locked_at: Utc::now() };
        assert!(signer.verify(&quote, &quote.signature).unwrap());
    }

    #[test]
    fn test_tampering_is_detected() {
        let signer = test_signer();
        let original = sample_quote(&signer);

        let mut quote = original.clone();
        quote.computed.pricing.total = 1.0;
        assert!(!signer.verify(&quote, &original.signature).unwrap());

        let mut quote = original.clone();
        quote.params.quantity = 2;
        assert!(!signer.verify(&quote, &original.signature).unwrap());

        let mut altered = original.signature.clone();
        let last = if altered.ends_with('0') { "1" } else { "0" };
        altered.replace_range(63.., last);
        assert!(!signer.verify(&original, &altered).unwrap());
        assert!(!signer.verify(&original, "not-hex").unwrap());
        assert!(!signer.verify(&original, "").unwrap());
        assert!(!signer.verify(&original, &original.signature.to_ascii_uppercase()).unwrap());
    }

    #[test]
    fn test_key_matters() {
        let quote = sample_quote(&test_signer());
        let other = QuoteSigner::new(SigningKey::new("another-secret-abcdefghij").unwrap());
        assert!(!other.verify(&quote, &quote.signature).unwrap());
    }

    #[test]
    fn test_semantically_identical_numbers_sign_identically() {
        let signer = test_signer();
        let quote = sample_quote(&signer);
        let mut drifted = quote.clone();
        drifted.computed.pricing.material_cost = 40.000000001;
        assert!(signer.verify(&drifted, &quote.signature).unwrap());
    }

    #[test]
    fn test_key_parsing() {
        assert!(SigningKey::from_secret("short").is_err());
        assert!(SigningKey::from_secret("base64:AAAAAAAAAAAAAAAAAAAAAA==").is_ok());
        assert!(SigningKey::from_secret("base64:!!!").is_err());
        let key = SigningKey::from_secret("a-long-enough-plain-secret").unwrap();
        assert_eq!(format!("{key:?}"), "SigningKey(<redacted>)");
    }
}
