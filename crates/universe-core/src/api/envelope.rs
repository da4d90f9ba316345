//! Two-layer request/response envelope.
//!
//! Outbound payloads are signed as an HS256 token, prefixed with a UTF-8 BOM,
//! then encrypted as a compact JWE (`A256KW` key wrap, `A256CBC-HS512`
//! content encryption, raw DEFLATE compression). Responses come back as the
//! same kind of JWE wrapping a plain JSON body with a `data` field.

use std::fmt;
use std::io::{Read, Write};

use aes::Aes256;
use aes_kw::KekAes256;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use jsonwebtoken::{crypto, Algorithm, EncodingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha512;
use thiserror::Error;

use crate::auth::Identity;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha512 = Hmac<Sha512>;

pub const KEY_LEN: usize = 32;

/// The remote envelope parser expects the inner token to start with a BOM.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

const ALG_KEY_WRAP: &str = "A256KW";
const ENC_CBC_HS512: &str = "A256CBC-HS512";
const ZIP_DEFLATE: &str = "DEF";
const TYP_JWT: &str = "JWT";
const ALG_HS256: &str = "HS256";

/// A256CBC-HS512 content key: 32 bytes MAC key followed by 32 bytes AES key.
const CEK_LEN: usize = 64;
const WRAPPED_CEK_LEN: usize = CEK_LEN + 8;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;

/// Upper bound on inflated plaintext.
const MAX_PLAINTEXT_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Symmetric key must be {KEY_LEN} bytes, got {0}")]
    InvalidKey(usize),

    #[error("Failed to build envelope: {0}")]
    Encode(String),

    #[error("Decryption failed")]
    DecryptionFailed { envelope: String },

    #[error("Abnormal API response")]
    MalformedResponse { plaintext: String },
}

impl EnvelopeError {
    fn decryption(envelope: &str) -> Self {
        EnvelopeError::DecryptionFailed {
            envelope: envelope.to_string(),
        }
    }
}

/// Shared secret used both to sign the inner token and to wrap content keys.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| EnvelopeError::InvalidKey(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for SymmetricKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub alg: String,
    pub enc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

impl EnvelopeHeader {
    fn outbound() -> Self {
        Self {
            alg: ALG_KEY_WRAP.to_string(),
            enc: ENC_CBC_HS512.to_string(),
            zip: Some(ZIP_DEFLATE.to_string()),
            typ: Some(TYP_JWT.to_string()),
        }
    }
}

#[derive(Serialize)]
struct TokenHeader<'a> {
    alg: &'a str,
    typ: &'a str,
}

/// A compact JWE, kept in its encoded segments.
#[derive(Debug, Clone)]
pub struct EncryptedEnvelope {
    pub header: EnvelopeHeader,
    encoded_header: String,
    encrypted_key: Vec<u8>,
    iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    tag: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Compact serialization: five base64url segments joined by dots.
    pub fn serialize(&self) -> String {
        [
            self.encoded_header.clone(),
            URL_SAFE_NO_PAD.encode(&self.encrypted_key),
            URL_SAFE_NO_PAD.encode(self.iv),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
            URL_SAFE_NO_PAD.encode(&self.tag),
        ]
        .join(".")
    }

    fn parse(text: &str) -> Option<Self> {
        let parts: Vec<&str> = text.trim().split('.').collect();
        if parts.len() != 5 {
            return None;
        }
        let header_bytes = URL_SAFE_NO_PAD.decode(parts[0]).ok()?;
        let header: EnvelopeHeader = serde_json::from_slice(&header_bytes).ok()?;
        let iv: [u8; IV_LEN] = URL_SAFE_NO_PAD.decode(parts[2]).ok()?.try_into().ok()?;

        Some(Self {
            header,
            encoded_header: parts[0].to_string(),
            encrypted_key: URL_SAFE_NO_PAD.decode(parts[1]).ok()?,
            iv,
            ciphertext: URL_SAFE_NO_PAD.decode(parts[3]).ok()?,
            tag: URL_SAFE_NO_PAD.decode(parts[4]).ok()?,
        })
    }
}

/// Decrypted response body.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseBody {
    pub code: Option<i64>,
    pub message: Option<String>,
    pub data: Option<Value>,
    pub plaintext: String,
}

impl ResponseBody {
    pub fn into_data(self) -> Result<Value, EnvelopeError> {
        self.data.ok_or(EnvelopeError::MalformedResponse {
            plaintext: self.plaintext,
        })
    }
}

#[derive(Clone, Debug)]
pub struct EnvelopeCodec {
    key: SymmetricKey,
}

impl EnvelopeCodec {
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    /// Wrap `payload` for the wire. Identity fields go in first so that
    /// caller-supplied keys override them.
    pub fn encode(
        &self,
        payload: &Map<String, Value>,
        identity: &Identity,
    ) -> Result<EncryptedEnvelope, EnvelopeError> {
        let mut claims = Map::new();
        claims.insert("account_no".to_string(), Value::from(identity.account_id));
        claims.insert(
            "np_game_account_id".to_string(),
            Value::from(identity.game_account_id.clone()),
        );
        for (k, v) in payload {
            claims.insert(k.clone(), v.clone());
        }

        let token = self.sign_token(&claims)?;

        let mut plaintext = Vec::with_capacity(UTF8_BOM.len() + token.len());
        plaintext.extend_from_slice(UTF8_BOM);
        plaintext.extend_from_slice(token.as_bytes());

        self.seal(&plaintext)
    }

    /// Decrypt a response envelope and return its `data` field.
    pub fn decode(&self, text: &str) -> Result<Value, EnvelopeError> {
        self.open(text)?.into_data()
    }

    /// Decrypt a response envelope and parse the JSON body.
    pub fn open(&self, text: &str) -> Result<ResponseBody, EnvelopeError> {
        let bytes = self.unseal(text)?;
        let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);
        let plaintext = String::from_utf8_lossy(body).into_owned();

        let object = match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => map,
            _ => return Err(EnvelopeError::MalformedResponse { plaintext }),
        };

        Ok(ResponseBody {
            code: object.get("code").and_then(Value::as_i64),
            message: object
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            data: object.get("data").cloned(),
            plaintext,
        })
    }

    /// HS256 compact token over `claims`. The header is written `alg` first,
    /// which is the byte layout the service's own signer produces, so only the
    /// signature is delegated to `jsonwebtoken`.
    pub fn sign_token(&self, claims: &Map<String, Value>) -> Result<String, EnvelopeError> {
        let header = serde_json::to_vec(&TokenHeader {
            alg: ALG_HS256,
            typ: TYP_JWT,
        })
        .map_err(|e| EnvelopeError::Encode(e.to_string()))?;
        let payload =
            serde_json::to_vec(claims).map_err(|e| EnvelopeError::Encode(e.to_string()))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = crypto::sign(
            signing_input.as_bytes(),
            &EncodingKey::from_secret(self.key.as_bytes()),
            Algorithm::HS256,
        )
        .map_err(|e| EnvelopeError::Encode(e.to_string()))?;

        Ok(format!("{}.{}", signing_input, signature))
    }

    /// Encrypt raw plaintext into a fresh envelope with a random CEK and IV.
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, EnvelopeError> {
        let mut rng = rand::thread_rng();
        let mut cek = [0u8; CEK_LEN];
        rng.fill_bytes(&mut cek);
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut iv);

        let header = EnvelopeHeader::outbound();
        let encoded_header = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&header).map_err(|e| EnvelopeError::Encode(e.to_string()))?,
        );

        let mut encrypted_key = [0u8; WRAPPED_CEK_LEN];
        KekAes256::from(*self.key.as_bytes())
            .wrap(&cek, &mut encrypted_key)
            .map_err(|e| EnvelopeError::Encode(format!("key wrap: {}", e)))?;

        let compressed = deflate(plaintext)?;
        let (mac_key, enc_key) = cek.split_at(CEK_LEN / 2);
        let ciphertext = Aes256CbcEnc::new_from_slices(enc_key, &iv)
            .map_err(|e| EnvelopeError::Encode(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(&compressed);

        let tag = content_tag(mac_key, &encoded_header, &iv, &ciphertext)
            .map_err(EnvelopeError::Encode)?;

        Ok(EncryptedEnvelope {
            header,
            encoded_header,
            encrypted_key: encrypted_key.to_vec(),
            iv,
            ciphertext,
            tag,
        })
    }

    /// Authenticated decryption of a compact envelope. Every failure is
    /// reported as `DecryptionFailed` carrying the envelope text.
    pub fn unseal(&self, text: &str) -> Result<Vec<u8>, EnvelopeError> {
        let fail = || EnvelopeError::decryption(text);

        let envelope = EncryptedEnvelope::parse(text).ok_or_else(fail)?;
        if envelope.header.alg != ALG_KEY_WRAP || envelope.header.enc != ENC_CBC_HS512 {
            return Err(fail());
        }
        if envelope.encrypted_key.len() != WRAPPED_CEK_LEN || envelope.tag.len() != TAG_LEN {
            return Err(fail());
        }

        let mut cek = [0u8; CEK_LEN];
        KekAes256::from(*self.key.as_bytes())
            .unwrap(&envelope.encrypted_key, &mut cek)
            .map_err(|_| fail())?;
        let (mac_key, enc_key) = cek.split_at(CEK_LEN / 2);

        let mut mac = HmacSha512::new_from_slice(mac_key).map_err(|_| fail())?;
        feed_mac(
            &mut mac,
            &envelope.encoded_header,
            &envelope.iv,
            &envelope.ciphertext,
        );
        mac.verify_truncated_left(&envelope.tag)
            .map_err(|_| fail())?;

        let compressed = Aes256CbcDec::new_from_slices(enc_key, &envelope.iv)
            .map_err(|_| fail())?
            .decrypt_padded_vec_mut::<Pkcs7>(&envelope.ciphertext)
            .map_err(|_| fail())?;

        match envelope.header.zip.as_deref() {
            None => Ok(compressed),
            Some(ZIP_DEFLATE) => inflate(&compressed, MAX_PLAINTEXT_BYTES).ok_or_else(fail),
            Some(_) => Err(fail()),
        }
    }
}

fn feed_mac(mac: &mut HmacSha512, aad: &str, iv: &[u8], ciphertext: &[u8]) {
    let aad_bits = (aad.len() as u64) * 8;
    mac.update(aad.as_bytes());
    mac.update(iv);
    mac.update(ciphertext);
    mac.update(&aad_bits.to_be_bytes());
}

fn content_tag(mac_key: &[u8], aad: &str, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, String> {
    let mut mac = HmacSha512::new_from_slice(mac_key).map_err(|e| e.to_string())?;
    feed_mac(&mut mac, aad, iv, ciphertext);
    Ok(mac.finalize().into_bytes()[..TAG_LEN].to_vec())
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| EnvelopeError::Encode(format!("deflate: {}", e)))
}

/// Inflate at most `limit` bytes. Anything larger is rejected rather than
/// cut short.
fn inflate(data: &[u8], limit: u64) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .take(limit + 1)
        .read_to_end(&mut out)
        .ok()?;
    if out.len() as u64 > limit {
        return None;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        fixture_key, REFERENCE_NO_DATA, REFERENCE_REQUEST, REFERENCE_RESPONSE, REFERENCE_TOKEN,
    };

    fn codec() -> EnvelopeCodec {
        EnvelopeCodec::new(fixture_key())
    }

    fn identity() -> Identity {
        Identity {
            account_id: 1234,
            game_account_id: "abc".to_string(),
        }
    }

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("payload must be an object"),
        }
    }

    #[test]
    fn test_key_length_is_enforced() {
        assert_eq!(SymmetricKey::from_slice(&[0u8; 16]), Err(EnvelopeError::InvalidKey(16)));
        assert!(SymmetricKey::from_slice(&[7u8; 32]).is_ok());
        assert_eq!(format!("{:?}", fixture_key()), "SymmetricKey(..)");
    }

    #[test]
    fn test_decode_reference_response() {
        let data = codec().decode(REFERENCE_RESPONSE).expect("reference envelope");
        assert_eq!(data, serde_json::json!({"planet_id": 34, "name": "home"}));

        let body = codec().open(REFERENCE_RESPONSE).unwrap();
        assert_eq!(body.code, Some(0));
    }

    #[test]
    fn test_reference_request_carries_bom_and_token() {
        let plaintext = codec().unseal(REFERENCE_REQUEST).unwrap();
        assert!(plaintext.starts_with(UTF8_BOM));
        assert_eq!(&plaintext[UTF8_BOM.len()..], REFERENCE_TOKEN.as_bytes());
    }

    #[test]
    fn test_inner_token_matches_reference_signer() {
        let mut claims = Map::new();
        claims.insert("account_no".into(), Value::from(1234));
        claims.insert("np_game_account_id".into(), Value::from("abc"));
        claims.insert("planet_id".into(), Value::from(34));

        assert_eq!(codec().sign_token(&claims).unwrap(), REFERENCE_TOKEN);
    }

    #[test]
    fn test_missing_data_is_malformed_not_decryption_failure() {
        match codec().decode(REFERENCE_NO_DATA) {
            Err(EnvelopeError::MalformedResponse { plaintext }) => {
                assert_eq!(plaintext, r#"{"code":0,"message":"ok"}"#);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_key_fails_decryption() {
        let other = EnvelopeCodec::new(SymmetricKey::from([9u8; KEY_LEN]));
        match other.decode(REFERENCE_RESPONSE) {
            Err(EnvelopeError::DecryptionFailed { envelope }) => {
                assert_eq!(envelope, REFERENCE_RESPONSE);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_tampered_envelope_fails_decryption() {
        let mut segments: Vec<String> = REFERENCE_RESPONSE.split('.').map(str::to_string).collect();
        let mut ciphertext = URL_SAFE_NO_PAD.decode(&segments[3]).unwrap();
        ciphertext[0] ^= 0x01;
        segments[3] = URL_SAFE_NO_PAD.encode(ciphertext);
        let tampered = segments.join(".");

        assert!(matches!(
            codec().decode(&tampered),
            Err(EnvelopeError::DecryptionFailed { .. })
        ));
        assert!(matches!(
            codec().decode("not.an.envelope"),
            Err(EnvelopeError::DecryptionFailed { .. })
        ));
        assert!(matches!(
            codec().decode("plain text body"),
            Err(EnvelopeError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn test_encode_merges_identity_under_caller_fields() {
        let codec = codec();
        let envelope = codec
            .encode(&payload(serde_json::json!({"planet_id": 34, "account_no": 99})), &identity())
            .unwrap();

        assert_eq!(envelope.header, EnvelopeHeader::outbound());
        let compact = envelope.serialize();
        assert_eq!(compact.split('.').count(), 5);

        let plaintext = codec.unseal(&compact).unwrap();
        let token = std::str::from_utf8(plaintext.strip_prefix(UTF8_BOM).unwrap()).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let claims_json = URL_SAFE_NO_PAD.decode(parts[1]).unwrap();
        let claims: Value = serde_json::from_slice(&claims_json).unwrap();
        assert_eq!(
            claims,
            serde_json::json!({"account_no": 99, "np_game_account_id": "abc", "planet_id": 34})
        );

        let signed = format!("{}.{}", parts[0], parts[1]);
        let verified = jsonwebtoken::crypto::verify(
            parts[2],
            signed.as_bytes(),
            &jsonwebtoken::DecodingKey::from_secret(fixture_key().as_bytes()),
            Algorithm::HS256,
        )
        .unwrap();
        assert!(verified);
    }

    #[test]
    fn test_claims_keep_merge_order() {
        let codec = codec();
        let compact = codec
            .encode(&payload(serde_json::json!({"zeta": 1, "alpha": 2})), &identity())
            .unwrap()
            .serialize();

        let plaintext = codec.unseal(&compact).unwrap();
        let token = std::str::from_utf8(&plaintext[UTF8_BOM.len()..]).unwrap();
        let claims = URL_SAFE_NO_PAD
            .decode(token.split('.').nth(1).unwrap())
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&claims).unwrap(),
            r#"{"account_no":1234,"np_game_account_id":"abc","zeta":1,"alpha":2}"#
        );
    }

    #[test]
    fn test_inflate_rejects_oversized_plaintext() {
        let compressed = deflate(&[b'a'; 100]).unwrap();
        assert_eq!(inflate(&compressed, 100).map(|v| v.len()), Some(100));
        assert_eq!(inflate(&compressed, 99), None);
    }

    #[test]
    fn test_each_envelope_uses_fresh_key_material() {
        let codec = codec();
        let a = codec.encode(&Map::new(), &identity()).unwrap().serialize();
        let b = codec.encode(&Map::new(), &identity()).unwrap().serialize();
        assert_ne!(a, b);
    }

    #[test]
    fn test_bom_prefixed_response_is_accepted() {
        let codec = codec();
        let mut body = UTF8_BOM.to_vec();
        body.extend_from_slice(br#"{"data":[1,2]}"#);
        let sealed = codec.seal(&body).unwrap().serialize();
        assert_eq!(codec.decode(&sealed).unwrap(), serde_json::json!([1, 2]));
    }
}
