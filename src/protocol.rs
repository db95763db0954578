//! License protocol message definitions.
//!
//! Every wire and at-rest message is a prost message. The envelope for all
//! exchanges is [`SignedMessage`]; persisted records use [`HashedFile`] and
//! [`StoredFile`].

use prost::Message;

use crate::error::{Error, Result};

/// Fixed trailer length appended to every key field on the wire. The protocol
/// layer strips it before key material reaches the secure engine.
pub const KEY_PADDING_LEN: usize = 8;

/// Envelope message type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    LicenseRequest = 1,
    License = 2,
    ErrorResponse = 3,
    ServiceCertificateRequest = 4,
    ServiceCertificate = 5,
}

/// License type carried on requests and identifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LicenseType {
    Streaming = 1,
    Offline = 2,
    Release = 3,
}

impl LicenseType {
    pub fn as_str(self) -> &'static str {
        match self {
            LicenseType::Streaming => "STREAMING",
            LicenseType::Offline => "OFFLINE",
            LicenseType::Release => "RELEASE",
        }
    }
}

/// Request type on a license request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RequestType {
    New = 1,
    Renewal = 2,
    Release = 3,
}

/// Key container type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum KeyType {
    Signing = 1,
    Content = 2,
    KeyControl = 3,
    OperatorSession = 4,
}

/// Certificate type inside a [`DrmCertificate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CertificateType {
    Root = 0,
    DeviceModel = 1,
    Device = 2,
    Service = 3,
    Provisioner = 4,
}

/// Server error codes carried on an ERROR envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    InvalidDeviceCertificate = 1,
    RevokedDeviceCertificate = 2,
    ServiceUnavailable = 3,
}

/// Signed envelope wrapping every protocol exchange.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedMessage {
    #[prost(enumeration = "MessageType", optional, tag = "1")]
    pub message_type: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub msg: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub signature: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub session_key: Option<Vec<u8>>,
}

impl SignedMessage {
    /// Decode and check the envelope type in one step.
    pub fn decode_expecting(data: &[u8], expected: MessageType) -> Result<Self> {
        let signed = SignedMessage::decode(data)
            .map_err(|e| Error::KeyError(format!("Failed to parse SignedMessage: {}", e)))?;
        if signed.message_type != Some(expected as i32) {
            return Err(Error::KeyError(format!(
                "Expected {:?} message, got {:?}",
                expected, signed.message_type
            )));
        }
        Ok(signed)
    }
}

/// One name/value pair of client information.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NameValue {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

/// Plain client identification block.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientIdentification {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub token: Option<Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub client_info: Vec<NameValue>,
}

/// Client identification encrypted under a service certificate (privacy
/// mode).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptedClientIdentification {
    #[prost(string, optional, tag = "1")]
    pub provider_id: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub service_certificate_serial_number: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub encrypted_client_id: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub encrypted_client_id_iv: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub encrypted_privacy_key: Option<Vec<u8>>,
}

/// Content identification on a license request. Initial requests carry init
/// data; renewal and release requests carry the existing license
/// identification instead.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContentIdentification {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub init_data: Option<Vec<u8>>,
    #[prost(enumeration = "LicenseType", optional, tag = "2")]
    pub license_type: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub request_id: Option<Vec<u8>>,
    #[prost(message, optional, tag = "4")]
    pub license_id: Option<LicenseIdentification>,
}

/// Outbound license request payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LicenseRequest {
    #[prost(message, optional, tag = "1")]
    pub client_id: Option<ClientIdentification>,
    #[prost(message, optional, tag = "2")]
    pub content_id: Option<ContentIdentification>,
    #[prost(enumeration = "RequestType", optional, tag = "3")]
    pub request_type: Option<i32>,
    #[prost(int64, optional, tag = "4")]
    pub request_time: Option<i64>,
    #[prost(uint32, optional, tag = "5")]
    pub key_control_nonce: Option<u32>,
    #[prost(message, optional, tag = "6")]
    pub encrypted_client_id: Option<EncryptedClientIdentification>,
}

/// Server-assigned license identity, echoed back on renewal and release.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LicenseIdentification {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub request_id: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub session_id: Option<Vec<u8>>,
    #[prost(enumeration = "LicenseType", optional, tag = "3")]
    pub license_type: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub version: Option<i32>,
}

/// Server-granted usage policy.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LicensePolicy {
    #[prost(bool, optional, tag = "1")]
    pub can_play: Option<bool>,
    #[prost(bool, optional, tag = "2")]
    pub can_persist: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub can_renew: Option<bool>,
    #[prost(int64, optional, tag = "4")]
    pub rental_duration_seconds: Option<i64>,
    #[prost(int64, optional, tag = "5")]
    pub license_duration_seconds: Option<i64>,
    #[prost(int64, optional, tag = "6")]
    pub playback_duration_seconds: Option<i64>,
    #[prost(string, optional, tag = "7")]
    pub renewal_server_url: Option<String>,
    #[prost(int64, optional, tag = "8")]
    pub renewal_delay_seconds: Option<i64>,
    #[prost(int64, optional, tag = "9")]
    pub renewal_retry_interval_seconds: Option<i64>,
    #[prost(bool, optional, tag = "10")]
    pub renew_with_usage: Option<bool>,
}

/// Per-key control metadata, verified against the request nonce by the secure
/// engine.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyControl {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub key_control_block: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub iv: Option<Vec<u8>>,
}

/// One key entry on a license response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyContainer {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub id: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub iv: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub key: Option<Vec<u8>>,
    #[prost(enumeration = "KeyType", optional, tag = "4")]
    pub key_type: Option<i32>,
    #[prost(message, optional, tag = "5")]
    pub key_control: Option<KeyControl>,
}

/// License response payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct License {
    #[prost(message, optional, tag = "1")]
    pub id: Option<LicenseIdentification>,
    #[prost(message, optional, tag = "2")]
    pub policy: Option<LicensePolicy>,
    #[prost(message, repeated, tag = "3")]
    pub key: Vec<KeyContainer>,
    #[prost(int64, optional, tag = "4")]
    pub license_start_time: Option<i64>,
}

/// Error response payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LicenseError {
    #[prost(enumeration = "ErrorCode", optional, tag = "1")]
    pub error_code: Option<i32>,
}

/// Inner certificate body.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DrmCertificate {
    #[prost(enumeration = "CertificateType", optional, tag = "1")]
    pub certificate_type: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub serial_number: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub public_key: Option<Vec<u8>>,
    #[prost(string, optional, tag = "7")]
    pub provider_id: Option<String>,
}

/// Certificate with its issuer signature.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignedDrmCertificate {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub drm_certificate: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub signature: Option<Vec<u8>>,
}

/// Lifecycle state of a persisted license record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LicenseState {
    Unknown = 0,
    Active = 1,
    Releasing = 2,
}

/// Persisted record kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FileKind {
    DeviceCertificate = 1,
    License = 2,
}

/// One persisted license record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoredLicense {
    #[prost(enumeration = "LicenseState", optional, tag = "1")]
    pub state: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub pssh_data: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub license_request: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub license: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub renewal_request: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub renewal: Option<Vec<u8>>,
    #[prost(string, optional, tag = "7")]
    pub release_server_url: Option<String>,
}

/// Persisted device certificate and its wrapped private key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoredCertificate {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub certificate: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub wrapped_private_key: Option<Vec<u8>>,
}

/// Typed persisted payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoredFile {
    #[prost(enumeration = "FileKind", optional, tag = "1")]
    pub kind: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub version: Option<i32>,
    #[prost(message, optional, tag = "3")]
    pub license: Option<StoredLicense>,
    #[prost(message, optional, tag = "4")]
    pub certificate: Option<StoredCertificate>,
}

/// Integrity envelope around a serialized [`StoredFile`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HashedFile {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub payload: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub hash: Option<Vec<u8>>,
}

/// Strip the fixed wire trailer from a key field.
///
/// Returns the leading key material; errors when the field is shorter than
/// the trailer or the trailer bytes are not all zero.
pub fn strip_key_padding(data: &[u8]) -> Result<&[u8]> {
    if data.len() < KEY_PADDING_LEN {
        return Err(Error::KeyError(format!(
            "Key field too short for padding: {} bytes",
            data.len()
        )));
    }
    let (body, pad) = data.split_at(data.len() - KEY_PADDING_LEN);
    if pad.iter().any(|&b| b != 0) {
        return Err(Error::KeyError("Malformed key padding".to_string()));
    }
    Ok(body)
}

/// Append the fixed wire trailer to a key field.
pub fn pad_key(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + KEY_PADDING_LEN);
    out.extend_from_slice(data);
    out.extend_from_slice(&[0u8; KEY_PADDING_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_message_roundtrip() {
        let msg = SignedMessage {
            message_type: Some(MessageType::LicenseRequest as i32),
            msg: Some(b"payload".to_vec()),
            signature: Some(b"sig".to_vec()),
            session_key: None,
        };
        let bytes = msg.encode_to_vec();
        let parsed =
            SignedMessage::decode_expecting(&bytes, MessageType::LicenseRequest).expect("decode");
        assert_eq!(parsed.msg.as_deref(), Some(b"payload".as_slice()));
    }

    #[test]
    fn signed_message_wrong_type_rejected() {
        let msg = SignedMessage {
            message_type: Some(MessageType::License as i32),
            msg: None,
            signature: None,
            session_key: None,
        };
        let bytes = msg.encode_to_vec();
        let err = SignedMessage::decode_expecting(&bytes, MessageType::LicenseRequest)
            .expect_err("type mismatch");
        assert!(matches!(err, Error::KeyError(_)));
    }

    #[test]
    fn key_padding_roundtrip() {
        let padded = pad_key(b"0123456789abcdef");
        assert_eq!(padded.len(), 16 + KEY_PADDING_LEN);
        let stripped = strip_key_padding(&padded).expect("strip");
        assert_eq!(stripped, b"0123456789abcdef");
    }

    #[test]
    fn key_padding_rejects_nonzero_trailer() {
        let mut padded = pad_key(b"0123456789abcdef");
        let last = padded.len() - 1;
        padded[last] = 1;
        assert!(strip_key_padding(&padded).is_err());
    }

    #[test]
    fn key_padding_rejects_short_field() {
        assert!(strip_key_padding(b"abc").is_err());
    }
}
