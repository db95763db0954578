//! License request/response protocol logic.
//!
//! One handler instance lives inside each session. It builds signed license
//! requests (encrypting the client identity under a service certificate in
//! privacy mode), parses responses, applies granted policy, and hands
//! verified key material to the crypto session.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use base64::Engine as _;
use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use prost::Message;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::rand_core::{OsRng, RngCore};
use rsa::{Oaep, Pss, RsaPublicKey};
use sha1::{Digest as Sha1Digest, Sha1};

use crate::crypto::{CryptoSession, KeyControlData, LoadableKey};
use crate::error::{Error, Result};
use crate::policy::PolicyEngine;
use crate::protocol::{
    strip_key_padding, CertificateType, ClientIdentification, ContentIdentification,
    DrmCertificate, EncryptedClientIdentification, ErrorCode, KeyType, License, LicenseError,
    LicenseRequest, LicenseType, MessageType, NameValue, RequestType, SignedDrmCertificate,
    SignedMessage,
};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

const ROOT_SIGNED_CERT_B64: &str = concat!(
    "CpwDCAASAQAY3ZSIiwUijgMwggGKAoIBgQC0/jnDZZAD2zwRlwnoaM3yw16b8ud",
    "NI7EQ24dl39z7nzWgVwNTTPZtNX2meNuzNtI/nECplSZyf7i+Zt/FIZh4FRZoXS9",
    "GDkPLioQ5q/uwNYAivjQji6tTW3LsS7VIaVM+R1/9Cf2ndhOPD5LWTN+udqm62SI",
    "QqZ1xRdbX4RklhZxTmpfrhNfMqIiCIHAmIP1+QFAn4iWTb7w+cqD6wb0ptE2CXMG",
    "0y5xyfrDpihc+GWP8/YJIK7eyM7l97Eu6iR8nuJuISISqGJIOZfXIbBH/azbkdDT",
    "KjDOx+biOtOYS4AKYeVJeRTP/Edzrw1O6fGAaET0A+9K3qjD6T15Id1sX3HXvb9I",
    "Zbdy+f7B4j9yCYEy/5CkGXmmMOROtFCXtGbLynwGCDVZEiMg17B8RsyTgWQ035Ec",
    "86kt/lzEcgXyUikx9aBWE/6UI/Rjn5yvkRycSEbgj7FiTPKwS0ohtQT3F/hzcufj",
    "UUT4H5QNvpxLoEve1zqaWVT94tGSCUNIzX5ECAwEAARKAA1jx1k0ECXvf1+9dOwI",
    "5F/oUNnVKOGeFVxKnFO41FtU9v0KG9mkAds2T9Hyy355EzUzUrgkYU0Qy7OBhG+X",
    "aE9NVxd0ay5AeflvG6Q8in76FAv6QMcxrA4S9IsRV+vXyCM1lQVjofSnaBFiC9Td",
    "pvPNaV4QXezKHcLKwdpyywxXRESYqI3WZPrl3IjINvBoZwdVlkHZVdA8OaU1fTY8",
    "Zr9/WFjGUqJJfT7x6Mfiujq0zt+kw0IwKimyDNfiKgbL+HIisKmbF/73mF9BiC9",
    "yKRfewPlrIHkokL2yl4xyIFIPVxe9enz2FRXPia1BSV0z7kmxmdYrWDRuu8+yvUS",
    "IDXQouY5OcCwEgqKmELhfKrnPsIht5rvagcizfB0fbiIYwFHghESKIrNdUdPnzJs",
    "KlVshWTwApHQh7evuVicPumFSePGuUBRMS9nG5qxPDDJtGCHs9Mmpoyh6ckGLF7R",
    "C5HxclzpC5bc3ERvWjYhN0AqdipPpV2d7PouaAdFUGSdUCDA=="
);

static ROOT_PUBLIC_KEY: LazyLock<RsaPublicKey> = LazyLock::new(|| {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(ROOT_SIGNED_CERT_B64)
        .expect("Invalid root cert base64");
    let signed =
        SignedDrmCertificate::decode(bytes.as_slice()).expect("Invalid root SignedDrmCertificate");
    let cert_bytes = signed
        .drm_certificate
        .expect("Missing root DRM certificate");
    let cert =
        DrmCertificate::decode(cert_bytes.as_slice()).expect("Invalid root DrmCertificate");
    let public_key_bytes = cert.public_key.expect("Missing root public key");
    RsaPublicKey::from_pkcs1_der(public_key_bytes.as_slice()).expect("Invalid root public key")
});

/// Outbound key request built by the handler.
#[derive(Debug, Clone)]
pub struct KeyMessage {
    /// Serialized signed envelope to deliver to the license server.
    pub message: Vec<u8>,
    /// Server URL the message should be posted to.
    pub url: String,
    /// Envelope type (license request or service certificate request).
    pub message_type: MessageType,
}

/// Result of handling an initial key response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Keys were verified and installed.
    KeysLoaded,
    /// A service certificate was installed; the caller must re-issue the
    /// original key request.
    NeedKeyRequest,
}

/// Per-session license protocol state.
pub struct LicenseHandler {
    server_url: String,
    token: Vec<u8>,
    device_info: Vec<(String, String)>,
    privacy_mode: bool,
    service_certificate: Option<SignedDrmCertificate>,
    trusted_signer: RsaPublicKey,
    init_data: Option<Vec<u8>>,
    loaded_key_ids: HashSet<Vec<u8>>,
    /// Raw serialized request payload, retained for session-key derivation
    /// replay when restoring persisted licenses.
    last_request: Vec<u8>,
}

impl LicenseHandler {
    pub fn new(
        token: Vec<u8>,
        device_info: Vec<(String, String)>,
        privacy_mode: bool,
        server_url: String,
    ) -> Self {
        Self {
            server_url,
            token,
            device_info,
            privacy_mode,
            service_certificate: None,
            trusted_signer: ROOT_PUBLIC_KEY.clone(),
            init_data: None,
            loaded_key_ids: HashSet::new(),
            last_request: Vec::new(),
        }
    }

    /// Whether a key with this id was installed by the most recent response.
    pub fn is_key_loaded(&self, key_id: &[u8]) -> bool {
        self.loaded_key_ids.contains(key_id)
    }

    /// Serialized request payload of the most recent key request.
    pub fn last_request(&self) -> &[u8] {
        &self.last_request
    }

    /// Build a signed license request.
    ///
    /// In privacy mode without a known service certificate this returns a
    /// service-certificate request instead and caches the init data for the
    /// retry once the certificate has arrived.
    pub fn prepare_key_request(
        &mut self,
        crypto: &mut CryptoSession,
        init_data: Option<&[u8]>,
        license_type: LicenseType,
        app_params: &HashMap<String, String>,
        session_id: &str,
        now: u64,
    ) -> Result<KeyMessage> {
        if self.privacy_mode && self.service_certificate.is_none() {
            if let Some(data) = init_data {
                self.init_data = Some(data.to_vec());
            }
            log::debug!(
                "session {}: requesting service certificate before key request",
                session_id
            );
            let envelope = SignedMessage {
                message_type: Some(MessageType::ServiceCertificateRequest as i32),
                msg: Some(Vec::new()),
                signature: None,
                session_key: None,
            };
            return Ok(KeyMessage {
                message: envelope.encode_to_vec(),
                url: self.server_url.clone(),
                message_type: MessageType::ServiceCertificateRequest,
            });
        }

        let init_data = match init_data {
            Some(data) => {
                self.init_data = Some(data.to_vec());
                data.to_vec()
            }
            None => self
                .init_data
                .clone()
                .ok_or_else(|| Error::KeyError("No init data for key request".to_string()))?,
        };

        let mut client_info: Vec<NameValue> = self
            .device_info
            .iter()
            .map(|(name, value)| NameValue {
                name: Some(name.clone()),
                value: Some(value.clone()),
            })
            .collect();
        let mut params: Vec<_> = app_params.iter().collect();
        params.sort();
        for (name, value) in params {
            client_info.push(NameValue {
                name: Some(name.clone()),
                value: Some(value.clone()),
            });
        }
        let client_id = ClientIdentification {
            token: Some(self.token.clone()),
            client_info,
        };

        let (client_id, encrypted_client_id) = if self.privacy_mode {
            let certificate = self
                .service_certificate
                .as_ref()
                .ok_or_else(|| Error::Unknown("Service certificate vanished".to_string()))?;
            (None, Some(encrypt_client_id(&client_id, certificate)?))
        } else {
            (Some(client_id), None)
        };

        let request = LicenseRequest {
            client_id,
            content_id: Some(ContentIdentification {
                init_data: Some(init_data),
                license_type: Some(license_type as i32),
                request_id: Some(crypto.generate_request_id()?),
                license_id: None,
            }),
            request_type: Some(RequestType::New as i32),
            request_time: Some(now as i64),
            key_control_nonce: Some(crypto.generate_nonce()?),
            encrypted_client_id,
        };

        let request_bytes = request.encode_to_vec();
        let signature = crypto.prepare_request(&request_bytes, false)?;
        if signature.is_empty() {
            return Err(Error::Unknown("Empty request signature".to_string()));
        }
        self.last_request = request_bytes.clone();

        let envelope = SignedMessage {
            message_type: Some(MessageType::LicenseRequest as i32),
            msg: Some(request_bytes),
            signature: Some(signature),
            session_key: None,
        };
        Ok(KeyMessage {
            message: envelope.encode_to_vec(),
            url: self.server_url.clone(),
            message_type: MessageType::LicenseRequest,
        })
    }

    /// Build a renewal or release request referencing the current license
    /// identification.
    pub fn prepare_key_update_request(
        &mut self,
        crypto: &mut CryptoSession,
        is_renewal: bool,
        policy: &PolicyEngine,
        now: u64,
    ) -> Result<KeyMessage> {
        let license_id = policy.license_id().clone();
        if license_id.request_id.is_none() {
            return Err(Error::Unknown(
                "No license identification to reference".to_string(),
            ));
        }

        let request = LicenseRequest {
            client_id: None,
            content_id: Some(ContentIdentification {
                init_data: None,
                license_type: license_id.license_type,
                request_id: None,
                license_id: Some(license_id),
            }),
            request_type: Some(if is_renewal {
                RequestType::Renewal as i32
            } else {
                RequestType::Release as i32
            }),
            request_time: Some(now as i64),
            key_control_nonce: Some(crypto.generate_nonce()?),
            encrypted_client_id: None,
        };

        let request_bytes = request.encode_to_vec();
        let signature = crypto.prepare_renewal_request(&request_bytes)?;
        if signature.is_empty() {
            return Err(Error::Unknown("Empty request signature".to_string()));
        }

        let url = if is_renewal {
            policy
                .renewal_server_url()
                .map(str::to_string)
                .unwrap_or_else(|| self.server_url.clone())
        } else {
            self.server_url.clone()
        };

        let envelope = SignedMessage {
            message_type: Some(MessageType::LicenseRequest as i32),
            msg: Some(request_bytes),
            signature: Some(signature),
            session_key: None,
        };
        Ok(KeyMessage {
            message: envelope.encode_to_vec(),
            url,
            message_type: MessageType::LicenseRequest,
        })
    }

    /// Parse an initial key response and install its keys.
    pub fn handle_key_response(
        &mut self,
        crypto: &mut CryptoSession,
        policy: &mut PolicyEngine,
        response: &[u8],
        now: u64,
    ) -> Result<ResponseOutcome> {
        let signed = SignedMessage::decode(response)
            .map_err(|e| Error::KeyError(format!("Failed to parse SignedMessage: {}", e)))?;

        match signed.message_type.and_then(|v| MessageType::try_from(v).ok()) {
            Some(MessageType::ServiceCertificate) => {
                self.install_service_certificate(&signed)?;
                Ok(ResponseOutcome::NeedKeyRequest)
            }
            Some(MessageType::ErrorResponse) => Err(map_error_response(&signed)),
            Some(MessageType::License) => {
                self.install_license(crypto, policy, &signed, now)?;
                Ok(ResponseOutcome::KeysLoaded)
            }
            other => Err(Error::KeyError(format!(
                "Unexpected response type {:?}",
                other
            ))),
        }
    }

    /// Parse a renewal or release response.
    pub fn handle_key_update_response(
        &mut self,
        crypto: &mut CryptoSession,
        policy: &mut PolicyEngine,
        is_renewal: bool,
        response: &[u8],
        now: u64,
    ) -> Result<()> {
        let signed = SignedMessage::decode(response)
            .map_err(|e| Error::KeyError(format!("Failed to parse SignedMessage: {}", e)))?;
        if signed.message_type == Some(MessageType::ErrorResponse as i32) {
            return Err(map_error_response(&signed));
        }
        if signed.message_type != Some(MessageType::License as i32) {
            return Err(Error::KeyError(format!(
                "Unexpected update response type {:?}",
                signed.message_type
            )));
        }
        let msg_bytes = signed
            .msg
            .as_ref()
            .ok_or_else(|| Error::KeyError("Missing license message".to_string()))?;
        let license = License::decode(msg_bytes.as_slice())
            .map_err(|e| Error::KeyError(format!("Failed to parse License: {}", e)))?;

        if license.id.is_none() {
            return Err(Error::KeyError(
                "Update response without license identification".to_string(),
            ));
        }

        if !policy.update_license(now, &license) {
            return Err(Error::KeyError(
                "Update did not advance the license version".to_string(),
            ));
        }

        if !is_renewal {
            // release acknowledged; the caller deletes the persisted record
            return Ok(());
        }

        let signature = signed
            .signature
            .as_ref()
            .ok_or_else(|| Error::KeyError("Missing response signature".to_string()))?;
        let (_, _, keys) = extract_keys(&license)?;
        crypto.refresh_keys(msg_bytes, signature, &keys)
    }

    /// Rebuild in-memory key and policy state from persisted request and
    /// response blobs without contacting the server.
    pub fn restore_offline_license(
        &mut self,
        crypto: &mut CryptoSession,
        policy: &mut PolicyEngine,
        request: &[u8],
        response: &[u8],
        renewal_response: &[u8],
        now: u64,
    ) -> Result<()> {
        let signed = SignedMessage::decode_expecting(request, MessageType::LicenseRequest)?;
        let request_bytes = signed
            .msg
            .ok_or_else(|| Error::KeyError("Persisted request has no payload".to_string()))?;
        crypto.rederive(&request_bytes)?;
        self.last_request = request_bytes;

        match self.handle_key_response(crypto, policy, response, now)? {
            ResponseOutcome::KeysLoaded => {}
            ResponseOutcome::NeedKeyRequest => {
                return Err(Error::KeyError(
                    "Persisted response is not a license".to_string(),
                ));
            }
        }

        if !renewal_response.is_empty() {
            self.handle_key_update_response(crypto, policy, true, renewal_response, now)?;
        }
        Ok(())
    }

    fn install_service_certificate(&mut self, signed: &SignedMessage) -> Result<()> {
        let cert_bytes = signed
            .msg
            .as_ref()
            .ok_or_else(|| Error::KeyError("Missing certificate message".to_string()))?;
        let signed_cert = SignedDrmCertificate::decode(cert_bytes.as_slice())
            .map_err(|e| Error::KeyError(format!("Failed to parse certificate: {}", e)))?;

        let cert = verify_signed_certificate(&signed_cert, &self.trusted_signer)?;
        if cert.certificate_type != Some(CertificateType::Service as i32) {
            return Err(Error::KeyError(format!(
                "Certificate is not a service certificate: {:?}",
                cert.certificate_type
            )));
        }

        log::debug!(
            "service certificate installed for provider {:?}",
            cert.provider_id
        );
        self.service_certificate = Some(signed_cert);
        Ok(())
    }

    fn install_license(
        &mut self,
        crypto: &mut CryptoSession,
        policy: &mut PolicyEngine,
        signed: &SignedMessage,
        now: u64,
    ) -> Result<()> {
        let msg_bytes = signed
            .msg
            .as_ref()
            .ok_or_else(|| Error::KeyError("Missing license message".to_string()))?;
        let signature = signed
            .signature
            .as_ref()
            .ok_or_else(|| Error::KeyError("Missing response signature".to_string()))?;
        let license = License::decode(msg_bytes.as_slice())
            .map_err(|e| Error::KeyError(format!("Failed to parse License: {}", e)))?;

        let renewable = license
            .policy
            .as_ref()
            .and_then(|p| p.can_renew)
            .unwrap_or(false);
        let (mac_key_iv, mac_key, keys) = extract_keys(&license)?;
        let (mac_key_iv, mac_key) = if renewable {
            (mac_key_iv, mac_key)
        } else {
            (Vec::new(), Vec::new())
        };

        let content_ids: Vec<Vec<u8>> = keys
            .iter()
            .filter(|k| !k.data.is_empty())
            .map(|k| k.id.clone())
            .collect();
        if content_ids.is_empty() {
            return Err(Error::KeyError("License carries no content keys".to_string()));
        }

        policy.set_license(now, &license);
        crypto.load_keys(msg_bytes, signature, &mac_key_iv, &mac_key, &keys)?;

        self.loaded_key_ids = content_ids.into_iter().collect();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn trust_signer_for_tests(&mut self, signer: RsaPublicKey) {
        self.trusted_signer = signer;
    }

    #[cfg(test)]
    pub(crate) fn service_certificate(&self) -> Option<&SignedDrmCertificate> {
        self.service_certificate.as_ref()
    }
}

/// Split a license's key containers into mac-key material and loadable keys.
///
/// Returns `(mac_key_iv, mac_key, keys)`. The mac key stays encrypted; the
/// fixed wire trailer is stripped from every key field here so raw key
/// material never carries framing into the secure engine.
fn extract_keys(license: &License) -> Result<(Vec<u8>, Vec<u8>, Vec<LoadableKey>)> {
    let mut mac_key_iv = Vec::new();
    let mut mac_key = Vec::new();
    let mut keys = Vec::new();

    for container in &license.key {
        let key_type = container
            .key_type
            .and_then(|v| KeyType::try_from(v).ok())
            .ok_or_else(|| Error::KeyError("Key container without type".to_string()))?;

        match key_type {
            KeyType::Signing => {
                let data = container
                    .key
                    .as_ref()
                    .ok_or_else(|| Error::KeyError("Signing key without material".to_string()))?;
                mac_key = strip_key_padding(data)?.to_vec();
                mac_key_iv = container.iv.clone().unwrap_or_default();
            }
            KeyType::Content | KeyType::OperatorSession => {
                let data = container
                    .key
                    .as_ref()
                    .ok_or_else(|| Error::KeyError("Content key without material".to_string()))?;
                keys.push(LoadableKey {
                    id: container.id.clone().unwrap_or_default(),
                    iv: container.iv.clone().unwrap_or_default(),
                    data: strip_key_padding(data)?.to_vec(),
                    control: key_control(container),
                });
            }
            KeyType::KeyControl => {
                keys.push(LoadableKey {
                    id: container.id.clone().unwrap_or_default(),
                    iv: container.iv.clone().unwrap_or_default(),
                    data: Vec::new(),
                    control: key_control(container),
                });
            }
        }
    }

    Ok((mac_key_iv, mac_key, keys))
}

fn key_control(container: &crate::protocol::KeyContainer) -> Option<KeyControlData> {
    container.key_control.as_ref().map(|kc| KeyControlData {
        block: kc.key_control_block.clone().unwrap_or_default(),
        iv: kc.iv.clone().unwrap_or_default(),
    })
}

fn map_error_response(signed: &SignedMessage) -> Error {
    let code = signed
        .msg
        .as_ref()
        .and_then(|m| LicenseError::decode(m.as_slice()).ok())
        .and_then(|e| e.error_code)
        .and_then(|v| ErrorCode::try_from(v).ok());

    match code {
        Some(ErrorCode::InvalidDeviceCertificate) => {
            Error::NeedProvisioning("Server rejected the device certificate".to_string())
        }
        Some(ErrorCode::RevokedDeviceCertificate) => {
            Error::DeviceRevoked("Server revoked the device certificate".to_string())
        }
        Some(ErrorCode::ServiceUnavailable) => {
            Error::KeyError("License service unavailable".to_string())
        }
        None => Error::KeyError("Unparseable error response".to_string()),
    }
}

/// Verify a signed certificate against a trusted signer and return its body.
fn verify_signed_certificate(
    signed: &SignedDrmCertificate,
    signer: &RsaPublicKey,
) -> Result<DrmCertificate> {
    let cert_bytes = signed
        .drm_certificate
        .as_ref()
        .ok_or_else(|| Error::KeyError("Missing DRM certificate".to_string()))?;
    let signature = signed
        .signature
        .as_ref()
        .ok_or_else(|| Error::KeyError("Missing certificate signature".to_string()))?;

    let hash = Sha1::digest(cert_bytes);
    signer
        .verify(Pss::new::<Sha1>(), &hash, signature)
        .map_err(|_| Error::SignatureMismatch("Signature mismatch on certificate".to_string()))?;

    DrmCertificate::decode(cert_bytes.as_slice())
        .map_err(|e| Error::KeyError(format!("Failed to parse DrmCertificate: {}", e)))
}

/// Encrypt a client identification under a service certificate.
///
/// The serialized block is encrypted with a random AES-128-CBC key and IV;
/// the AES key is wrapped with the certificate's RSA public key using OAEP.
pub(crate) fn encrypt_client_id(
    client_id: &ClientIdentification,
    service_certificate: &SignedDrmCertificate,
) -> Result<EncryptedClientIdentification> {
    let cert_bytes = service_certificate
        .drm_certificate
        .as_ref()
        .ok_or_else(|| Error::KeyError("Missing DRM certificate".to_string()))?;
    let certificate = DrmCertificate::decode(cert_bytes.as_slice())
        .map_err(|e| Error::KeyError(format!("Failed to parse DrmCertificate: {}", e)))?;

    let public_key_bytes = certificate
        .public_key
        .as_ref()
        .ok_or_else(|| Error::KeyError("Certificate has no public key".to_string()))?;
    let public_key = RsaPublicKey::from_pkcs1_der(public_key_bytes.as_slice())
        .map_err(|e| Error::KeyError(format!("Failed to parse public key: {}", e)))?;

    let mut privacy_key = [0u8; 16];
    let mut privacy_iv = [0u8; 16];
    let mut rng = OsRng;
    rng.fill_bytes(&mut privacy_key);
    rng.fill_bytes(&mut privacy_iv);

    let plain = client_id.encode_to_vec();
    let plain_len = plain.len();
    let mut buffer = plain;
    buffer.resize(plain_len + 16, 0);
    let encrypted = Aes128CbcEnc::new(&privacy_key.into(), &privacy_iv.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plain_len)
        .map_err(|e| Error::Unknown(format!("Failed to encrypt client id: {}", e)))?
        .to_vec();

    let wrapped_key = public_key
        .encrypt(&mut rng, Oaep::new::<Sha1>(), &privacy_key)
        .map_err(Error::RsaError)?;

    Ok(EncryptedClientIdentification {
        provider_id: certificate.provider_id.clone(),
        service_certificate_serial_number: certificate.serial_number.clone(),
        encrypted_client_id: Some(encrypted),
        encrypted_client_id_iv: Some(privacy_iv.to_vec()),
        encrypted_privacy_key: Some(wrapped_key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rsa::RsaPrivateKey;

    use crate::crypto::{RequestedLevel, SecureEngine, SecureEngineSet, SecurityLevel};
    use crate::testutil::{
        error_response, make_certificate, make_service_certificate, server_policy,
        service_certificate_response, FakeSecureEngine, TestServer, FAKE_TOKEN, TEST_RSA_KEY,
    };

    const NOW: u64 = 1_000;

    fn crypto() -> (Arc<FakeSecureEngine>, CryptoSession) {
        let engine = Arc::new(FakeSecureEngine::new(SecurityLevel::L3));
        let set = Arc::new(
            SecureEngineSet::probe(vec![engine.clone() as Arc<dyn SecureEngine>]).expect("probe"),
        );
        let session = set.open(RequestedLevel::Default).expect("open");
        (engine, session)
    }

    fn handler(privacy_mode: bool) -> LicenseHandler {
        LicenseHandler::new(
            FAKE_TOKEN.to_vec(),
            vec![("model_name".to_string(), "test-device".to_string())],
            privacy_mode,
            "https://license.test/".to_string(),
        )
    }

    fn test_signer() -> &'static RsaPrivateKey {
        &TEST_RSA_KEY
    }

    fn key_id() -> Vec<u8> {
        b"content-key-0001".to_vec()
    }

    fn request(handler: &mut LicenseHandler, crypto: &mut CryptoSession) -> KeyMessage {
        handler
            .prepare_key_request(
                crypto,
                Some(b"pssh-payload"),
                LicenseType::Streaming,
                &HashMap::new(),
                "sess",
                NOW,
            )
            .expect("request")
    }

    fn decode_request(message: &KeyMessage) -> LicenseRequest {
        let signed =
            SignedMessage::decode_expecting(&message.message, MessageType::LicenseRequest)
                .expect("envelope");
        assert!(!signed.signature.unwrap_or_default().is_empty());
        LicenseRequest::decode(signed.msg.expect("payload").as_slice()).expect("request body")
    }

    #[test]
    fn plain_request_carries_client_identification() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(false);

        let message = request(&mut handler, &mut crypto);
        assert_eq!(message.message_type, MessageType::LicenseRequest);
        assert_eq!(message.url, "https://license.test/");

        let req = decode_request(&message);
        let client_id = req.client_id.expect("client id");
        assert_eq!(client_id.token.as_deref(), Some(FAKE_TOKEN));
        assert!(client_id
            .client_info
            .iter()
            .any(|nv| nv.name.as_deref() == Some("model_name")));
        assert!(req.encrypted_client_id.is_none());

        let content = req.content_id.expect("content id");
        assert_eq!(content.init_data.as_deref(), Some(b"pssh-payload".as_slice()));
        assert!(content.request_id.is_some());
        assert!(req.key_control_nonce.is_some());
    }

    #[test]
    fn missing_init_data_is_an_error() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(false);
        let err = handler
            .prepare_key_request(
                &mut crypto,
                None,
                LicenseType::Streaming,
                &HashMap::new(),
                "sess",
                NOW,
            )
            .expect_err("no init data");
        assert!(matches!(err, Error::KeyError(_)));
    }

    #[test]
    fn privacy_mode_requests_certificate_then_encrypts_identity() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(true);
        handler.trust_signer_for_tests(test_signer().to_public_key());
        let mut policy = PolicyEngine::new(true);

        let first = request(&mut handler, &mut crypto);
        assert_eq!(first.message_type, MessageType::ServiceCertificateRequest);

        let cert = make_service_certificate(
            "provider.test",
            &test_signer().to_public_key(),
            test_signer(),
        );
        let outcome = handler
            .handle_key_response(
                &mut crypto,
                &mut policy,
                &service_certificate_response(&cert),
                NOW,
            )
            .expect("certificate");
        assert_eq!(outcome, ResponseOutcome::NeedKeyRequest);
        assert!(handler.service_certificate().is_some());

        // the retry reuses the init data cached by the first call
        let second = handler
            .prepare_key_request(
                &mut crypto,
                None,
                LicenseType::Streaming,
                &HashMap::new(),
                "sess",
                NOW,
            )
            .expect("request");
        let req = decode_request(&second);
        assert!(req.client_id.is_none());
        let encrypted = req.encrypted_client_id.expect("encrypted identity");
        assert_eq!(encrypted.provider_id.as_deref(), Some("provider.test"));
        assert!(!encrypted.encrypted_privacy_key.unwrap_or_default().is_empty());
        assert_eq!(
            req.content_id.expect("content id").init_data.as_deref(),
            Some(b"pssh-payload".as_slice())
        );
    }

    #[test]
    fn untrusted_certificate_signer_is_rejected() {
        let (_engine, mut crypto) = crypto();
        // the handler still trusts the production root
        let mut handler = handler(true);
        let mut policy = PolicyEngine::new(true);

        let cert = make_service_certificate(
            "provider.test",
            &test_signer().to_public_key(),
            test_signer(),
        );
        let err = handler
            .handle_key_response(
                &mut crypto,
                &mut policy,
                &service_certificate_response(&cert),
                NOW,
            )
            .expect_err("untrusted signer");
        assert!(matches!(err, Error::SignatureMismatch(_)));
    }

    #[test]
    fn non_service_certificate_is_rejected() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(true);
        handler.trust_signer_for_tests(test_signer().to_public_key());
        let mut policy = PolicyEngine::new(true);

        let cert = make_certificate(
            CertificateType::Device,
            "provider.test",
            &test_signer().to_public_key(),
            test_signer(),
        );
        let err = handler
            .handle_key_response(
                &mut crypto,
                &mut policy,
                &service_certificate_response(&cert),
                NOW,
            )
            .expect_err("wrong certificate type");
        assert!(matches!(err, Error::KeyError(_)));
    }

    #[test]
    fn license_response_installs_keys() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(false);
        let mut policy = PolicyEngine::new(true);

        let message = request(&mut handler, &mut crypto);
        let response = TestServer::license_response(
            &message.message,
            &server_policy(),
            &[(key_id(), [0x42u8; 16])],
            1,
            NOW,
        );
        let outcome = handler
            .handle_key_response(&mut crypto, &mut policy, &response, NOW)
            .expect("license");
        assert_eq!(outcome, ResponseOutcome::KeysLoaded);
        assert!(handler.is_key_loaded(&key_id()));
        assert!(!handler.is_key_loaded(b"other-key"));
        assert!(policy.can_decrypt());
    }

    #[test]
    fn tampered_signature_is_fatal() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(false);
        let mut policy = PolicyEngine::new(true);

        let message = request(&mut handler, &mut crypto);
        let response = TestServer::license_response(
            &message.message,
            &server_policy(),
            &[(key_id(), [0x42u8; 16])],
            1,
            NOW,
        );

        let mut signed = SignedMessage::decode(response.as_slice()).expect("envelope");
        let mut signature = signed.signature.expect("signature");
        signature[0] ^= 0x01;
        signed.signature = Some(signature);

        let err = handler
            .handle_key_response(&mut crypto, &mut policy, &signed.encode_to_vec(), NOW)
            .expect_err("tampered");
        assert!(matches!(err, Error::SignatureMismatch(_)));
    }

    #[test]
    fn response_without_content_keys_is_rejected() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(false);
        let mut policy = PolicyEngine::new(true);

        let message = request(&mut handler, &mut crypto);
        let response =
            TestServer::license_response(&message.message, &server_policy(), &[], 1, NOW);
        let err = handler
            .handle_key_response(&mut crypto, &mut policy, &response, NOW)
            .expect_err("no content keys");
        assert!(matches!(err, Error::KeyError(_)));
        // the policy must not have been touched by the rejected grant
        assert!(policy.query(NOW).is_none());
    }

    #[test]
    fn exhausted_key_slots_surface_distinctly() {
        let (engine, mut crypto) = crypto();
        let mut handler = handler(false);
        let mut policy = PolicyEngine::new(true);

        let message = request(&mut handler, &mut crypto);
        let response = TestServer::license_response(
            &message.message,
            &server_policy(),
            &[(key_id(), [0x42u8; 16])],
            1,
            NOW,
        );
        engine.exhaust_key_slots(true);
        let err = handler
            .handle_key_response(&mut crypto, &mut policy, &response, NOW)
            .expect_err("exhausted");
        assert!(matches!(err, Error::InsufficientCryptoResources(_)));
    }

    #[test]
    fn server_error_codes_map_to_the_taxonomy() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(false);
        let mut policy = PolicyEngine::new(true);

        let cases = [
            (ErrorCode::InvalidDeviceCertificate, "provisioning"),
            (ErrorCode::RevokedDeviceCertificate, "revoked"),
            (ErrorCode::ServiceUnavailable, "key error"),
        ];
        for (code, label) in cases {
            let err = handler
                .handle_key_response(&mut crypto, &mut policy, &error_response(code), NOW)
                .expect_err(label);
            match code {
                ErrorCode::InvalidDeviceCertificate => {
                    assert!(matches!(err, Error::NeedProvisioning(_)))
                }
                ErrorCode::RevokedDeviceCertificate => {
                    assert!(matches!(err, Error::DeviceRevoked(_)))
                }
                ErrorCode::ServiceUnavailable => assert!(matches!(err, Error::KeyError(_))),
            }
        }
    }

    #[test]
    fn renewal_advances_and_stale_versions_are_rejected() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(false);
        let mut policy = PolicyEngine::new(true);

        let message = request(&mut handler, &mut crypto);
        let response = TestServer::license_response(
            &message.message,
            &server_policy(),
            &[(key_id(), [0x42u8; 16])],
            1,
            NOW,
        );
        handler
            .handle_key_response(&mut crypto, &mut policy, &response, NOW)
            .expect("license");

        let renewal_request = handler
            .prepare_key_update_request(&mut crypto, true, &policy, NOW + 600)
            .expect("renewal request");
        assert_eq!(renewal_request.url, "https://license.test/renew");

        let renewal = TestServer::renewal_response(
            &renewal_request.message,
            &server_policy(),
            &[key_id()],
            2,
        );
        handler
            .handle_key_update_response(&mut crypto, &mut policy, true, &renewal, NOW + 601)
            .expect("renewal");
        assert!(policy.can_decrypt());

        // replaying the same version must change nothing
        let err = handler
            .handle_key_update_response(&mut crypto, &mut policy, true, &renewal, NOW + 602)
            .expect_err("stale version");
        assert!(matches!(err, Error::KeyError(_)));
        assert!(policy.can_decrypt());
    }

    #[test]
    fn release_response_short_circuits_without_key_reload() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(false);
        let mut policy = PolicyEngine::new(true);

        let message = request(&mut handler, &mut crypto);
        let response = TestServer::license_response(
            &message.message,
            &server_policy(),
            &[(key_id(), [0x42u8; 16])],
            1,
            NOW,
        );
        handler
            .handle_key_response(&mut crypto, &mut policy, &response, NOW)
            .expect("license");

        let release_request = handler
            .prepare_key_update_request(&mut crypto, false, &policy, NOW + 10)
            .expect("release request");
        let release = TestServer::release_response(&release_request.message, 2);
        handler
            .handle_key_update_response(&mut crypto, &mut policy, false, &release, NOW + 11)
            .expect("release");
        // keys are untouched; deleting the record is the caller's job
        assert!(handler.is_key_loaded(&key_id()));
    }

    #[test]
    fn restore_rebuilds_key_and_policy_state() {
        let (_engine, mut crypto) = crypto();
        let mut original = handler(false);
        let mut policy = PolicyEngine::new(true);

        let message = request(&mut original, &mut crypto);
        let response = TestServer::license_response(
            &message.message,
            &server_policy(),
            &[(key_id(), [0x42u8; 16])],
            1,
            NOW,
        );
        original
            .handle_key_response(&mut crypto, &mut policy, &response, NOW)
            .expect("license");
        let renewal_request = original
            .prepare_key_update_request(&mut crypto, true, &policy, NOW + 600)
            .expect("renewal request");
        let renewal = TestServer::renewal_response(
            &renewal_request.message,
            &server_policy(),
            &[key_id()],
            2,
        );
        original
            .handle_key_update_response(&mut crypto, &mut policy, true, &renewal, NOW + 601)
            .expect("renewal");

        // a brand-new session replays the persisted exchange
        let (_engine2, mut crypto2) = self::crypto();
        let mut restored = handler(false);
        let mut policy2 = PolicyEngine::new(true);
        restored
            .restore_offline_license(
                &mut crypto2,
                &mut policy2,
                &message.message,
                &response,
                &renewal,
                NOW + 900,
            )
            .expect("restore");
        assert!(restored.is_key_loaded(&key_id()));
        assert!(policy2.can_decrypt());
    }

    #[test]
    fn restore_rejects_a_non_license_response() {
        let (_engine, mut crypto) = crypto();
        let mut handler = handler(false);
        let mut policy = PolicyEngine::new(true);

        let message = request(&mut handler, &mut crypto);
        let err = handler
            .restore_offline_license(
                &mut crypto,
                &mut policy,
                &message.message,
                &error_response(ErrorCode::ServiceUnavailable),
                &[],
                NOW,
            )
            .expect_err("not a license");
        assert!(matches!(err, Error::KeyError(_)));
    }
}
