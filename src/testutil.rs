//! Shared test doubles: a software secure engine with real key-derivation
//! math and a miniature license server that mints verifiable responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex};

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cmac::{Cmac, Mac as CmacMac};
use hmac::{Hmac, Mac};
use prost::Message;
use rsa::rand_core::{OsRng, RngCore};
use rsa::{Pss, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;

use crate::crypto::{
    CryptoSession, DecryptRequest, DeriveBasis, EngineSessionHandle, LoadableKey, SecureEngine,
    SecurityLevel,
};
use crate::error::{Error, Result};
use crate::protocol::{
    pad_key, CertificateType, DrmCertificate, ErrorCode, KeyContainer, KeyControl, KeyType,
    License, LicenseError, LicenseIdentification, LicensePolicy, LicenseRequest, LicenseType,
    MessageType, SignedDrmCertificate, SignedMessage,
};

type HmacSha256 = Hmac<Sha256>;
type CmacAes128 = Cmac<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Root secret the fake engine derives token-based session keys from.
pub const FAKE_ROOT_KEY: [u8; 16] = *b"fake-root-key-01";
/// Root secret for provisioning-based derivation.
pub const FAKE_PROVISIONING_KEY: [u8; 16] = *b"fake-prov-key-01";
/// Fixed device token reported by the fake engine.
pub const FAKE_TOKEN: &[u8] = b"fake-device-token";
/// Server mac keys installed by every minted license response.
pub const SERVER_MAC_KEY: [u8; 32] = [0xA5; 32];
pub const CLIENT_MAC_KEY: [u8; 32] = [0x5A; 32];
/// Wrapped private key accepted by the fake engine.
pub const FAKE_WRAPPED_KEY: &[u8] = b"wrapped:device-key";

#[derive(Default)]
struct SessionState {
    nonces: Vec<u32>,
    enc_key: Option<Vec<u8>>,
    mac_key_server: Option<Vec<u8>>,
    mac_key_client: Option<Vec<u8>>,
    content_keys: HashMap<Vec<u8>, Vec<u8>>,
    controls: HashMap<Vec<u8>, Vec<u8>>,
    selected: Option<Vec<u8>>,
}

/// Software stand-in for a secure engine tier.
pub struct FakeSecureEngine {
    level: SecurityLevel,
    next_handle: AtomicU64,
    next_nonce: AtomicU32,
    sessions: Mutex<HashMap<u64, SessionState>>,
    fail_open: AtomicBool,
    exhaust_key_slots: AtomicBool,
}

impl FakeSecureEngine {
    pub fn new(level: SecurityLevel) -> Self {
        Self {
            level,
            next_handle: AtomicU64::new(1),
            next_nonce: AtomicU32::new(0x1000),
            sessions: Mutex::new(HashMap::new()),
            fail_open: AtomicBool::new(false),
            exhaust_key_slots: AtomicBool::new(false),
        }
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn exhaust_key_slots(&self, exhaust: bool) {
        self.exhaust_key_slots.store(exhaust, Ordering::SeqCst);
    }

    fn with_session<T>(
        &self,
        session: EngineSessionHandle,
        f: impl FnOnce(&mut SessionState) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| Error::Unknown("Engine table poisoned".to_string()))?;
        let state = sessions
            .get_mut(&session)
            .ok_or_else(|| Error::Unknown(format!("No engine session {}", session)))?;
        f(state)
    }
}

impl SecureEngine for FakeSecureEngine {
    fn security_level(&self) -> SecurityLevel {
        self.level
    }

    fn open_session(&self) -> Result<EngineSessionHandle> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::InsufficientCryptoResources(
                "No engine sessions available".to_string(),
            ));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(handle, SessionState::default());
        }
        Ok(handle)
    }

    fn close_session(&self, session: EngineSessionHandle) -> Result<()> {
        let removed = self
            .sessions
            .lock()
            .ok()
            .and_then(|mut s| s.remove(&session));
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::Unknown(format!("No engine session {}", session))),
        }
    }

    fn token(&self) -> Result<Vec<u8>> {
        Ok(FAKE_TOKEN.to_vec())
    }

    fn device_unique_id(&self) -> Result<Vec<u8>> {
        Ok(b"unique-device-id".to_vec())
    }

    fn provisioning_id(&self) -> Result<Vec<u8>> {
        Ok(b"provisioning-id".to_vec())
    }

    fn generate_nonce(&self, session: EngineSessionHandle) -> Result<u32> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::SeqCst);
        self.with_session(session, |state| {
            state.nonces.push(nonce);
            Ok(nonce)
        })
    }

    fn derive_keys(
        &self,
        session: EngineSessionHandle,
        basis: DeriveBasis,
        enc_context: &[u8],
        mac_context: &[u8],
    ) -> Result<()> {
        let root = match basis {
            DeriveBasis::Token => FAKE_ROOT_KEY,
            DeriveBasis::Provisioning => FAKE_PROVISIONING_KEY,
        };
        let (enc, mac_server, mac_client) = derive_key_set(&root, enc_context, mac_context);
        self.with_session(session, |state| {
            state.enc_key = Some(enc);
            state.mac_key_server = Some(mac_server);
            state.mac_key_client = Some(mac_client);
            Ok(())
        })
    }

    fn sign(&self, session: EngineSessionHandle, message: &[u8]) -> Result<Vec<u8>> {
        self.with_session(session, |state| {
            let key = state
                .mac_key_client
                .as_ref()
                .ok_or_else(|| Error::Unknown("No derived signing key".to_string()))?;
            Ok(hmac_sha256(key, &[message]))
        })
    }

    fn sign_renewal(&self, session: EngineSessionHandle, message: &[u8]) -> Result<Vec<u8>> {
        self.with_session(session, |state| {
            let key = state
                .mac_key_client
                .as_ref()
                .ok_or_else(|| Error::Unknown("No installed signing key".to_string()))?;
            Ok(hmac_sha256(key, &[message]))
        })
    }

    fn load_wrapped_private_key(
        &self,
        session: EngineSessionHandle,
        wrapped_key: &[u8],
    ) -> Result<()> {
        if wrapped_key != FAKE_WRAPPED_KEY {
            return Err(Error::Unknown("Wrapped key rejected".to_string()));
        }
        self.with_session(session, |_| Ok(()))
    }

    fn load_keys(
        &self,
        session: EngineSessionHandle,
        message: &[u8],
        signature: &[u8],
        mac_key_iv: &[u8],
        mac_key: &[u8],
        keys: &[LoadableKey],
    ) -> Result<()> {
        self.with_session(session, |state| {
            let server_key = state
                .mac_key_server
                .as_ref()
                .ok_or_else(|| Error::Unknown("No derived server key".to_string()))?;
            if hmac_sha256(server_key, &[message]) != signature {
                return Err(Error::SignatureMismatch(
                    "License signature mismatch".to_string(),
                ));
            }

            verify_nonces(state, keys)?;

            if self.exhaust_key_slots.load(Ordering::SeqCst) {
                return Err(Error::InsufficientCryptoResources(
                    "No key slots available".to_string(),
                ));
            }

            let enc_key = state
                .enc_key
                .clone()
                .ok_or_else(|| Error::Unknown("No derived encryption key".to_string()))?;
            for key in keys {
                if !key.data.is_empty() {
                    let plain = decrypt_cbc(&enc_key, &key.iv, &key.data)?;
                    state.content_keys.insert(key.id.clone(), plain);
                }
                if let Some(control) = &key.control {
                    state.controls.insert(key.id.clone(), control.block.clone());
                }
            }

            if !mac_key.is_empty() {
                let plain = decrypt_cbc(&enc_key, mac_key_iv, mac_key)?;
                if plain.len() != 64 {
                    return Err(Error::KeyError(format!(
                        "Mac key block has {} bytes",
                        plain.len()
                    )));
                }
                state.mac_key_server = Some(plain[..32].to_vec());
                state.mac_key_client = Some(plain[32..].to_vec());
            }
            Ok(())
        })
    }

    fn refresh_keys(
        &self,
        session: EngineSessionHandle,
        message: &[u8],
        signature: &[u8],
        keys: &[LoadableKey],
    ) -> Result<()> {
        self.with_session(session, |state| {
            let server_key = state
                .mac_key_server
                .as_ref()
                .ok_or_else(|| Error::Unknown("No installed server key".to_string()))?;
            if hmac_sha256(server_key, &[message]) != signature {
                return Err(Error::SignatureMismatch(
                    "Renewal signature mismatch".to_string(),
                ));
            }

            verify_nonces(state, keys)?;

            for key in keys {
                if let Some(control) = &key.control {
                    if state.content_keys.contains_key(&key.id)
                        || state.controls.contains_key(&key.id)
                    {
                        state.controls.insert(key.id.clone(), control.block.clone());
                    }
                }
            }
            Ok(())
        })
    }

    fn select_key(&self, session: EngineSessionHandle, key_id: &[u8]) -> Result<()> {
        self.with_session(session, |state| {
            if !state.content_keys.contains_key(key_id) {
                return Err(Error::Unknown("Key not loaded".to_string()));
            }
            state.selected = Some(key_id.to_vec());
            Ok(())
        })
    }

    fn decrypt(&self, session: EngineSessionHandle, request: &DecryptRequest) -> Result<Vec<u8>> {
        self.with_session(session, |state| {
            if !request.is_encrypted {
                return Ok(request.data.to_vec());
            }
            let key = state
                .content_keys
                .get(request.key_id)
                .ok_or_else(|| Error::Unknown("Key not loaded".to_string()))?;
            Ok(xor_keystream(key, request.data))
        })
    }

    fn get_random(&self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        OsRng.fill_bytes(&mut buf);
        Ok(buf)
    }

    fn supports_secure_output(&self) -> bool {
        self.level != SecurityLevel::L3
    }
}

/// Control blocks open with the echoed request nonce; a mismatch is an
/// integrity failure. A session with no outstanding nonces is replaying a
/// persisted response and has nothing to check.
fn verify_nonces(state: &mut SessionState, keys: &[LoadableKey]) -> Result<()> {
    if state.nonces.is_empty() {
        return Ok(());
    }
    for key in keys {
        if let Some(control) = &key.control {
            if control.block.len() < 4 {
                return Err(Error::InvalidNonce("Short key control block".to_string()));
            }
            let nonce = u32::from_le_bytes([
                control.block[0],
                control.block[1],
                control.block[2],
                control.block[3],
            ]);
            match state.nonces.iter().position(|&n| n == nonce) {
                Some(idx) => {
                    state.nonces.remove(idx);
                }
                None => {
                    return Err(Error::InvalidNonce(format!(
                        "Nonce {:#x} was not issued by this session",
                        nonce
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Derivation used by both the fake engine and the test server; matches the
/// facade's context labels.
pub fn derive_key_set(
    root: &[u8; 16],
    enc_context: &[u8],
    mac_context: &[u8],
) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    fn derive(key: &[u8], context: &[u8], counter: u8) -> Vec<u8> {
        let mut mac = CmacAes128::new_from_slice(key).expect("CMAC key length invalid");
        mac.update(&[counter]);
        mac.update(context);
        mac.finalize().into_bytes().to_vec()
    }

    let enc_key = derive(root, enc_context, 1);
    let mut mac_key_server = derive(root, mac_context, 1);
    mac_key_server.extend_from_slice(&derive(root, mac_context, 2));
    let mut mac_key_client = derive(root, mac_context, 3);
    mac_key_client.extend_from_slice(&derive(root, mac_context, 4));
    (enc_key, mac_key_server, mac_key_client)
}

pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

pub fn encrypt_cbc(key: &[u8], iv: &[u8], plain: &[u8]) -> Vec<u8> {
    let key: [u8; 16] = key.try_into().expect("16-byte key");
    let iv: [u8; 16] = iv.try_into().expect("16-byte iv");
    let plain_len = plain.len();
    let mut buffer = plain.to_vec();
    buffer.resize(plain_len + 16, 0);
    Aes128CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plain_len)
        .expect("encrypt")
        .to_vec()
}

pub fn decrypt_cbc(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let key: [u8; 16] = key
        .try_into()
        .map_err(|_| Error::KeyError("Bad key length".to_string()))?;
    let iv: [u8; 16] = iv
        .try_into()
        .map_err(|_| Error::KeyError("Bad iv length".to_string()))?;
    let mut buffer = ciphertext.to_vec();
    Aes128CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map(|p| p.to_vec())
        .map_err(|e| Error::KeyError(format!("Failed to decrypt: {}", e)))
}

fn xor_keystream(key: &[u8], data: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(key.iter().cycle())
        .map(|(d, k)| d ^ k)
        .collect()
}

/// RSA key pair shared across tests; generation is expensive.
pub static TEST_RSA_KEY: LazyLock<RsaPrivateKey> = LazyLock::new(|| {
    let mut rng = OsRng;
    RsaPrivateKey::new(&mut rng, 2048).expect("generate test RSA key")
});

/// Build a service certificate signed by `signer`.
pub fn make_service_certificate(
    provider_id: &str,
    subject_key: &RsaPublicKey,
    signer: &RsaPrivateKey,
) -> SignedDrmCertificate {
    make_certificate(CertificateType::Service, provider_id, subject_key, signer)
}

/// Build a signed certificate of an arbitrary type.
pub fn make_certificate(
    certificate_type: CertificateType,
    provider_id: &str,
    subject_key: &RsaPublicKey,
    signer: &RsaPrivateKey,
) -> SignedDrmCertificate {
    use rsa::pkcs1::EncodeRsaPublicKey;

    let cert = DrmCertificate {
        certificate_type: Some(certificate_type as i32),
        serial_number: Some(b"serial-0001".to_vec()),
        public_key: Some(
            subject_key
                .to_pkcs1_der()
                .expect("encode public key")
                .as_bytes()
                .to_vec(),
        ),
        provider_id: Some(provider_id.to_string()),
    };
    let cert_bytes = cert.encode_to_vec();

    let hash = Sha1::digest(&cert_bytes);
    let mut rng = OsRng;
    let signature = signer
        .sign_with_rng(&mut rng, Pss::new::<Sha1>(), &hash)
        .expect("sign certificate");

    SignedDrmCertificate {
        drm_certificate: Some(cert_bytes),
        signature: Some(signature),
    }
}

/// Wrap a signed certificate in a SERVICE_CERTIFICATE response envelope.
pub fn service_certificate_response(cert: &SignedDrmCertificate) -> Vec<u8> {
    SignedMessage {
        message_type: Some(MessageType::ServiceCertificate as i32),
        msg: Some(cert.encode_to_vec()),
        signature: None,
        session_key: None,
    }
    .encode_to_vec()
}

/// Build an ERROR response envelope.
pub fn error_response(code: ErrorCode) -> Vec<u8> {
    SignedMessage {
        message_type: Some(MessageType::ErrorResponse as i32),
        msg: Some(
            LicenseError {
                error_code: Some(code as i32),
            }
            .encode_to_vec(),
        ),
        signature: None,
        session_key: None,
    }
    .encode_to_vec()
}

/// Default streaming policy used by the test server.
pub fn server_policy() -> LicensePolicy {
    LicensePolicy {
        can_play: Some(true),
        can_persist: Some(true),
        can_renew: Some(true),
        rental_duration_seconds: Some(3600),
        license_duration_seconds: Some(3600),
        playback_duration_seconds: Some(0),
        renewal_server_url: Some("https://license.test/renew".to_string()),
        renewal_delay_seconds: Some(600),
        renewal_retry_interval_seconds: Some(60),
        renew_with_usage: Some(false),
    }
}

/// Stateless stand-in for the license server. Responses derive session keys
/// from the captured request exactly like the fake engine does.
pub struct TestServer;

impl TestServer {
    /// Mint a signed license response carrying the given content keys and
    /// installing [`SERVER_MAC_KEY`]/[`CLIENT_MAC_KEY`] as the new mac pair.
    pub fn license_response(
        request_envelope: &[u8],
        policy: &LicensePolicy,
        content_keys: &[(Vec<u8>, [u8; 16])],
        version: i32,
        start_time: u64,
    ) -> Vec<u8> {
        let (request, request_bytes, nonce) = Self::parse_request(request_envelope);
        let (enc_ctx, mac_ctx) = CryptoSession::derive_context(&request_bytes);
        let (enc_key, mac_key_server, _) = derive_key_set(&FAKE_ROOT_KEY, &enc_ctx, &mac_ctx);

        let request_id = request
            .content_id
            .as_ref()
            .and_then(|c| c.request_id.clone())
            .unwrap_or_else(|| b"req-0".to_vec());

        let mut containers = Vec::new();

        // new mac pair, encrypted under the derived encryption key
        let mac_iv = [0x01u8; 16];
        let mut mac_plain = SERVER_MAC_KEY.to_vec();
        mac_plain.extend_from_slice(&CLIENT_MAC_KEY);
        containers.push(KeyContainer {
            id: Some(b"signing".to_vec()),
            iv: Some(mac_iv.to_vec()),
            key: Some(pad_key(&encrypt_cbc(&enc_key, &mac_iv, &mac_plain))),
            key_type: Some(KeyType::Signing as i32),
            key_control: None,
        });

        for (id, key) in content_keys {
            let iv = [0x02u8; 16];
            let mut control = nonce.to_le_bytes().to_vec();
            control.extend_from_slice(b"ctrl");
            containers.push(KeyContainer {
                id: Some(id.clone()),
                iv: Some(iv.to_vec()),
                key: Some(pad_key(&encrypt_cbc(&enc_key, &iv, key))),
                key_type: Some(KeyType::Content as i32),
                key_control: Some(KeyControl {
                    key_control_block: Some(control),
                    iv: Some(iv.to_vec()),
                }),
            });
        }

        let license = License {
            id: Some(LicenseIdentification {
                request_id: Some(request_id),
                session_id: Some(b"server-session".to_vec()),
                license_type: Some(LicenseType::Streaming as i32),
                version: Some(version),
            }),
            policy: Some(policy.clone()),
            key: containers,
            license_start_time: Some(start_time as i64),
        };
        let msg = license.encode_to_vec();
        let signature = hmac_sha256(&mac_key_server, &[&msg]);

        SignedMessage {
            message_type: Some(MessageType::License as i32),
            msg: Some(msg),
            signature: Some(signature),
            session_key: None,
        }
        .encode_to_vec()
    }

    /// Mint a renewal response signed with the installed server mac key.
    pub fn renewal_response(
        renewal_request_envelope: &[u8],
        policy: &LicensePolicy,
        key_ids: &[Vec<u8>],
        version: i32,
    ) -> Vec<u8> {
        let (request, _, nonce) = Self::parse_request(renewal_request_envelope);

        let license_id = request
            .content_id
            .as_ref()
            .and_then(|c| c.license_id.clone())
            .unwrap_or_default();

        let containers = key_ids
            .iter()
            .map(|id| {
                let mut control = nonce.to_le_bytes().to_vec();
                control.extend_from_slice(b"ctrl");
                KeyContainer {
                    id: Some(id.clone()),
                    iv: None,
                    key: None,
                    key_type: Some(KeyType::KeyControl as i32),
                    key_control: Some(KeyControl {
                        key_control_block: Some(control),
                        iv: None,
                    }),
                }
            })
            .collect();

        let license = License {
            id: Some(LicenseIdentification {
                version: Some(version),
                ..license_id
            }),
            policy: Some(policy.clone()),
            key: containers,
            license_start_time: Some(1),
        };
        let msg = license.encode_to_vec();
        let signature = hmac_sha256(&SERVER_MAC_KEY, &[&msg]);

        SignedMessage {
            message_type: Some(MessageType::License as i32),
            msg: Some(msg),
            signature: Some(signature),
            session_key: None,
        }
        .encode_to_vec()
    }

    /// Mint a release acknowledgement. No keys, no reload.
    pub fn release_response(release_request_envelope: &[u8], version: i32) -> Vec<u8> {
        let (request, _, _) = Self::parse_request(release_request_envelope);
        let license_id = request
            .content_id
            .as_ref()
            .and_then(|c| c.license_id.clone())
            .unwrap_or_default();

        let license = License {
            id: Some(LicenseIdentification {
                version: Some(version),
                ..license_id
            }),
            policy: None,
            key: Vec::new(),
            license_start_time: Some(1),
        };
        let msg = license.encode_to_vec();
        let signature = hmac_sha256(&SERVER_MAC_KEY, &[&msg]);

        SignedMessage {
            message_type: Some(MessageType::License as i32),
            msg: Some(msg),
            signature: Some(signature),
            session_key: None,
        }
        .encode_to_vec()
    }

    fn parse_request(envelope: &[u8]) -> (LicenseRequest, Vec<u8>, u32) {
        let signed = SignedMessage::decode(envelope).expect("request envelope");
        assert_eq!(
            signed.message_type,
            Some(MessageType::LicenseRequest as i32),
            "not a license request"
        );
        let raw = signed.msg.expect("request payload");
        let request = LicenseRequest::decode(raw.as_slice()).expect("request body");
        let nonce = request.key_control_nonce.unwrap_or(0);
        (request, raw, nonce)
    }
}
