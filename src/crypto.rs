//! Secure engine abstraction and the per-session crypto facade.
//!
//! All primitive cryptography (AES, RSA, HMAC, key ladders) lives behind the
//! [`SecureEngine`] trait; implementations wrap a hardware-backed library or
//! a software fallback. This module's job is sequencing, key-derivation
//! context construction, and security-level fallback, never the math itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// Opaque handle to one secure-engine session.
pub type EngineSessionHandle = u64;

/// Security tier of a secure engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    /// Hardware-backed crypto and decode path.
    L1,
    /// Hardware-backed crypto, software decode.
    L2,
    /// Software-only fallback.
    L3,
}

impl SecurityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::L1 => "L1",
            SecurityLevel::L2 => "L2",
            SecurityLevel::L3 => "L3",
        }
    }
}

/// Tier requested when opening a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestedLevel {
    /// Prefer the highest probed tier, falling back to software when the
    /// hardware tier fails to open.
    #[default]
    Default,
    /// Force the software tier.
    L3,
}

/// Root material the engine derives session keys from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeriveBasis {
    /// Factory token / loaded device key.
    Token,
    /// Provisioning key ladder.
    Provisioning,
}

/// Destination buffer classification for decrypt output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Clear,
    Secure,
    Direct,
}

/// Per-key control metadata handed to the engine alongside key material.
#[derive(Debug, Clone)]
pub struct KeyControlData {
    pub block: Vec<u8>,
    pub iv: Vec<u8>,
}

/// One encrypted key entry for `load_keys` / `refresh_keys`. Control-only
/// entries carry an empty `data` field.
#[derive(Debug, Clone)]
pub struct LoadableKey {
    pub id: Vec<u8>,
    pub iv: Vec<u8>,
    pub data: Vec<u8>,
    pub control: Option<KeyControlData>,
}

/// One buffer-region decrypt operation.
#[derive(Debug)]
pub struct DecryptRequest<'a> {
    pub key_id: &'a [u8],
    pub iv: &'a [u8],
    pub data: &'a [u8],
    pub is_encrypted: bool,
    pub dest: BufferKind,
}

/// Session-scoped capability interface over the secure primitive engine.
///
/// Operations on different sessions may run concurrently; callers must not
/// interleave operations on the same handle.
pub trait SecureEngine: Send + Sync {
    fn security_level(&self) -> SecurityLevel;

    fn open_session(&self) -> Result<EngineSessionHandle>;
    fn close_session(&self, session: EngineSessionHandle) -> Result<()>;

    fn token(&self) -> Result<Vec<u8>>;
    fn device_unique_id(&self) -> Result<Vec<u8>>;
    fn provisioning_id(&self) -> Result<Vec<u8>>;

    fn generate_nonce(&self, session: EngineSessionHandle) -> Result<u32>;

    /// Derive per-session signing and encryption keys bound to the supplied
    /// contexts.
    fn derive_keys(
        &self,
        session: EngineSessionHandle,
        basis: DeriveBasis,
        enc_context: &[u8],
        mac_context: &[u8],
    ) -> Result<()>;

    /// HMAC-sign a message with the derived client signing key.
    fn sign(&self, session: EngineSessionHandle, message: &[u8]) -> Result<Vec<u8>>;

    /// HMAC-sign a renewal or release message with the session's installed
    /// signing key (distinct material from the derived request key).
    fn sign_renewal(&self, session: EngineSessionHandle, message: &[u8]) -> Result<Vec<u8>>;

    /// Load a wrapped device private key for certificate-based identity.
    fn load_wrapped_private_key(
        &self,
        session: EngineSessionHandle,
        wrapped_key: &[u8],
    ) -> Result<()>;

    /// Verify `signature` over `message` with the derived server key, then
    /// decrypt and install each key entry and replace the session's mac keys.
    /// Fails distinctly for signature mismatch, nonce mismatch, and resource
    /// exhaustion.
    fn load_keys(
        &self,
        session: EngineSessionHandle,
        message: &[u8],
        signature: &[u8],
        mac_key_iv: &[u8],
        mac_key: &[u8],
        keys: &[LoadableKey],
    ) -> Result<()>;

    /// Same verification contract as `load_keys`, but only updates control
    /// metadata for already-installed keys.
    fn refresh_keys(
        &self,
        session: EngineSessionHandle,
        message: &[u8],
        signature: &[u8],
        keys: &[LoadableKey],
    ) -> Result<()>;

    fn select_key(&self, session: EngineSessionHandle, key_id: &[u8]) -> Result<()>;
    fn decrypt(&self, session: EngineSessionHandle, request: &DecryptRequest) -> Result<Vec<u8>>;

    fn get_random(&self, n: usize) -> Result<Vec<u8>>;

    /// Whether this tier can emit into protected output buffers.
    fn supports_secure_output(&self) -> bool;
}

/// Probed set of secure-engine tiers plus the handle table.
///
/// The mutex guards only the mapping between facade sessions and engine
/// sessions; cryptographic operations run outside it.
pub struct SecureEngineSet {
    preferred: Arc<dyn SecureEngine>,
    fallback: Arc<dyn SecureEngine>,
    next_id: AtomicU64,
    table: Mutex<HashMap<u64, (SecurityLevel, EngineSessionHandle)>>,
}

impl SecureEngineSet {
    /// Probe the supplied engines and fix the tier selection for the life of
    /// the process.
    ///
    /// The highest tier that can open and close a session becomes the
    /// preferred engine; an L3 engine must be present as the fallback.
    pub fn probe(candidates: Vec<Arc<dyn SecureEngine>>) -> Result<Self> {
        let fallback = candidates
            .iter()
            .find(|e| e.security_level() == SecurityLevel::L3)
            .cloned()
            .ok_or_else(|| Error::Unknown("No software-tier engine available".to_string()))?;

        let mut sorted = candidates;
        sorted.sort_by_key(|e| e.security_level());

        let mut preferred = fallback.clone();
        for engine in sorted {
            match engine.open_session().and_then(|h| engine.close_session(h)) {
                Ok(()) => {
                    preferred = engine;
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "secure engine tier {} failed probe: {}",
                        engine.security_level().as_str(),
                        e
                    );
                }
            }
        }

        Ok(Self {
            preferred,
            fallback,
            next_id: AtomicU64::new(1),
            table: Mutex::new(HashMap::new()),
        })
    }

    /// Highest tier selected by the probe.
    pub fn preferred_level(&self) -> SecurityLevel {
        self.preferred.security_level()
    }

    /// Number of facade sessions currently open across all tiers.
    pub fn open_sessions(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Open a crypto session at the requested tier.
    pub fn open(self: &Arc<Self>, level: RequestedLevel) -> Result<CryptoSession> {
        let engine = match level {
            RequestedLevel::L3 => self.fallback.clone(),
            RequestedLevel::Default => self.preferred.clone(),
        };

        let (engine, handle) = match engine.open_session() {
            Ok(handle) => (engine, handle),
            Err(e) if level == RequestedLevel::Default
                && engine.security_level() != SecurityLevel::L3 =>
            {
                log::warn!(
                    "hardware tier {} open failed ({}); falling back to L3",
                    engine.security_level().as_str(),
                    e
                );
                let handle = self.fallback.open_session()?;
                (self.fallback.clone(), handle)
            }
            Err(e) => return Err(e),
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut table) = self.table.lock() {
            table.insert(id, (engine.security_level(), handle));
        }

        Ok(CryptoSession {
            set: self.clone(),
            engine,
            id,
            handle,
            open: true,
            dest: None,
        })
    }

    fn release(&self, id: u64) {
        if let Ok(mut table) = self.table.lock() {
            table.remove(&id);
        }
    }
}

/// Facade over one open secure-engine session.
pub struct CryptoSession {
    set: Arc<SecureEngineSet>,
    engine: Arc<dyn SecureEngine>,
    id: u64,
    handle: EngineSessionHandle,
    open: bool,
    /// Destination classification, resolved once on first decrypt.
    dest: Option<BufferKind>,
}

impl CryptoSession {
    pub fn security_level(&self) -> SecurityLevel {
        self.engine.security_level()
    }

    pub fn token(&self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.engine.token()
    }

    pub fn device_unique_id(&self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.engine.device_unique_id()
    }

    pub fn provisioning_id(&self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.engine.provisioning_id()
    }

    /// Generate a protocol request id in counter form: four random bytes,
    /// four zero bytes, and the facade session id, hex-encoded.
    pub fn generate_request_id(&self) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let random = self.engine.get_random(4)?;
        let mut raw = [0u8; 16];
        raw[..4].copy_from_slice(&random);
        // bytes 4..8 remain 0
        raw[8..].copy_from_slice(&self.id.to_le_bytes());
        Ok(raw
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<String>()
            .into_bytes())
    }

    pub fn generate_nonce(&self) -> Result<u32> {
        self.ensure_open()?;
        self.engine.generate_nonce(self.handle)
    }

    /// Derive encryption and MAC contexts from a message.
    ///
    /// Context format follows the ENCRYPTION/AUTHENTICATION labels with the
    /// derived key sizes in bits appended.
    #[must_use]
    pub fn derive_context(message: &[u8]) -> (Vec<u8>, Vec<u8>) {
        fn enc_context(msg: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(11 + msg.len() + 4);
            out.extend_from_slice(b"ENCRYPTION");
            out.push(0);
            out.extend_from_slice(msg);
            out.extend_from_slice(&(16u32 * 8).to_be_bytes());
            out
        }

        fn mac_context(msg: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(15 + msg.len() + 4);
            out.extend_from_slice(b"AUTHENTICATION");
            out.push(0);
            out.extend_from_slice(msg);
            out.extend_from_slice(&(32u32 * 8 * 2).to_be_bytes());
            out
        }

        (enc_context(message), mac_context(message))
    }

    /// Derive session keys bound to `message` and sign it.
    pub fn prepare_request(&mut self, message: &[u8], is_provisioning: bool) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let (enc_ctx, mac_ctx) = Self::derive_context(message);
        let basis = if is_provisioning {
            DeriveBasis::Provisioning
        } else {
            DeriveBasis::Token
        };
        self.engine
            .derive_keys(self.handle, basis, &enc_ctx, &mac_ctx)?;
        self.engine.sign(self.handle, message)
    }

    /// Sign a renewal or release message with the installed session keys.
    pub fn prepare_renewal_request(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.engine.sign_renewal(self.handle, message)
    }

    /// Re-derive session keys from a previously issued request without
    /// signing it again. Used when restoring persisted licenses.
    pub fn rederive(&mut self, message: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let (enc_ctx, mac_ctx) = Self::derive_context(message);
        self.engine
            .derive_keys(self.handle, DeriveBasis::Token, &enc_ctx, &mac_ctx)
    }

    pub fn load_wrapped_private_key(&mut self, wrapped_key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.engine.load_wrapped_private_key(self.handle, wrapped_key)
    }

    pub fn load_keys(
        &mut self,
        message: &[u8],
        signature: &[u8],
        mac_key_iv: &[u8],
        mac_key: &[u8],
        keys: &[LoadableKey],
    ) -> Result<()> {
        self.ensure_open()?;
        self.engine
            .load_keys(self.handle, message, signature, mac_key_iv, mac_key, keys)
    }

    pub fn refresh_keys(
        &mut self,
        message: &[u8],
        signature: &[u8],
        keys: &[LoadableKey],
    ) -> Result<()> {
        self.ensure_open()?;
        self.engine.refresh_keys(self.handle, message, signature, keys)
    }

    pub fn select_key(&mut self, key_id: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.engine.select_key(self.handle, key_id)
    }

    /// Decrypt one buffer region.
    ///
    /// The destination classification is resolved against engine capability
    /// once per session and cached for subsequent calls.
    pub fn decrypt(&mut self, request: &DecryptRequest) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let dest = match self.dest {
            Some(kind) => kind,
            None => {
                let kind = match request.dest {
                    BufferKind::Secure if !self.engine.supports_secure_output() => {
                        BufferKind::Clear
                    }
                    requested => requested,
                };
                self.dest = Some(kind);
                kind
            }
        };

        let effective = DecryptRequest {
            key_id: request.key_id,
            iv: request.iv,
            data: request.data,
            is_encrypted: request.is_encrypted,
            dest,
        };
        self.engine.decrypt(self.handle, &effective)
    }

    pub fn get_random(&self, n: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.engine.get_random(n)
    }

    /// Release the engine session. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.set.release(self.id);
        self.engine.close_session(self.handle)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Unknown("Crypto session is closed".to_string()))
        }
    }
}

impl Drop for CryptoSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("id", &self.id)
            .field("level", &self.engine.security_level())
            .field("open", &self.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeSecureEngine;

    fn set_with(engines: Vec<Arc<dyn SecureEngine>>) -> Arc<SecureEngineSet> {
        Arc::new(SecureEngineSet::probe(engines).expect("probe"))
    }

    #[test]
    fn probe_prefers_highest_working_tier() {
        let hw = Arc::new(FakeSecureEngine::new(SecurityLevel::L1));
        let sw = Arc::new(FakeSecureEngine::new(SecurityLevel::L3));
        let set = set_with(vec![hw, sw]);
        assert_eq!(set.preferred_level(), SecurityLevel::L1);
    }

    #[test]
    fn probe_falls_back_when_hardware_is_dead() {
        let hw = Arc::new(FakeSecureEngine::new(SecurityLevel::L1));
        hw.fail_open(true);
        let sw = Arc::new(FakeSecureEngine::new(SecurityLevel::L3));
        let set = set_with(vec![hw, sw]);
        assert_eq!(set.preferred_level(), SecurityLevel::L3);
    }

    #[test]
    fn probe_requires_software_tier() {
        let hw: Arc<dyn SecureEngine> = Arc::new(FakeSecureEngine::new(SecurityLevel::L1));
        assert!(SecureEngineSet::probe(vec![hw]).is_err());
    }

    #[test]
    fn open_falls_back_at_session_time() {
        let hw = Arc::new(FakeSecureEngine::new(SecurityLevel::L1));
        let sw = Arc::new(FakeSecureEngine::new(SecurityLevel::L3));
        let set = set_with(vec![hw.clone(), sw]);

        // hardware dies after the probe
        hw.fail_open(true);
        let session = set.open(RequestedLevel::Default).expect("open");
        assert_eq!(session.security_level(), SecurityLevel::L3);
    }

    #[test]
    fn explicit_l3_override_skips_hardware() {
        let hw = Arc::new(FakeSecureEngine::new(SecurityLevel::L1));
        let sw = Arc::new(FakeSecureEngine::new(SecurityLevel::L3));
        let set = set_with(vec![hw, sw]);

        let session = set.open(RequestedLevel::L3).expect("open");
        assert_eq!(session.security_level(), SecurityLevel::L3);
    }

    #[test]
    fn close_is_idempotent_and_releases_the_handle() {
        let sw = Arc::new(FakeSecureEngine::new(SecurityLevel::L3));
        let set = set_with(vec![sw]);

        let mut session = set.open(RequestedLevel::Default).expect("open");
        assert_eq!(set.open_sessions(), 1);
        session.close().expect("close");
        session.close().expect("second close");
        assert_eq!(set.open_sessions(), 0);

        assert!(session.generate_nonce().is_err());
    }

    #[test]
    fn request_id_embeds_session_counter() {
        let sw = Arc::new(FakeSecureEngine::new(SecurityLevel::L3));
        let set = set_with(vec![sw]);

        let session = set.open(RequestedLevel::Default).expect("open");
        let id = session.generate_request_id().expect("request id");
        assert_eq!(id.len(), 32);
        // middle four raw bytes are zero
        assert_eq!(&id[8..16], b"00000000");
    }

    #[test]
    fn derive_context_contains_labels() {
        let message = b"test-message";
        let (enc, mac) = CryptoSession::derive_context(message);

        assert!(enc.starts_with(b"ENCRYPTION"));
        assert!(mac.starts_with(b"AUTHENTICATION"));
        assert!(enc.windows(message.len()).any(|w| w == message));
        assert!(mac.windows(message.len()).any(|w| w == message));
    }

    #[test]
    fn nonce_mismatch_is_integrity_failure() {
        let sw = Arc::new(FakeSecureEngine::new(SecurityLevel::L3));
        let set = set_with(vec![sw]);
        let mut session = set.open(RequestedLevel::Default).expect("open");

        session.rederive(b"message").expect("derive");
        let issued = session.generate_nonce().expect("nonce");

        let (enc_ctx, mac_ctx) = CryptoSession::derive_context(b"message");
        let (_, mac_server, _) = crate::testutil::derive_key_set(
            &crate::testutil::FAKE_ROOT_KEY,
            &enc_ctx,
            &mac_ctx,
        );
        let signature = crate::testutil::hmac_sha256(&mac_server, &[b"license-body"]);

        // control block echoes a nonce this session never issued
        let mut control = (issued ^ 1).to_le_bytes().to_vec();
        control.extend_from_slice(b"ctrl");
        let keys = [LoadableKey {
            id: b"k".to_vec(),
            iv: vec![0u8; 16],
            data: Vec::new(),
            control: Some(KeyControlData {
                block: control,
                iv: Vec::new(),
            }),
        }];

        let err = session
            .load_keys(b"license-body", &signature, &[], &[], &keys)
            .expect_err("nonce mismatch");
        assert!(matches!(err, Error::InvalidNonce(_)));
    }

    #[test]
    fn secure_dest_downgrades_to_clear_without_support() {
        let sw = Arc::new(FakeSecureEngine::new(SecurityLevel::L3));
        let set = set_with(vec![sw.clone()]);
        let mut session = set.open(RequestedLevel::Default).expect("open");

        session.rederive(b"message").expect("derive");
        let request = DecryptRequest {
            key_id: b"",
            iv: &[0u8; 16],
            data: b"cleartext",
            is_encrypted: false,
            dest: BufferKind::Secure,
        };
        // software tier cannot emit secure buffers; classification caches Clear
        session.decrypt(&request).expect("decrypt");
        assert_eq!(session.dest, Some(BufferKind::Clear));
    }
}
