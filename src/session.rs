//! Per-session orchestration.
//!
//! A session ties one license handler, one policy engine, and one open crypto
//! session into a single lifecycle. Operations on one session must be
//! serialized by the caller; operations across different sessions may proceed
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{CdmConfig, PropertySet};
use crate::crypto::{CryptoSession, DecryptRequest, RequestedLevel, SecureEngineSet};
use crate::error::{Error, Result};
use crate::license::{KeyMessage, LicenseHandler, ResponseOutcome};
use crate::policy::{PolicyEngine, PolicyEvent};
use crate::protocol::{LicenseState, LicenseType, MessageType, StoredLicense};
use crate::store::LicenseStore;

/// Query map keys returned by [`Session::query_status`].
pub mod status_keys {
    pub const LICENSE_TYPE: &str = "LicenseType";
    pub const SECURITY_LEVEL: &str = "SecurityLevel";
    pub const LICENSE_RECEIVED: &str = "LicenseReceived";
    pub const NEEDS_REINITIALIZATION: &str = "NeedsReinitialization";
    pub const KEY_SET_ID: &str = "KeySetId";
    pub const SHARING_ID: &str = "SharingId";
    pub const APP_ID: &str = "AppId";
    pub const DEVICE_UNIQUE_ID: &str = "DeviceUniqueId";
}

/// Query map keys returned by [`Session::query_key_control_status`].
pub mod key_control_keys {
    pub const KEY_ID: &str = "KeyId";
    pub const LOADED: &str = "Loaded";
}

/// Subscriber for per-session policy events.
///
/// Delivery order across subscribers of one session is unspecified.
pub trait SessionListener: Send + Sync {
    fn on_policy_event(&self, session_id: &str, event: PolicyEvent);
}

/// Handle returned by [`Session::attach_listener`].
pub type ListenerHandle = u64;

/// Result of feeding a server response into [`Session::add_key`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddKeyOutcome {
    /// Keys were verified and installed. Offline grants carry the freshly
    /// persisted key set id.
    Added { key_set_id: Option<String> },
    /// A service certificate was installed instead of a license; the caller
    /// must re-issue the original key request.
    NeedKeyRequest,
}

/// Blobs exchanged for an offline license, cached so the persisted record can
/// be rebuilt after each exchange.
#[derive(Debug, Clone, Default)]
struct OfflineRecordCache {
    pssh: Vec<u8>,
    request: Vec<u8>,
    response: Vec<u8>,
    renewal_request: Vec<u8>,
    renewal: Vec<u8>,
    release_url: String,
}

impl OfflineRecordCache {
    fn from_record(record: &StoredLicense) -> Self {
        Self {
            pssh: record.pssh_data.clone().unwrap_or_default(),
            request: record.license_request.clone().unwrap_or_default(),
            response: record.license.clone().unwrap_or_default(),
            renewal_request: record.renewal_request.clone().unwrap_or_default(),
            renewal: record.renewal.clone().unwrap_or_default(),
            release_url: record.release_server_url.clone().unwrap_or_default(),
        }
    }

    fn to_record(&self) -> StoredLicense {
        StoredLicense {
            state: Some(LicenseState::Active as i32),
            pssh_data: Some(self.pssh.clone()),
            license_request: Some(self.request.clone()),
            license: Some(self.response.clone()),
            renewal_request: Some(self.renewal_request.clone()),
            renewal: Some(self.renewal.clone()),
            release_server_url: Some(self.release_url.clone()),
        }
    }
}

/// One live CDM session.
pub struct Session {
    id: String,
    license_type: LicenseType,
    sharing_id: Option<u32>,
    app_id: String,
    requested_level: RequestedLevel,
    config: Arc<CdmConfig>,
    engines: Arc<SecureEngineSet>,
    store: Arc<LicenseStore>,
    clock: Arc<dyn Clock>,
    crypto: CryptoSession,
    handler: LicenseHandler,
    policy: PolicyEngine,
    license_received: bool,
    needs_reinit: bool,
    key_set_id: Option<String>,
    offline: OfflineRecordCache,
    listeners: HashMap<ListenerHandle, Arc<dyn SessionListener>>,
    next_listener: ListenerHandle,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        license_type: LicenseType,
        props: &PropertySet,
        config: Arc<CdmConfig>,
        engines: Arc<SecureEngineSet>,
        store: Arc<LicenseStore>,
        clock: Arc<dyn Clock>,
        sharing_id: Option<u32>,
    ) -> Result<Self> {
        let requested_level = props.security_level.unwrap_or_default();
        let crypto = engines.open(requested_level)?;
        let handler = Self::build_handler(&config, &store, &crypto);
        let policy = PolicyEngine::new(config.begin_usage_on_receipt);

        Ok(Self {
            id,
            license_type,
            sharing_id,
            app_id: props.app_id.clone(),
            requested_level,
            config,
            engines,
            store,
            clock,
            crypto,
            handler,
            policy,
            license_received: false,
            needs_reinit: false,
            key_set_id: None,
            offline: OfflineRecordCache::default(),
            listeners: HashMap::new(),
            next_listener: 1,
        })
    }

    fn build_handler(
        config: &CdmConfig,
        store: &LicenseStore,
        crypto: &CryptoSession,
    ) -> LicenseHandler {
        // certificate identity sends the provisioned certificate as the
        // token; until provisioning completes the token stays empty and the
        // request path reports the missing record before anything is sent
        let token = if config.certificate_identity {
            store
                .load_certificate()
                .ok()
                .and_then(|c| c.certificate)
                .unwrap_or_default()
        } else {
            crypto.token().unwrap_or_default()
        };
        LicenseHandler::new(
            token,
            config.properties.client_info(),
            config.privacy_mode,
            config.license_server_url.clone(),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn license_type(&self) -> LicenseType {
        self.license_type
    }

    /// Key set id of the persisted license this session is bound to, if any.
    pub fn key_set_id(&self) -> Option<&str> {
        self.key_set_id.as_deref()
    }

    pub fn is_key_loaded(&self, key_id: &[u8]) -> bool {
        self.handler.is_key_loaded(key_id)
    }

    pub fn can_decrypt(&self) -> bool {
        self.policy.can_decrypt()
    }

    pub(crate) fn store(&self) -> Arc<LicenseStore> {
        self.store.clone()
    }

    /// Discard the crypto session and license handler and attach fresh ones.
    ///
    /// The old pair is fully discarded before the new one is attached; a
    /// failure to open the new crypto session leaves the session flagged for
    /// another attempt.
    fn reinitialize(&mut self) -> Result<()> {
        self.crypto.close()?;
        self.needs_reinit = true;

        let crypto = self.engines.open(self.requested_level)?;
        let handler = Self::build_handler(&self.config, &self.store, &crypto);
        self.crypto = crypto;
        self.handler = handler;
        self.policy = PolicyEngine::new(self.config.begin_usage_on_receipt);
        self.license_received = false;
        self.needs_reinit = false;
        log::debug!("session {}: reinitialized", self.id);
        Ok(())
    }

    /// Build the next outbound key request for this session.
    ///
    /// Release-type sessions always produce a release request. Sessions that
    /// already hold a license route to renewal unless the deployment requires
    /// the caller to request renewal explicitly.
    pub fn generate_key_request(
        &mut self,
        init_data: Option<&[u8]>,
        app_params: &HashMap<String, String>,
    ) -> Result<KeyMessage> {
        if self.needs_reinit {
            self.reinitialize()?;
        }
        let now = self.clock.now();

        if self.license_type == LicenseType::Release {
            return self
                .handler
                .prepare_key_update_request(&mut self.crypto, false, &self.policy, now);
        }

        if self.license_received {
            if self.config.require_explicit_renewal {
                return Err(Error::Unknown(
                    "License already received; renewal must be requested explicitly".to_string(),
                ));
            }
            return self.generate_renewal_request();
        }

        if self.config.certificate_identity {
            self.load_certificate_key()?;
        }

        let message = self.handler.prepare_key_request(
            &mut self.crypto,
            init_data,
            self.license_type,
            app_params,
            &self.id,
            now,
        )?;

        if self.license_type == LicenseType::Offline
            && message.message_type == MessageType::LicenseRequest
        {
            if let Some(data) = init_data {
                self.offline.pssh = data.to_vec();
            }
            self.offline.request = message.message.clone();
        }
        Ok(message)
    }

    /// Build a renewal request referencing the current license.
    pub fn generate_renewal_request(&mut self) -> Result<KeyMessage> {
        if !self.license_received {
            return Err(Error::Unknown(
                "No license to renew on this session".to_string(),
            ));
        }
        let now = self.clock.now();
        let message =
            self.handler
                .prepare_key_update_request(&mut self.crypto, true, &self.policy, now)?;
        if self.license_type == LicenseType::Offline {
            self.offline.renewal_request = message.message.clone();
        }
        Ok(message)
    }

    /// Load the provisioned wrapped private key into the crypto session.
    ///
    /// Failure flags the session for reinitialization and reports a
    /// provisioning problem rather than a hard error.
    fn load_certificate_key(&mut self) -> Result<()> {
        let wrapped = self
            .store
            .load_certificate()
            .ok()
            .and_then(|c| c.wrapped_private_key)
            .unwrap_or_default();
        let loaded = if wrapped.is_empty() {
            Err(Error::NeedProvisioning(
                "No wrapped private key on record".to_string(),
            ))
        } else {
            self.crypto.load_wrapped_private_key(&wrapped)
        };

        loaded.map_err(|e| {
            self.needs_reinit = true;
            Error::NeedProvisioning(format!("Device certificate key unavailable: {}", e))
        })
    }

    /// Feed a server response into the session.
    pub fn add_key(&mut self, response: &[u8]) -> Result<AddKeyOutcome> {
        let now = self.clock.now();

        if self.license_type == LicenseType::Release {
            self.handler.handle_key_update_response(
                &mut self.crypto,
                &mut self.policy,
                false,
                response,
                now,
            )?;
            return Ok(AddKeyOutcome::Added {
                key_set_id: self.key_set_id.clone(),
            });
        }

        if self.license_received {
            self.handler.handle_key_update_response(
                &mut self.crypto,
                &mut self.policy,
                true,
                response,
                now,
            )?;
            if self.license_type == LicenseType::Offline {
                self.offline.renewal = response.to_vec();
                self.persist_offline()?;
            }
            return Ok(AddKeyOutcome::Added {
                key_set_id: self.key_set_id.clone(),
            });
        }

        match self
            .handler
            .handle_key_response(&mut self.crypto, &mut self.policy, response, now)?
        {
            ResponseOutcome::NeedKeyRequest => Ok(AddKeyOutcome::NeedKeyRequest),
            ResponseOutcome::KeysLoaded => {
                self.license_received = true;
                if self.license_type == LicenseType::Offline {
                    self.offline.response = response.to_vec();
                    let key_set_id = self.generate_key_set_id();
                    self.key_set_id = Some(key_set_id);
                    if let Err(e) = self.persist_offline() {
                        // a half-persisted offline license must never be
                        // handed back to the caller
                        log::warn!("session {}: offline persist failed: {}", self.id, e);
                        self.key_set_id = None;
                        let _ = self.crypto.close();
                        self.needs_reinit = true;
                        return Err(e);
                    }
                }
                Ok(AddKeyOutcome::Added {
                    key_set_id: self.key_set_id.clone(),
                })
            }
        }
    }

    /// Rebuild this session's key and policy state from a persisted license
    /// without contacting the server.
    pub fn restore_offline_session(&mut self, key_set_id: &str) -> Result<()> {
        let record = self.store.load_license(key_set_id)?;
        if record.state != Some(LicenseState::Active as i32) {
            return Err(Error::InvalidKeySet(format!(
                "Key set {} is not active",
                key_set_id
            )));
        }

        if self.config.certificate_identity {
            self.load_certificate_key()?;
        }

        let cache = OfflineRecordCache::from_record(&record);
        self.handler.restore_offline_license(
            &mut self.crypto,
            &mut self.policy,
            &cache.request,
            &cache.response,
            &cache.renewal,
            self.clock.now(),
        )?;

        self.offline = cache;
        self.license_received = true;
        self.key_set_id = Some(key_set_id.to_string());
        Ok(())
    }

    /// Rebuild state from a persisted record and produce the signed release
    /// request, marking the record as releasing first.
    ///
    /// Unlike [`Session::restore_offline_session`] this accepts records
    /// already in the releasing state, so an interrupted release handshake
    /// can be retried.
    pub(crate) fn begin_release(&mut self, key_set_id: &str) -> Result<KeyMessage> {
        let record = self.store.load_license(key_set_id)?;
        let cache = OfflineRecordCache::from_record(&record);
        let now = self.clock.now();

        self.handler.restore_offline_license(
            &mut self.crypto,
            &mut self.policy,
            &cache.request,
            &cache.response,
            &cache.renewal,
            now,
        )?;
        self.offline = cache;
        self.license_received = true;
        self.key_set_id = Some(key_set_id.to_string());

        let mut record = record;
        record.state = Some(LicenseState::Releasing as i32);
        self.store.store_license(key_set_id, &record)?;

        self.handler
            .prepare_key_update_request(&mut self.crypto, false, &self.policy, now)
    }

    /// Abandon the in-flight key request. Closes the crypto session; the next
    /// request reinitializes. No persistence side effects.
    pub fn cancel_key_request(&mut self) -> Result<()> {
        self.crypto.close()?;
        self.needs_reinit = true;
        Ok(())
    }

    pub fn select_key(&mut self, key_id: &[u8]) -> Result<()> {
        self.crypto.select_key(key_id)
    }

    /// Decrypt one buffer region.
    ///
    /// Opaque engine failures are re-checked against the policy windows and
    /// reported as a key re-request when a window has in fact expired.
    pub fn decrypt(&mut self, request: &DecryptRequest) -> Result<Vec<u8>> {
        let now = self.clock.now();
        if !self.policy.can_decrypt() {
            return Err(Error::NeedKey(
                "Decryption is not currently permitted".to_string(),
            ));
        }
        self.policy.begin_decryption(now);

        match self.crypto.decrypt(request) {
            Err(Error::Unknown(_)) if self.policy.has_expired_window(now) => {
                Err(Error::NeedKey(format!(
                    "License window expired for key {}",
                    hex::encode(request.key_id)
                )))
            }
            other => other,
        }
    }

    pub fn attach_listener(&mut self, listener: Arc<dyn SessionListener>) -> ListenerHandle {
        let handle = self.next_listener;
        self.next_listener += 1;
        self.listeners.insert(handle, listener);
        handle
    }

    pub fn detach_listener(&mut self, handle: ListenerHandle) -> bool {
        self.listeners.remove(&handle).is_some()
    }

    /// Evaluate policy windows at `now` and broadcast any event.
    pub(crate) fn on_timer(&mut self, now: u64) -> Option<PolicyEvent> {
        let event = self.policy.on_timer_event(now)?;
        self.notify(event);
        Some(event)
    }

    /// Another caller released the persisted license this session is bound
    /// to; notify listeners that the keys are gone.
    pub(crate) fn on_key_set_released(&mut self, key_set_id: &str) {
        if self.key_set_id.as_deref() == Some(key_set_id) {
            log::debug!(
                "session {}: bound key set {} was released",
                self.id,
                key_set_id
            );
            self.notify(PolicyEvent::LicenseExpired);
        }
    }

    fn notify(&self, event: PolicyEvent) {
        for listener in self.listeners.values() {
            listener.on_policy_event(&self.id, event);
        }
    }

    /// Session status as a string-keyed map.
    pub fn query_status(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(
            status_keys::LICENSE_TYPE.to_string(),
            self.license_type.as_str().to_string(),
        );
        map.insert(
            status_keys::SECURITY_LEVEL.to_string(),
            self.crypto.security_level().as_str().to_string(),
        );
        map.insert(
            status_keys::LICENSE_RECEIVED.to_string(),
            self.license_received.to_string(),
        );
        map.insert(
            status_keys::NEEDS_REINITIALIZATION.to_string(),
            self.needs_reinit.to_string(),
        );
        map.insert(
            status_keys::KEY_SET_ID.to_string(),
            self.key_set_id.clone().unwrap_or_default(),
        );
        map.insert(
            status_keys::SHARING_ID.to_string(),
            self.sharing_id.map(|v| v.to_string()).unwrap_or_default(),
        );
        map.insert(status_keys::APP_ID.to_string(), self.app_id.clone());
        if let Ok(unique) = self.crypto.device_unique_id() {
            map.insert(
                status_keys::DEVICE_UNIQUE_ID.to_string(),
                hex::encode(unique),
            );
        }
        map
    }

    /// Current policy terms. Fails while no license has been applied.
    pub fn query_key_status(&self) -> Result<HashMap<String, String>> {
        self.policy.query(self.clock.now()).ok_or_else(|| {
            Error::Unknown("No license has been applied to this session".to_string())
        })
    }

    /// Control status of one key as a string-keyed map. Fails while no
    /// license has been applied.
    pub fn query_key_control_status(&self, key_id: &[u8]) -> Result<HashMap<String, String>> {
        if !self.license_received {
            return Err(Error::Unknown(
                "No license has been applied to this session".to_string(),
            ));
        }
        let mut map = HashMap::new();
        map.insert(key_control_keys::KEY_ID.to_string(), hex::encode(key_id));
        map.insert(
            key_control_keys::LOADED.to_string(),
            self.handler.is_key_loaded(key_id).to_string(),
        );
        Ok(map)
    }

    fn persist_offline(&mut self) -> Result<()> {
        let key_set_id = self
            .key_set_id
            .clone()
            .ok_or_else(|| Error::Unknown("No key set id to persist under".to_string()))?;
        self.offline.release_url = self
            .policy
            .renewal_server_url()
            .map(str::to_string)
            .unwrap_or_else(|| self.config.license_server_url.clone());
        self.store
            .store_license(&key_set_id, &self.offline.to_record())
    }

    /// Generate a key set id that does not collide with a persisted record.
    fn generate_key_set_id(&self) -> String {
        loop {
            let id = format!("ks{}", Uuid::new_v4().simple());
            if !self.store.license_exists(&id) {
                return id;
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("license_type", &self.license_type)
            .field("license_received", &self.license_received)
            .field("needs_reinit", &self.needs_reinit)
            .field("key_set_id", &self.key_set_id)
            .finish()
    }
}
