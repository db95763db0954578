//! Session registry and policy timer.
//!
//! The engine owns every live session plus the transient sessions driving
//! release handshakes, and is the single entry point for callers. A periodic
//! timer fans policy evaluation out to all sessions; callbacks run
//! synchronously, so listener bodies must not block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{CdmConfig, PropertySet};
use crate::crypto::{
    DecryptRequest, RequestedLevel, SecureEngine, SecureEngineSet, SecurityLevel,
};
use crate::error::{Error, Result};
use crate::init_data::KEY_SYSTEM;
use crate::license::KeyMessage;
use crate::policy::PolicyEvent;
use crate::protocol::LicenseType;
use crate::session::{AddKeyOutcome, ListenerHandle, Session, SessionListener};
use crate::store::{FileStore, LicenseStore};

pub use crate::init_data::extract_system_pssh;

/// Query map keys returned by [`CdmEngine::query_status`].
pub mod status_keys {
    pub const SECURITY_LEVEL: &str = "SecurityLevel";
    pub const OPEN_SESSIONS: &str = "OpenSessions";
    pub const PENDING_RELEASES: &str = "PendingReleases";
}

/// Registry of live sessions and pending release key sets.
pub struct CdmEngine {
    config: Arc<CdmConfig>,
    engines: Arc<SecureEngineSet>,
    files: Arc<dyn FileStore>,
    clock: Arc<dyn Clock>,
    stores: HashMap<SecurityLevel, Arc<LicenseStore>>,
    sessions: HashMap<String, Session>,
    /// Key set id -> transient session driving its release handshake.
    release_sessions: HashMap<String, String>,
    next_sharing_id: u32,
}

impl CdmEngine {
    /// Maximum number of concurrently open sessions.
    pub const MAX_SESSIONS: usize = 16;

    /// Probe the supplied secure engines and build the registry.
    pub fn new(
        config: CdmConfig,
        engines: Vec<Arc<dyn SecureEngine>>,
        files: Arc<dyn FileStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let engines = Arc::new(SecureEngineSet::probe(engines)?);
        Ok(Self {
            config: Arc::new(config),
            engines,
            files,
            clock,
            stores: HashMap::new(),
            sessions: HashMap::new(),
            release_sessions: HashMap::new(),
            next_sharing_id: 0,
        })
    }

    /// Store for one security level, opened (and legacy-migrated) on first
    /// use.
    fn store_for(&mut self, level: SecurityLevel) -> Result<Arc<LicenseStore>> {
        if let Some(store) = self.stores.get(&level) {
            return Ok(store.clone());
        }
        let store = Arc::new(LicenseStore::open(
            self.files.clone(),
            self.config.storage_root.clone(),
            level,
        )?);
        self.stores.insert(level, store.clone());
        Ok(store)
    }

    fn session_level(&self, props: &PropertySet) -> SecurityLevel {
        match props.security_level.unwrap_or_default() {
            RequestedLevel::L3 => SecurityLevel::L3,
            RequestedLevel::Default => self.engines.preferred_level(),
        }
    }

    fn new_session_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Open a session for the given key system.
    pub fn open_session(
        &mut self,
        key_system: &str,
        license_type: LicenseType,
        props: PropertySet,
    ) -> Result<String> {
        if key_system != KEY_SYSTEM {
            return Err(Error::UnsupportedKeySystem(key_system.to_string()));
        }
        if self.sessions.len() >= Self::MAX_SESSIONS {
            return Err(Error::TooManySessions {
                max: Self::MAX_SESSIONS,
            });
        }

        let sharing_id = if props.session_sharing {
            self.next_sharing_id += 1;
            Some(self.next_sharing_id)
        } else {
            None
        };

        let store = self.store_for(self.session_level(&props))?;
        let id = Self::new_session_id();
        let session = Session::new(
            id.clone(),
            license_type,
            &props,
            self.config.clone(),
            self.engines.clone(),
            store,
            self.clock.clone(),
            sharing_id,
        )?;
        log::debug!("opened session {} ({})", id, license_type.as_str());
        self.sessions.insert(id.clone(), session);
        Ok(id)
    }

    /// Destroy a session. Attached listeners detach implicitly.
    pub fn close_session(&mut self, session_id: &str) -> Result<()> {
        let mut session = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| Error::InvalidSession(session_id.to_string()))?;
        self.release_sessions.retain(|_, sid| sid != session_id);
        session.cancel_key_request()
    }

    fn session_mut(&mut self, session_id: &str) -> Result<&mut Session> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::InvalidSession(session_id.to_string()))
    }

    fn session(&self, session_id: &str) -> Result<&Session> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| Error::InvalidSession(session_id.to_string()))
    }

    pub fn generate_key_request(
        &mut self,
        session_id: &str,
        init_data: Option<&[u8]>,
        app_params: &HashMap<String, String>,
    ) -> Result<KeyMessage> {
        self.session_mut(session_id)?
            .generate_key_request(init_data, app_params)
    }

    pub fn generate_renewal_request(&mut self, session_id: &str) -> Result<KeyMessage> {
        self.session_mut(session_id)?.generate_renewal_request()
    }

    pub fn add_key(&mut self, session_id: &str, response: &[u8]) -> Result<AddKeyOutcome> {
        self.session_mut(session_id)?.add_key(response)
    }

    pub fn restore_offline_session(&mut self, session_id: &str, key_set_id: &str) -> Result<()> {
        self.session_mut(session_id)?
            .restore_offline_session(key_set_id)
    }

    pub fn cancel_key_request(&mut self, session_id: &str) -> Result<()> {
        self.session_mut(session_id)?.cancel_key_request()
    }

    pub fn select_key(&mut self, session_id: &str, key_id: &[u8]) -> Result<()> {
        self.session_mut(session_id)?.select_key(key_id)
    }

    pub fn decrypt(&mut self, session_id: &str, request: &DecryptRequest) -> Result<Vec<u8>> {
        self.session_mut(session_id)?.decrypt(request)
    }

    pub fn attach_listener(
        &mut self,
        session_id: &str,
        listener: Arc<dyn SessionListener>,
    ) -> Result<ListenerHandle> {
        Ok(self.session_mut(session_id)?.attach_listener(listener))
    }

    pub fn detach_listener(&mut self, session_id: &str, handle: ListenerHandle) -> Result<bool> {
        Ok(self.session_mut(session_id)?.detach_listener(handle))
    }

    /// Begin releasing a persisted license.
    ///
    /// Spins a transient release session, marks the record as releasing, and
    /// returns the signed release request to deliver to the server. The
    /// matching response goes to [`CdmEngine::release_offline_license`].
    pub fn remove_offline_license(&mut self, key_set_id: &str) -> Result<KeyMessage> {
        if self.release_sessions.contains_key(key_set_id) {
            return Err(Error::Unknown(format!(
                "Key set {} is already being released",
                key_set_id
            )));
        }

        // records only ever live at the preferred tier or the L3 override
        let mut found = None;
        for level in [self.engines.preferred_level(), SecurityLevel::L3] {
            let store = self.store_for(level)?;
            if store.license_exists(key_set_id) {
                found = Some((level, store));
                break;
            }
        }
        let (level, store) =
            found.ok_or_else(|| Error::InvalidKeySet(key_set_id.to_string()))?;

        let props = PropertySet {
            security_level: (level == SecurityLevel::L3).then_some(RequestedLevel::L3),
            ..PropertySet::default()
        };
        let id = Self::new_session_id();
        let mut session = Session::new(
            id.clone(),
            LicenseType::Release,
            &props,
            self.config.clone(),
            self.engines.clone(),
            store,
            self.clock.clone(),
            None,
        )?;
        let message = session.begin_release(key_set_id)?;

        log::debug!("session {}: releasing key set {}", id, key_set_id);
        self.sessions.insert(id.clone(), session);
        self.release_sessions.insert(key_set_id.to_string(), id);
        Ok(message)
    }

    /// Complete a release handshake.
    ///
    /// Deletes the persisted record, notifies any still-open session bound to
    /// the key set, and drops the transient release session.
    pub fn release_offline_license(&mut self, key_set_id: &str, response: &[u8]) -> Result<()> {
        let release_id = self
            .release_sessions
            .get(key_set_id)
            .cloned()
            .ok_or_else(|| Error::InvalidKeySet(key_set_id.to_string()))?;

        let store = {
            let session = self
                .sessions
                .get_mut(&release_id)
                .ok_or_else(|| Error::InvalidSession(release_id.clone()))?;
            session.add_key(response)?;
            session.store()
        };
        store.remove_license(key_set_id)?;

        self.release_sessions.remove(key_set_id);
        if let Some(mut session) = self.sessions.remove(&release_id) {
            let _ = session.cancel_key_request();
        }
        for session in self.sessions.values_mut() {
            session.on_key_set_released(key_set_id);
        }
        Ok(())
    }

    /// Evaluate policy windows for every live session.
    ///
    /// Fan-out is synchronous; listener callbacks delay delivery to
    /// subsequent sessions.
    pub fn on_timer_event(&mut self) -> Vec<(String, PolicyEvent)> {
        let now = self.clock.now();
        let mut events = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            if let Some(event) = session.on_timer(now) {
                events.push((id.clone(), event));
            }
        }
        events
    }

    /// Tear down every session. Used during error recovery.
    pub fn cancel_sessions(&mut self) {
        for (id, session) in self.sessions.iter_mut() {
            if let Err(e) = session.cancel_key_request() {
                log::warn!("session {}: close during cancel failed: {}", id, e);
            }
        }
        self.sessions.clear();
        self.release_sessions.clear();
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Engine status as a string-keyed map.
    pub fn query_status(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(
            status_keys::SECURITY_LEVEL.to_string(),
            self.engines.preferred_level().as_str().to_string(),
        );
        map.insert(
            status_keys::OPEN_SESSIONS.to_string(),
            self.sessions.len().to_string(),
        );
        map.insert(
            status_keys::PENDING_RELEASES.to_string(),
            self.release_sessions.len().to_string(),
        );
        map
    }

    pub fn query_session_status(&self, session_id: &str) -> Result<HashMap<String, String>> {
        Ok(self.session(session_id)?.query_status())
    }

    pub fn query_key_status(&self, session_id: &str) -> Result<HashMap<String, String>> {
        self.session(session_id)?.query_key_status()
    }

    pub fn query_key_control_status(
        &self,
        session_id: &str,
        key_id: &[u8],
    ) -> Result<HashMap<String, String>> {
        self.session(session_id)?.query_key_control_status(key_id)
    }
}

impl std::fmt::Debug for CdmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdmEngine")
            .field("sessions", &self.sessions.len())
            .field("release_sessions", &self.release_sessions.len())
            .finish()
    }
}

/// Dedicated thread driving [`CdmEngine::on_timer_event`] at a fixed
/// interval for hosts that want the engine to own the cadence.
pub struct PolicyTimer {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl PolicyTimer {
    /// Start ticking. Stopping (or dropping) joins the timer thread; the
    /// latency of a stop is bounded by `interval`.
    pub fn start(engine: Arc<Mutex<CdmEngine>>, interval: Duration) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("cdm-policy-timer".to_string())
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Ok(mut engine) = engine.lock() {
                        engine.on_timer_event();
                    }
                }
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PolicyTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::clock::ManualClock;
    use crate::store::MemoryFileStore;
    use crate::testutil::{server_policy, FakeSecureEngine, TestServer};

    const T0: u64 = 50_000;

    fn engine_with_clock(clock: Arc<ManualClock>) -> CdmEngine {
        let fake = Arc::new(FakeSecureEngine::new(SecurityLevel::L3));
        let config = CdmConfig {
            license_server_url: "https://license.test/".to_string(),
            ..CdmConfig::default()
        };
        CdmEngine::new(
            config,
            vec![fake as Arc<dyn SecureEngine>],
            Arc::new(MemoryFileStore::default()),
            clock,
        )
        .expect("engine")
    }

    fn engine() -> (CdmEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at(T0));
        (engine_with_clock(clock.clone()), clock)
    }

    fn key_id() -> Vec<u8> {
        b"content-key-0001".to_vec()
    }

    fn grant(engine: &mut CdmEngine, session_id: &str, version: i32, start: u64) -> AddKeyOutcome {
        let message = engine
            .generate_key_request(session_id, Some(b"pssh-payload"), &HashMap::new())
            .expect("request");
        let response = TestServer::license_response(
            &message.message,
            &server_policy(),
            &[(key_id(), [0x42u8; 16])],
            version,
            start,
        );
        engine.add_key(session_id, &response).expect("add key")
    }

    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<(String, PolicyEvent)>>,
    }

    impl SessionListener for Recorder {
        fn on_policy_event(&self, session_id: &str, event: PolicyEvent) {
            self.events
                .lock()
                .expect("lock")
                .push((session_id.to_string(), event));
        }
    }

    #[test]
    fn open_validates_the_key_system() {
        let (mut engine, _clock) = engine();
        assert!(matches!(
            engine.open_session("com.example.drm", LicenseType::Streaming, PropertySet::default()),
            Err(Error::UnsupportedKeySystem(_))
        ));

        let id = engine
            .open_session(KEY_SYSTEM, LicenseType::Streaming, PropertySet::default())
            .expect("open");
        assert_eq!(engine.open_sessions(), 1);
        engine.close_session(&id).expect("close");
        assert_eq!(engine.open_sessions(), 0);
        assert!(matches!(
            engine.close_session(&id),
            Err(Error::InvalidSession(_))
        ));
    }

    #[test]
    fn session_count_is_bounded() {
        let (mut engine, _clock) = engine();
        for _ in 0..CdmEngine::MAX_SESSIONS {
            engine
                .open_session(KEY_SYSTEM, LicenseType::Streaming, PropertySet::default())
                .expect("open");
        }
        assert!(matches!(
            engine.open_session(KEY_SYSTEM, LicenseType::Streaming, PropertySet::default()),
            Err(Error::TooManySessions { .. })
        ));
    }

    #[test]
    fn sharing_ids_are_assigned_on_request() {
        let (mut engine, _clock) = engine();
        let plain = engine
            .open_session(KEY_SYSTEM, LicenseType::Streaming, PropertySet::default())
            .expect("open");
        let shared = engine
            .open_session(
                KEY_SYSTEM,
                LicenseType::Streaming,
                PropertySet {
                    session_sharing: true,
                    ..PropertySet::default()
                },
            )
            .expect("open");

        let plain_status = engine.query_session_status(&plain).expect("status");
        let shared_status = engine.query_session_status(&shared).expect("status");
        assert_eq!(plain_status[crate::session::status_keys::SHARING_ID], "");
        assert_eq!(shared_status[crate::session::status_keys::SHARING_ID], "1");
    }

    #[test]
    fn timer_fans_out_to_every_session() {
        let (mut engine, clock) = engine();
        let first = engine
            .open_session(KEY_SYSTEM, LicenseType::Streaming, PropertySet::default())
            .expect("open");
        let second = engine
            .open_session(KEY_SYSTEM, LicenseType::Streaming, PropertySet::default())
            .expect("open");
        grant(&mut engine, &first, 1, T0);
        grant(&mut engine, &second, 1, T0);

        clock.set(T0 + 4_000);
        let mut events = engine.on_timer_event();
        events.sort_by(|a, b| a.0.cmp(&b.0));
        let mut expected = vec![
            (first, PolicyEvent::LicenseExpired),
            (second, PolicyEvent::LicenseExpired),
        ];
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(events, expected);

        // expired sessions stay quiet afterwards
        clock.advance(10);
        assert!(engine.on_timer_event().is_empty());
    }

    #[test]
    fn release_handshake_removes_the_record_and_notifies() {
        let (mut engine, _clock) = engine();
        let owner = engine
            .open_session(KEY_SYSTEM, LicenseType::Offline, PropertySet::default())
            .expect("open");
        let outcome = grant(&mut engine, &owner, 1, T0);
        let key_set_id = match outcome {
            AddKeyOutcome::Added {
                key_set_id: Some(id),
            } => id,
            other => panic!("unexpected outcome {:?}", other),
        };

        let recorder = Arc::new(Recorder::default());
        engine
            .attach_listener(&owner, recorder.clone())
            .expect("attach");

        let message = engine
            .remove_offline_license(&key_set_id)
            .expect("release request");
        assert_eq!(engine.query_status()[status_keys::PENDING_RELEASES], "1");
        // a second release of the same key set is refused while pending
        assert!(engine.remove_offline_license(&key_set_id).is_err());

        let response = TestServer::release_response(&message.message, 2);
        engine
            .release_offline_license(&key_set_id, &response)
            .expect("release");

        assert_eq!(engine.query_status()[status_keys::PENDING_RELEASES], "0");
        assert!(matches!(
            engine.remove_offline_license(&key_set_id),
            Err(Error::InvalidKeySet(_))
        ));
        assert_eq!(
            recorder.events.lock().expect("lock").as_slice(),
            &[(owner.clone(), PolicyEvent::LicenseExpired)]
        );
        // the transient release session is gone; only the owner remains
        assert_eq!(engine.open_sessions(), 1);
    }

    #[test]
    fn restore_through_the_registry() {
        let (mut engine, _clock) = engine();
        let owner = engine
            .open_session(KEY_SYSTEM, LicenseType::Offline, PropertySet::default())
            .expect("open");
        let outcome = grant(&mut engine, &owner, 1, T0);
        let key_set_id = match outcome {
            AddKeyOutcome::Added {
                key_set_id: Some(id),
            } => id,
            other => panic!("unexpected outcome {:?}", other),
        };
        engine.close_session(&owner).expect("close");

        let restored = engine
            .open_session(KEY_SYSTEM, LicenseType::Offline, PropertySet::default())
            .expect("open");
        engine
            .restore_offline_session(&restored, &key_set_id)
            .expect("restore");
        let keys = engine.query_key_status(&restored).expect("key status");
        assert_eq!(keys[crate::policy::query_keys::PLAY_ALLOWED], "true");
    }

    #[test]
    fn cancel_sessions_clears_the_registry() {
        let (mut engine, _clock) = engine();
        for _ in 0..3 {
            engine
                .open_session(KEY_SYSTEM, LicenseType::Streaming, PropertySet::default())
                .expect("open");
        }
        engine.cancel_sessions();
        assert_eq!(engine.open_sessions(), 0);
        assert_eq!(engine.query_status()[status_keys::OPEN_SESSIONS], "0");
    }

    #[test]
    fn policy_timer_drives_expiry() {
        let clock = Arc::new(ManualClock::at(T0));
        let engine = Arc::new(Mutex::new(engine_with_clock(clock.clone())));
        let recorder = Arc::new(Recorder::default());

        {
            let mut engine = engine.lock().expect("lock");
            let id = engine
                .open_session(KEY_SYSTEM, LicenseType::Streaming, PropertySet::default())
                .expect("open");
            grant(&mut engine, &id, 1, T0);
            engine.attach_listener(&id, recorder.clone()).expect("attach");
        }

        clock.set(T0 + 4_000);
        let timer = PolicyTimer::start(engine, Duration::from_millis(5)).expect("timer");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while recorder.events.lock().expect("lock").is_empty() {
            assert!(std::time::Instant::now() < deadline, "timer never fired");
            std::thread::sleep(Duration::from_millis(5));
        }
        timer.stop();

        let events = recorder.events.lock().expect("lock");
        assert_eq!(events[0].1, PolicyEvent::LicenseExpired);
    }
}
