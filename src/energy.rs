//! Trapezoidal Wh energy integrator, persisted through a [`KvStore`]
//! collaborator the same way the original `storage/` module persisted
//! counters to NVS.

use crate::collaborators::KvStore;
use crate::error::{Error, Result};

const STORAGE_KEY: &str = "energy_counters_v1";
const MS_PER_HOUR: f64 = 3_600_000.0;

/// Monotonically non-decreasing energy counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyCounters {
    pub charged_wh: f64,
    pub discharged_wh: f64,
    pub last_update_ms: Option<u64>,
}

impl Default for EnergyCounters {
    fn default() -> Self {
        Self {
            charged_wh: 0.0,
            discharged_wh: 0.0,
            last_update_ms: None,
        }
    }
}

/// Integrates pack voltage/current samples into Wh counters.
#[derive(Debug, Default)]
pub struct EnergyIntegrator {
    counters: EnergyCounters,
}

impl EnergyIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> EnergyCounters {
        self.counters
    }

    /// Advances the integrator with one telemetry sample.
    /// Non-finite readings, non-positive voltage and non-positive `dt` are
    /// silently discarded; only the first call after construction records
    /// `last_update_ms` without integrating (no prior sample to form a
    /// trapezoid against).
    pub fn sample(&mut self, voltage_v: f32, current_a: f32, now_ms: u64) {
        let Some(last) = self.counters.last_update_ms else {
            self.counters.last_update_ms = Some(now_ms);
            return;
        };

        if now_ms <= last {
            return;
        }

        if !voltage_v.is_finite() || !current_a.is_finite() || voltage_v < 0.1 {
            self.counters.last_update_ms = Some(now_ms);
            return;
        }

        let dt_h = (now_ms - last) as f64 / MS_PER_HOUR;
        let power_w = voltage_v as f64 * current_a as f64;

        if power_w >= 0.0 {
            self.counters.charged_wh += power_w * dt_h;
        } else {
            self.counters.discharged_wh += -power_w * dt_h;
        }

        self.counters.charged_wh = self.counters.charged_wh.max(0.0);
        self.counters.discharged_wh = self.counters.discharged_wh.max(0.0);
        self.counters.last_update_ms = Some(now_ms);
    }

    /// Resets in-memory counters to zero without touching persisted state.
    pub fn reset(&mut self) {
        self.counters = EnergyCounters::default();
    }

    /// Persists the counters through `store`.
    pub fn persist(&self, store: &mut dyn KvStore) -> Result<()> {
        let encoded = serde_json::to_vec(&PersistedCounters::from(self.counters))
            .map_err(|e| Error::PersistenceError(e.to_string()))?;
        store.set(STORAGE_KEY, &encoded)
    }

    /// Restores counters from `store`. A missing key is treated as zero.
    /// Corrupted or incompatible persisted bytes are also treated as zero
    /// rather than failing: a single bad record in storage should not turn
    /// into a hard startup error.
    pub fn restore(&mut self, store: &dyn KvStore) -> Result<()> {
        match store.get(STORAGE_KEY)? {
            Some(bytes) => match serde_json::from_slice::<PersistedCounters>(&bytes) {
                Ok(persisted) => {
                    self.counters = persisted.into();
                    Ok(())
                }
                Err(e) => {
                    log::warn!("energy counters: discarding unreadable persisted state: {e}");
                    self.counters = EnergyCounters::default();
                    Ok(())
                }
            },
            None => {
                self.counters = EnergyCounters::default();
                Ok(())
            }
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedCounters {
    charged_wh: f64,
    discharged_wh: f64,
}

impl From<EnergyCounters> for PersistedCounters {
    fn from(c: EnergyCounters) -> Self {
        Self { charged_wh: c.charged_wh, discharged_wh: c.discharged_wh }
    }
}

impl From<PersistedCounters> for EnergyCounters {
    fn from(p: PersistedCounters) -> Self {
        Self { charged_wh: p.charged_wh, discharged_wh: p.discharged_wh, last_update_ms: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::test_doubles::MemoryKvStore;

    #[test]
    fn first_sample_only_records_timestamp() {
        let mut integrator = EnergyIntegrator::new();
        integrator.sample(52.0, 20.0, 1_000);
        assert_eq!(integrator.counters().charged_wh, 0.0);
        assert_eq!(integrator.counters().discharged_wh, 0.0);
    }

    #[test]
    fn ten_minutes_at_52v_20a_charges_about_173_33_wh() {
        let mut integrator = EnergyIntegrator::new();
        integrator.sample(52.0, 20.0, 0);
        integrator.sample(52.0, 20.0, 10 * 60 * 1000);
        assert!((integrator.counters().charged_wh - 173.333).abs() < 0.01);
        assert_eq!(integrator.counters().discharged_wh, 0.0);
    }

    #[test]
    fn negative_power_accumulates_discharged_wh() {
        let mut integrator = EnergyIntegrator::new();
        integrator.sample(51.0, -10.0, 0);
        integrator.sample(51.0, -10.0, 60 * 60 * 1000);
        assert!((integrator.counters().discharged_wh - 510.0).abs() < 0.01);
        assert_eq!(integrator.counters().charged_wh, 0.0);
    }

    #[test]
    fn non_finite_or_low_voltage_samples_are_discarded() {
        let mut integrator = EnergyIntegrator::new();
        integrator.sample(52.0, 20.0, 0);
        integrator.sample(f32::NAN, 20.0, 1_000);
        integrator.sample(0.05, 20.0, 2_000);
        assert_eq!(integrator.counters().charged_wh, 0.0);
    }

    #[test]
    fn persist_then_restore_round_trips_within_tolerance() {
        let mut integrator = EnergyIntegrator::new();
        integrator.sample(52.0, 20.0, 0);
        integrator.sample(52.0, 20.0, 10 * 60 * 1000);
        let expected = integrator.counters().charged_wh;

        let mut store = MemoryKvStore::default();
        integrator.persist(&mut store).unwrap();
        integrator.reset();
        assert_eq!(integrator.counters().charged_wh, 0.0);

        integrator.restore(&store).unwrap();
        assert!((integrator.counters().charged_wh - expected).abs() < 0.01);
    }

    #[test]
    fn restore_with_missing_key_yields_zeroed_counters() {
        let mut integrator = EnergyIntegrator::new();
        let store = MemoryKvStore::default();
        integrator.restore(&store).unwrap();
        assert_eq!(integrator.counters(), EnergyCounters::default());
    }

    #[test]
    fn restore_with_corrupted_bytes_degrades_to_zero_instead_of_failing() {
        let mut integrator = EnergyIntegrator::new();
        let mut store = MemoryKvStore::default();
        store.set(STORAGE_KEY, b"not json").unwrap();
        integrator.restore(&store).unwrap();
        assert_eq!(integrator.counters(), EnergyCounters::default());
    }
}
