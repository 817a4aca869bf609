//! CVL (Charge Voltage Limit) controller: a finite-state machine deriving
//! CVL/CCL/DCL from live telemetry plus a configuration snapshot. Grounded
//! in `docs/cvl_logic.cpp`'s `computeCvlLimits`, carried over almost
//! unchanged for the Bulk/Transition/FloatApproach/Float/ImbalanceHold
//! branches; `Sustain` and cell-protection clamping extend the same
//! transition function rather than bolting on separate conditionals, so
//! hysteresis stays in one place.

use crate::bus::{CvlState, CvlStateChanged};

fn clamp_non_negative(value: f32) -> f32 {
    value.max(0.0)
}

/// Static CVL configuration snapshot.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CvlConfig {
    pub enabled: bool,
    pub bulk_target_voltage_v: f32,
    /// Nameplate per-cell ceiling; validated by the config manager, not
    /// consumed by this transition function.
    pub cell_max_voltage_v: f32,
    pub bulk_soc_threshold: f32,
    pub transition_soc_threshold: f32,
    pub float_soc_threshold: f32,
    pub float_exit_soc: f32,
    pub float_approach_offset_mv: f32,
    pub float_offset_mv: f32,
    pub minimum_ccl_in_float_a: f32,
    pub imbalance_hold_threshold_mv: u16,
    pub imbalance_release_threshold_mv: u16,
    pub series_cell_count: u16,
    pub cell_safety_enter_v: f32,
    pub cell_safety_release_v: f32,
    pub cell_protection_kp: f32,
    /// Informational nameplate current; consumed by the CAN mapper's
    /// `cvl_dynamic` fallback, not by this transition function.
    pub nominal_current_a: f32,
    pub max_recovery_step_v: f32,
    pub sustain_entry_soc: f32,
    pub sustain_exit_soc: f32,
    pub sustain_voltage_v: f32,
    pub sustain_per_cell_voltage_v: f32,
    pub sustain_ccl_a: f32,
    pub sustain_dcl_a: f32,
    pub imbalance_drop_per_mv: f32,
    pub imbalance_drop_max_v: f32,
}

/// Per-tick inputs.
#[derive(Debug, Clone, Copy)]
pub struct CvlInputs {
    pub soc_percent: f32,
    pub cell_imbalance_mv: u16,
    pub pack_voltage_v: f32,
    pub base_ccl_limit_a: f32,
    pub base_dcl_limit_a: f32,
    pub pack_current_a: f32,
    pub max_cell_voltage_v: f32,
}

/// Per-tick outputs.
#[derive(Debug, Clone, Copy)]
pub struct CvlOutputs {
    pub state: CvlState,
    pub cvl_v: f32,
    pub ccl_a: f32,
    pub dcl_a: f32,
    pub imbalance_hold_active: bool,
    pub cell_protection_active: bool,
}

/// Stateful controller: holds the runtime state that must persist across
/// ticks to express hysteresis (current state, last CVL, cell-protection
/// flag, last state-entry timestamp).
pub struct CvlController {
    state: CvlState,
    last_cvl_v: f32,
    cell_protection_active: bool,
    last_state_entry_ms: u64,
}

impl Default for CvlController {
    fn default() -> Self {
        Self {
            state: CvlState::Bulk,
            // No prior tick to recover from yet: the first real reading
            // must never be rate-limited by `max_recovery_step_v`.
            last_cvl_v: f32::INFINITY,
            cell_protection_active: false,
            last_state_entry_ms: 0,
        }
    }
}

impl CvlController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CvlState {
        self.state
    }

    /// Advances the controller by one tick, returning the computed outputs
    /// and, if the state changed, the event to publish on the bus.
    pub fn update(
        &mut self,
        inputs: &CvlInputs,
        config: &CvlConfig,
        now_ms: u64,
    ) -> (CvlOutputs, Option<CvlStateChanged>) {
        if !config.enabled {
            let outputs = CvlOutputs {
                state: CvlState::Bulk,
                cvl_v: config.bulk_target_voltage_v.max(0.0),
                ccl_a: clamp_non_negative(inputs.base_ccl_limit_a),
                dcl_a: clamp_non_negative(inputs.base_dcl_limit_a),
                imbalance_hold_active: false,
                cell_protection_active: false,
            };
            self.cell_protection_active = false;
            self.last_cvl_v = outputs.cvl_v;
            return (outputs, self.enter_state(CvlState::Bulk, &outputs, now_ms));
        }

        let bulk_target = config.bulk_target_voltage_v.max(0.0);
        let mut float_approach = (bulk_target - config.float_approach_offset_mv / 1000.0).max(0.0);
        let mut float_voltage = (bulk_target - config.float_offset_mv / 1000.0).max(0.0);
        if float_voltage > float_approach {
            std::mem::swap(&mut float_voltage, &mut float_approach);
        }

        let mut imbalance_hold = self.state == CvlState::ImbalanceHold;
        if imbalance_hold {
            if inputs.cell_imbalance_mv <= config.imbalance_release_threshold_mv {
                imbalance_hold = false;
            }
        } else if inputs.cell_imbalance_mv > config.imbalance_hold_threshold_mv {
            imbalance_hold = true;
        }

        let (state, mut cvl, mut ccl, mut dcl) = if imbalance_hold {
            let min_ccl = config.minimum_ccl_in_float_a.max(0.0);
            let ccl = if min_ccl > 0.0 {
                clamp_non_negative(inputs.base_ccl_limit_a).min(min_ccl)
            } else {
                clamp_non_negative(inputs.base_ccl_limit_a)
            };
            (
                CvlState::ImbalanceHold,
                float_approach,
                ccl,
                clamp_non_negative(inputs.base_dcl_limit_a),
            )
        } else {
            let soc = inputs.soc_percent;
            let state = if self.state == CvlState::Sustain && soc < config.sustain_exit_soc {
                CvlState::Sustain
            } else if soc <= config.sustain_entry_soc {
                CvlState::Sustain
            } else if self.state == CvlState::Float && soc >= config.float_exit_soc {
                CvlState::Float
            } else {
                let mut state = CvlState::Bulk;
                if soc >= config.float_soc_threshold {
                    state = CvlState::Float;
                } else if soc >= config.transition_soc_threshold {
                    state = CvlState::FloatApproach;
                } else if soc >= config.bulk_soc_threshold {
                    state = CvlState::Transition;
                }
                if state == CvlState::FloatApproach
                    && self.state == CvlState::FloatApproach
                    && soc + 0.25 < config.transition_soc_threshold
                {
                    state = CvlState::Transition;
                }
                state
            };

            match state {
                CvlState::Bulk | CvlState::Transition => (
                    state,
                    bulk_target,
                    clamp_non_negative(inputs.base_ccl_limit_a),
                    clamp_non_negative(inputs.base_dcl_limit_a),
                ),
                CvlState::FloatApproach => (
                    state,
                    float_approach,
                    clamp_non_negative(inputs.base_ccl_limit_a),
                    clamp_non_negative(inputs.base_dcl_limit_a),
                ),
                CvlState::Float => {
                    let min_ccl = config.minimum_ccl_in_float_a.max(0.0);
                    let ccl = if min_ccl > 0.0 {
                        clamp_non_negative(inputs.base_ccl_limit_a).min(min_ccl)
                    } else {
                        clamp_non_negative(inputs.base_ccl_limit_a)
                    };
                    (state, float_voltage, ccl, clamp_non_negative(inputs.base_dcl_limit_a))
                }
                CvlState::Sustain => {
                    let sustain_cvl = config
                        .sustain_voltage_v
                        .max(config.series_cell_count as f32 * config.sustain_per_cell_voltage_v);
                    (
                        state,
                        sustain_cvl,
                        clamp_non_negative(config.sustain_ccl_a),
                        clamp_non_negative(config.sustain_dcl_a),
                    )
                }
                CvlState::ImbalanceHold => unreachable!("handled in the imbalance_hold branch above"),
            }
        };

        // Cell protection: engage/release hysteresis, then clamp CVL downward,
        // rate-limiting only the recovery (upward) direction per tick.
        let engage = inputs.max_cell_voltage_v >= config.cell_safety_enter_v;
        let release = inputs.max_cell_voltage_v <= config.cell_safety_release_v;
        if self.cell_protection_active {
            if release {
                self.cell_protection_active = false;
            }
        } else if engage {
            self.cell_protection_active = true;
        }

        if self.cell_protection_active {
            let clamp_amount = config.cell_protection_kp
                * (inputs.max_cell_voltage_v - config.cell_safety_enter_v).max(0.0)
                * config.series_cell_count as f32;
            cvl = (cvl - clamp_amount).max(0.0);
        }

        let max_step = config.max_recovery_step_v.max(0.0);
        if max_step > 0.0 && cvl > self.last_cvl_v {
            cvl = cvl.min(self.last_cvl_v + max_step);
        }

        let imbalance_drop = (config.imbalance_drop_per_mv * inputs.cell_imbalance_mv as f32)
            .min(config.imbalance_drop_max_v)
            .max(0.0);
        cvl = (cvl - imbalance_drop).max(0.0);

        ccl = clamp_non_negative(ccl);
        dcl = clamp_non_negative(dcl);

        self.last_cvl_v = cvl;

        let outputs = CvlOutputs {
            state,
            cvl_v: cvl,
            ccl_a: ccl,
            dcl_a: dcl,
            imbalance_hold_active: imbalance_hold,
            cell_protection_active: self.cell_protection_active,
        };

        let event = self.enter_state(state, &outputs, now_ms);
        (outputs, event)
    }

    fn enter_state(
        &mut self,
        new_state: CvlState,
        outputs: &CvlOutputs,
        now_ms: u64,
    ) -> Option<CvlStateChanged> {
        if new_state == self.state {
            return None;
        }
        let previous = self.state;
        let state_duration_ms = now_ms.saturating_sub(self.last_state_entry_ms);
        self.state = new_state;
        self.last_state_entry_ms = now_ms;
        Some(CvlStateChanged {
            previous,
            current: new_state,
            cvl_v: outputs.cvl_v,
            ccl_a: outputs.ccl_a,
            dcl_a: outputs.dcl_a,
            state_duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> CvlConfig {
        CvlConfig {
            enabled: true,
            bulk_target_voltage_v: 58.4,
            cell_max_voltage_v: 3.65,
            bulk_soc_threshold: 10.0,
            transition_soc_threshold: 90.0,
            float_soc_threshold: 95.0,
            float_exit_soc: 90.0,
            float_approach_offset_mv: 1000.0,
            float_offset_mv: 2000.0,
            minimum_ccl_in_float_a: 5.0,
            imbalance_hold_threshold_mv: 200,
            imbalance_release_threshold_mv: 100,
            series_cell_count: 16,
            cell_safety_enter_v: 3.65,
            cell_safety_release_v: 3.60,
            cell_protection_kp: 2.0,
            nominal_current_a: 100.0,
            max_recovery_step_v: 0.5,
            sustain_entry_soc: 5.0,
            sustain_exit_soc: 10.0,
            sustain_voltage_v: 50.0,
            sustain_per_cell_voltage_v: 3.2,
            sustain_ccl_a: 5.0,
            sustain_dcl_a: 10.0,
            imbalance_drop_per_mv: 0.0,
            imbalance_drop_max_v: 0.0,
        }
    }

    fn base_inputs() -> CvlInputs {
        CvlInputs {
            soc_percent: 50.0,
            cell_imbalance_mv: 0,
            pack_voltage_v: 52.0,
            base_ccl_limit_a: 100.0,
            base_dcl_limit_a: 150.0,
            pack_current_a: 0.0,
            max_cell_voltage_v: 3.3,
        }
    }

    #[test]
    fn disabled_controller_passes_through_bulk_target() {
        let mut controller = CvlController::new();
        let config = CvlConfig { enabled: false, ..base_config() };
        let (outputs, _) = controller.update(&base_inputs(), &config, 0);
        assert_eq!(outputs.state, CvlState::Bulk);
        assert!((outputs.cvl_v - config.bulk_target_voltage_v).abs() < 1e-6);
        assert_eq!(outputs.ccl_a, 100.0);
        assert_eq!(outputs.dcl_a, 150.0);
    }

    #[test]
    fn bulk_to_float_transition_then_hysteresis_holds_float() {
        let mut controller = CvlController::new();
        let config = base_config();

        // Force the controller into Transition to start from the scenario's
        // stated previous state.
        let low_soc_inputs = CvlInputs { soc_percent: 50.0, ..base_inputs() };
        controller.update(&low_soc_inputs, &config, 0);
        assert_eq!(controller.state(), CvlState::Transition);

        let float_inputs = CvlInputs { soc_percent: 96.0, ..base_inputs() };
        let (outputs, event) = controller.update(&float_inputs, &config, 1_000);
        assert_eq!(outputs.state, CvlState::Float);
        // bulk_target(58.4) - float_offset_mv(2000 -> 2.0 V) = 56.4 V.
        assert!((outputs.cvl_v - 56.4).abs() < 1e-3);
        let change = event.expect("Transition -> Float is a state change");
        // entered Transition at t=0, left it for Float at t=1_000.
        assert_eq!(change.state_duration_ms, 1_000);

        // SoC dips below the entry threshold (95) but stays at/above the
        // exit threshold (90): hysteresis keeps the controller in Float.
        let dip_inputs = CvlInputs { soc_percent: 94.0, ..base_inputs() };
        let (outputs, event) = controller.update(&dip_inputs, &config, 2_000);
        assert_eq!(outputs.state, CvlState::Float);
        assert!(event.is_none());
    }

    #[test]
    fn imbalance_above_hold_threshold_forces_imbalance_hold() {
        let mut controller = CvlController::new();
        let config = base_config();
        let inputs = CvlInputs { cell_imbalance_mv: 250, soc_percent: 50.0, ..base_inputs() };
        let (outputs, _) = controller.update(&inputs, &config, 0);
        assert_eq!(outputs.state, CvlState::ImbalanceHold);
        assert!(outputs.imbalance_hold_active);
        assert!(outputs.ccl_a <= config.minimum_ccl_in_float_a);
    }

    #[test]
    fn cell_protection_engages_and_clamps_cvl_downward() {
        let mut controller = CvlController::new();
        let config = base_config();
        let normal = CvlInputs { soc_percent: 50.0, max_cell_voltage_v: 3.3, ..base_inputs() };
        let (baseline, _) = controller.update(&normal, &config, 0);

        let overvoltage = CvlInputs { soc_percent: 50.0, max_cell_voltage_v: 3.70, ..base_inputs() };
        let (clamped, _) = controller.update(&overvoltage, &config, 1_000);
        assert!(clamped.cell_protection_active);
        assert!(clamped.cvl_v < baseline.cvl_v);
    }

    #[test]
    fn outputs_are_never_negative() {
        let mut controller = CvlController::new();
        let config = base_config();
        let extreme = CvlInputs {
            soc_percent: -50.0,
            cell_imbalance_mv: u16::MAX,
            base_ccl_limit_a: -10.0,
            base_dcl_limit_a: -10.0,
            max_cell_voltage_v: 10.0,
            ..base_inputs()
        };
        let (outputs, _) = controller.update(&extreme, &config, 0);
        assert!(outputs.cvl_v >= 0.0);
        assert!(outputs.ccl_a >= 0.0);
        assert!(outputs.dcl_a >= 0.0);
    }

    #[test]
    fn sustain_state_engages_at_low_soc_and_uses_per_cell_floor() {
        let mut controller = CvlController::new();
        let mut config = base_config();
        config.sustain_voltage_v = 40.0;
        config.sustain_per_cell_voltage_v = 3.2; // * 16 cells = 51.2 V, higher floor wins
        let inputs = CvlInputs { soc_percent: 4.0, ..base_inputs() };
        let (outputs, _) = controller.update(&inputs, &config, 0);
        assert_eq!(outputs.state, CvlState::Sustain);
        assert!((outputs.cvl_v - 51.2).abs() < 1e-3);
        assert_eq!(outputs.ccl_a, config.sustain_ccl_a);
        assert_eq!(outputs.dcl_a, config.sustain_dcl_a);
    }
}
