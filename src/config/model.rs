//! Configuration data model: device/UART/Wi-Fi/CAN/MQTT/CVL/logging
//! sections plus the raw register cache, all `serde`-derived the way the
//! teacher's MQTT client configuration structs were, so the whole tree
//! round-trips through `serde_json` for the JSON configuration file.

use std::collections::HashMap;

use crate::can::AlarmThresholds;
use crate::cvl::CvlConfig;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeviceSettings {
    pub name: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self { name: "bms-can-gateway".to_string() }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UartSettings {
    pub tx_pin: u8,
    pub rx_pin: u8,
    pub baud_rate: u32,
    pub poll_interval_ms: u64,
}

impl Default for UartSettings {
    fn default() -> Self {
        Self { tx_pin: 17, rx_pin: 16, baud_rate: 115_200, poll_interval_ms: 100 }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WifiStaSettings {
    pub ssid: String,
    pub password: String,
    pub hostname: String,
}

impl Default for WifiStaSettings {
    fn default() -> Self {
        Self { ssid: String::new(), password: String::new(), hostname: "bms-can-gateway".to_string() }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WifiApSettings {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub max_clients: u8,
}

impl Default for WifiApSettings {
    fn default() -> Self {
        Self { ssid: "bms-can-gateway-setup".to_string(), password: String::new(), channel: 1, max_clients: 4 }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WifiSettings {
    pub station: WifiStaSettings,
    pub access_point: WifiApSettings,
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self { station: WifiStaSettings::default(), access_point: WifiApSettings::default() }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CanSettings {
    pub tx_pin: u8,
    pub rx_pin: u8,
    pub keepalive_interval_ms: u64,
    pub keepalive_timeout_ms: u64,
    pub publisher_period_ms: u64,
    pub manufacturer: String,
    pub battery_name: String,
    pub battery_family: String,
    pub serial_number: String,
}

impl Default for CanSettings {
    fn default() -> Self {
        Self {
            tx_pin: 21,
            rx_pin: 22,
            keepalive_interval_ms: 1_000,
            keepalive_timeout_ms: 10_000,
            publisher_period_ms: 1_000,
            manufacturer: "Generic".to_string(),
            battery_name: "BMS Pack".to_string(),
            battery_family: "LFP".to_string(),
            serial_number: String::new(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MqttSettings {
    pub broker_address: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub base_topic: String,
    pub publish_interval_ms: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker_address: String::new(),
            username: String::new(),
            password: String::new(),
            client_id: "bms-can-gateway".to_string(),
            base_topic: "bms".to_string(),
            publish_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub log_raw_frames: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: "info".to_string(), log_raw_frames: false }
    }
}

/// Top-level configuration tree.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GatewaySettings {
    pub device: DeviceSettings,
    pub uart: UartSettings,
    pub wifi: WifiSettings,
    pub can: CanSettings,
    pub mqtt: MqttSettings,
    pub cvl: CvlConfig,
    pub alarm_thresholds: AlarmThresholds,
    pub logging: LoggingSettings,
    /// Raw register values keyed by descriptor key, seeded from each
    /// descriptor's `default_raw` and overwritten as writes confirm.
    pub register_cache: HashMap<String, i64>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        let register_cache = crate::register::REGISTER_TABLE
            .iter()
            .map(|d| (d.key.to_string(), d.default_raw))
            .collect();
        Self {
            device: DeviceSettings::default(),
            uart: UartSettings::default(),
            wifi: WifiSettings::default(),
            can: CanSettings::default(),
            mqtt: MqttSettings::default(),
            cvl: default_cvl_config(),
            alarm_thresholds: default_alarm_thresholds(),
            logging: LoggingSettings::default(),
            register_cache,
        }
    }
}

fn default_cvl_config() -> CvlConfig {
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
        sustain_voltage_v: 48.0,
        sustain_per_cell_voltage_v: 3.0,
        sustain_ccl_a: 5.0,
        sustain_dcl_a: 10.0,
        imbalance_drop_per_mv: 0.0,
        imbalance_drop_max_v: 0.0,
    }
}

fn default_alarm_thresholds() -> AlarmThresholds {
    AlarmThresholds {
        cell_undervoltage_mv: 2800,
        cell_overvoltage_mv: 3650,
        overtemperature_c: 55.0,
        low_temp_charge_c: 0.0,
        imbalance_alarm_mv: 200,
        imbalance_warn_mv: 100,
        soc_low_pct: 10.0,
        soc_high_pct: 95.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_register_cache_covers_every_descriptor() {
        let settings = GatewaySettings::default();
        assert_eq!(settings.register_cache.len(), crate::register::REGISTER_TABLE.len());
    }

    #[test]
    fn default_settings_round_trip_through_json() {
        let settings = GatewaySettings::default();
        let encoded = serde_json::to_string(&settings).unwrap();
        let decoded: GatewaySettings = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.device.name, settings.device.name);
        assert_eq!(decoded.register_cache.len(), settings.register_cache.len());
    }
}
