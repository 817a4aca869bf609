//! Public/full JSON snapshot rendering. Masking is applied only here, at
//! render time, never at mutation time, so the in-memory settings always
//! hold the real secrets.

use serde_json::{json, Value};

use super::model::GatewaySettings;

const SECRET_MASK: &str = "***";

/// Renders the full settings tree, replacing Wi-Fi and MQTT passwords with
/// [`SECRET_MASK`] when `public` is true.
pub fn render(settings: &GatewaySettings, public: bool) -> Value {
    let mut value = serde_json::to_value(settings).expect("GatewaySettings always serialises");
    if public {
        mask_secret(&mut value, &["wifi", "station", "password"]);
        mask_secret(&mut value, &["wifi", "access_point", "password"]);
        mask_secret(&mut value, &["mqtt", "password"]);
    }
    value
}

fn mask_secret(value: &mut Value, path: &[&str]) {
    let mut cursor = value;
    for (i, segment) in path.iter().enumerate() {
        let Some(next) = cursor.get_mut(*segment) else { return };
        if i == path.len() - 1 {
            if next.is_string() {
                *next = json!(SECRET_MASK);
            }
            return;
        }
        cursor = next;
    }
}
