use serde_json::{json, Value};

pub const DEFAULT_BASE_URL: &str = "https://api.honeywell.com/v2";

/// Default hold behavior attached to pushed setpoints. "PermanentHold"
/// keeps manual changes until the user clears them; schedules resume
/// with "NoHold", "TemporaryHold" until the next period.
pub const DEFAULT_SETPOINT_STATUS: &str = "PermanentHold";

pub fn thermostat_path(device_id: &str) -> String {
    format!("/devices/thermostats/{device_id}")
}

pub fn fan_path(device_id: &str) -> String {
    format!("/devices/thermostats/{device_id}/fan")
}

/// Body for `POST /devices/thermostats/{deviceID}`. Setpoints are in the
/// device's display unit; conversion happens before this point.
pub fn thermostat_payload(
    mode: &str,
    setpoint_status: &str,
    heat_setpoint: f64,
    cool_setpoint: f64,
) -> Value {
    json!({
        "mode": mode,
        "thermostatSetpointStatus": setpoint_status,
        "heatSetpoint": heat_setpoint,
        "coolSetpoint": cool_setpoint,
    })
}

/// Body for `POST /devices/thermostats/{deviceID}/fan`.
pub fn fan_payload(mode: &str) -> Value {
    json!({ "mode": mode })
}
