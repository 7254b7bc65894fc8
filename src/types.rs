use serde::{Deserialize, Serialize};

/// Temperature scale the device displays and reports in.
///
/// The numeric value mirrors the host characteristic encoding
/// (Celsius = 0, Fahrenheit = 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisplayUnit {
    Celsius = 0,
    Fahrenheit = 1,
}

impl From<DisplayUnit> for f64 {
    fn from(unit: DisplayUnit) -> f64 {
        unit as u8 as f64
    }
}

/// Convert a remote-unit reading to the Celsius scale the host uses.
/// Fahrenheit input quantizes to 0.5° steps (host thermostats only
/// support half-degree granularity).
pub fn to_celsius(value: f64, unit: DisplayUnit) -> f64 {
    match unit {
        DisplayUnit::Celsius => value,
        DisplayUnit::Fahrenheit => ((value - 32.0) * (5.0 / 9.0) * 2.0).round() / 2.0,
    }
}

/// Convert a Celsius value back to the remote unit.
/// Fahrenheit output rounds to whole degrees (remote API granularity).
pub fn from_celsius(value: f64, unit: DisplayUnit) -> f64 {
    match unit {
        DisplayUnit::Celsius => value,
        DisplayUnit::Fahrenheit => (value * (9.0 / 5.0) + 32.0).round(),
    }
}

/// Remote mode names, indexed by `TargetState` discriminant. The enum
/// value IS the index into this table; neither may change without the
/// other.
pub const MODE_NAMES: [&str; 4] = ["Off", "Heat", "Cool", "Auto"];

/// Requested heating-cooling state, host characteristic encoding 0..3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TargetState {
    Off = 0,
    Heat = 1,
    Cool = 2,
    Auto = 3,
}

impl TargetState {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(TargetState::Off),
            1 => Some(TargetState::Heat),
            2 => Some(TargetState::Cool),
            3 => Some(TargetState::Auto),
            _ => None,
        }
    }

    /// Remote name for this state, via the fixed mode table.
    pub fn mode_name(self) -> &'static str {
        MODE_NAMES[self as usize]
    }

    pub fn from_mode_name(name: &str) -> Option<Self> {
        MODE_NAMES
            .iter()
            .position(|m| *m == name)
            .and_then(|i| Self::from_index(i as u8))
    }
}

impl From<TargetState> for f64 {
    fn from(state: TargetState) -> f64 {
        state as u8 as f64
    }
}

/// What the hardware is actually doing right now. Distinct from
/// `TargetState`: a device set to Auto can be idle, heating or cooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CurrentState {
    Off = 0,
    Heat = 1,
    Cool = 2,
}

impl CurrentState {
    /// Map `operationStatus.mode`; anything unrecognized counts as Off.
    pub fn from_operation_mode(mode: &str) -> Self {
        match mode {
            "Heat" => CurrentState::Heat,
            "Cool" => CurrentState::Cool,
            _ => CurrentState::Off,
        }
    }
}

impl From<CurrentState> for f64 {
    fn from(state: CurrentState) -> f64 {
        state as u8 as f64
    }
}

/// Fan control mode requested by the host (host encoding: Manual = 0,
/// Auto = 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TargetFanState {
    Manual = 0,
    Auto = 1,
}

impl From<TargetFanState> for f64 {
    fn from(state: TargetFanState) -> f64 {
        state as u8 as f64
    }
}

/// Remote fan mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanMode {
    Auto,
    On,
    Circulate,
}

impl FanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FanMode::Auto => "Auto",
            FanMode::On => "On",
            FanMode::Circulate => "Circulate",
        }
    }

    /// Decompose into the (target state, active) characteristic pair.
    pub fn to_characteristics(self) -> (TargetFanState, bool) {
        match self {
            FanMode::Auto => (TargetFanState::Auto, false),
            FanMode::On => (TargetFanState::Manual, true),
            FanMode::Circulate => (TargetFanState::Manual, false),
        }
    }

    /// Recompose from the characteristic pair. Auto wins regardless of
    /// the active flag; a manual fan is On when active, Circulate when
    /// not.
    pub fn from_characteristics(target: TargetFanState, active: bool) -> Self {
        match (target, active) {
            (TargetFanState::Auto, _) => FanMode::Auto,
            (TargetFanState::Manual, true) => FanMode::On,
            (TargetFanState::Manual, false) => FanMode::Circulate,
        }
    }
}

/// Ordered subset of target states this device supports, in the fixed
/// emission order Cool, Heat, Off, Auto. The order feeds straight into
/// the host's valid-values constraint and must not be reordered.
pub fn allowed_target_states(allowed_modes: &[String]) -> Vec<TargetState> {
    const EMISSION_ORDER: [TargetState; 4] = [
        TargetState::Cool,
        TargetState::Heat,
        TargetState::Off,
        TargetState::Auto,
    ];
    EMISSION_ORDER
        .into_iter()
        .filter(|state| allowed_modes.iter().any(|m| m == state.mode_name()))
        .collect()
}

/// Device resource as returned by `GET /devices/thermostats/{deviceID}`.
/// Replaced wholesale on every successful refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    pub name: String,
    pub units: DisplayUnit,
    pub indoor_temperature: f64,
    pub indoor_humidity: f64,
    pub changeable_values: ChangeableValues,
    pub operation_status: OperationStatus,
    pub allowed_modes: Vec<String>,
    pub min_heat_setpoint: f64,
    pub max_heat_setpoint: f64,
    pub min_cool_setpoint: f64,
    pub max_cool_setpoint: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<DeviceSettings>,
}

impl Device {
    /// Whether the physical unit has a controllable fan attached.
    pub fn has_fan(&self) -> bool {
        self.settings.as_ref().is_some_and(|s| s.fan.is_some())
    }
}

/// The requested state held by the device: mode plus both setpoints,
/// in the remote unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeableValues {
    pub mode: String,
    pub heat_setpoint: f64,
    pub cool_setpoint: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan: Option<FanSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_modes: Option<Vec<FanMode>>,
}

/// Fan sub-resource, fetched and pushed independently of the device
/// resource at `GET|POST .../fan`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FanState {
    pub mode: FanMode,
}

/// A single externally-observable value exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    CurrentTemperature,
    TargetTemperature,
    CurrentHeatingCoolingState,
    TargetHeatingCoolingState,
    HeatingThresholdTemperature,
    CoolingThresholdTemperature,
    CurrentRelativeHumidity,
    TemperatureDisplayUnits,
    FanActive,
    FanTargetState,
}

/// What gets published for a characteristic: a fresh value, or a fault
/// marker telling the host the device is not responding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Update {
    Value(f64),
    Fault,
}

/// Local mirror of everything the host observes. Temperatures are
/// Celsius-normalized; remote-unit values never leave the network
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CharacteristicState {
    pub current_temperature: f64,
    pub target_temperature: f64,
    pub current_state: CurrentState,
    pub target_state: TargetState,
    pub heating_threshold: f64,
    pub cooling_threshold: f64,
    pub relative_humidity: f64,
    pub display_unit: DisplayUnit,
    pub fan_active: bool,
    pub fan_target: TargetFanState,
}

impl Default for CharacteristicState {
    fn default() -> Self {
        Self {
            current_temperature: 0.0,
            target_temperature: 0.0,
            current_state: CurrentState::Off,
            target_state: TargetState::Off,
            heating_threshold: 0.0,
            cooling_threshold: 0.0,
            relative_humidity: 0.0,
            display_unit: DisplayUnit::Celsius,
            fan_active: false,
            fan_target: TargetFanState::Auto,
        }
    }
}

impl CharacteristicState {
    pub fn from_device(device: &Device) -> Self {
        let mut state = Self::default();
        state.update_from(device, None);
        state
    }

    /// Recompute from a freshly fetched snapshot. `fan` carries the fan
    /// sub-resource when one was fetched this cycle; fan characteristics
    /// are left untouched otherwise.
    pub fn update_from(&mut self, device: &Device, fan: Option<&FanState>) {
        let unit = device.units;
        self.display_unit = unit;
        self.current_temperature = to_celsius(device.indoor_temperature, unit);
        self.relative_humidity = device.indoor_humidity;

        // Devices report 0 for an inapplicable setpoint; a zero must not
        // clobber the last-known threshold.
        let values = &device.changeable_values;
        if values.heat_setpoint > 0.0 {
            self.heating_threshold = to_celsius(values.heat_setpoint, unit);
        }
        if values.cool_setpoint > 0.0 {
            self.cooling_threshold = to_celsius(values.cool_setpoint, unit);
        }

        if let Some(state) = TargetState::from_mode_name(&values.mode) {
            self.target_state = state;
        }
        self.current_state = CurrentState::from_operation_mode(&device.operation_status.mode);

        // The only place target temperature is taken from remote data;
        // host set calls write it directly.
        self.target_temperature = match self.target_state {
            TargetState::Heat => to_celsius(values.heat_setpoint, unit),
            _ => to_celsius(values.cool_setpoint, unit),
        };

        if let Some(fan) = fan {
            let (target, active) = fan.mode.to_characteristics();
            self.fan_target = target;
            self.fan_active = active;
        }
    }
}
