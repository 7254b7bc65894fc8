use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::api::ApiClient;
use crate::error::{Error, Result};
use crate::logger::CaptureLog;
use crate::protocol::{self, DEFAULT_SETPOINT_STATUS};
use crate::types::*;

/// How long a burst of host writes may keep re-arming its channel before
/// the pending change is flushed to the cloud.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Delay before a rejected display-unit write is corrected back to the
/// device's actual unit.
const UNIT_REVERT_DELAY: Duration = Duration::from_millis(100);

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(120);

type UpdateCallback = Box<dyn Fn(Characteristic, Update) + Send + Sync>;
type TokenRefreshCallback = Box<dyn Fn() + Send + Sync>;

const THERMOSTAT_CHARACTERISTICS: [Characteristic; 8] = [
    Characteristic::TemperatureDisplayUnits,
    Characteristic::CurrentTemperature,
    Characteristic::CurrentRelativeHumidity,
    Characteristic::TargetTemperature,
    Characteristic::HeatingThresholdTemperature,
    Characteristic::CoolingThresholdTemperature,
    Characteristic::TargetHeatingCoolingState,
    Characteristic::CurrentHeatingCoolingState,
];

const FAN_CHARACTERISTICS: [Characteristic; 2] =
    [Characteristic::FanActive, Characteristic::FanTargetState];

/// Builder for [`Thermostat`].
pub struct ThermostatBuilder {
    api: ApiClient,
    device: Device,
    location_id: String,
    refresh_interval: Duration,
    setpoint_status: String,
    hide_fan: bool,
    capture_path: Option<String>,
    update_callbacks: Vec<UpdateCallback>,
    token_refresh: Option<TokenRefreshCallback>,
}

impl ThermostatBuilder {
    pub fn new(api: ApiClient, device: Device, location_id: impl Into<String>) -> Self {
        Self {
            api,
            device,
            location_id: location_id.into(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            setpoint_status: DEFAULT_SETPOINT_STATUS.to_string(),
            hide_fan: false,
            capture_path: None,
            update_callbacks: Vec::new(),
            token_refresh: None,
        }
    }

    /// How often the engine polls the cloud for device state. The first
    /// poll happens as soon as the engine runs. Default is 120 seconds.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Hold type sent with every setpoint write, e.g. `"PermanentHold"`
    /// or `"TemporaryHold"`.
    pub fn setpoint_status(mut self, status: impl Into<String>) -> Self {
        self.setpoint_status = status.into();
        self
    }

    /// Skip the fan characteristics even when the device reports a fan.
    pub fn hide_fan(mut self, hide: bool) -> Self {
        self.hide_fan = hide;
        self
    }

    /// Record all cloud traffic as newline-delimited JSON at `path`.
    pub fn capture_log(mut self, path: impl Into<String>) -> Self {
        self.capture_path = Some(path.into());
        self
    }

    /// Register a callback invoked for every characteristic the engine
    /// publishes to the host, including fault markers.
    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(Characteristic, Update) + Send + Sync + 'static,
    {
        self.update_callbacks.push(Box::new(callback));
        self
    }

    /// Register a callback invoked whenever a cloud request fails, so the
    /// owner can renew the OAuth access token and hand the new one to
    /// [`ApiClient::set_access_token`].
    pub fn on_token_refresh<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.token_refresh = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> Thermostat {
        let fan_enabled = self.device.has_fan() && !self.hide_fan;
        if fan_enabled {
            let fan_modes = self
                .device
                .settings
                .as_ref()
                .and_then(|s| s.fan.as_ref())
                .and_then(|f| f.allowed_modes.as_ref());
            debug!(device = %self.device.device_id, ?fan_modes, "fan service enabled");
        }

        let allowed_states = allowed_target_states(&self.device.allowed_modes);
        let characteristics = CharacteristicState::from_device(&self.device);
        let capture = self.capture_path.map(|path| {
            Mutex::new(CaptureLog::new(&path).expect("failed to open capture log"))
        });

        let (thermostat_tx, thermostat_rx) = mpsc::unbounded_channel();
        let (unit_tx, unit_rx) = mpsc::unbounded_channel();
        let (fan_tx, fan_rx) = if fan_enabled {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let inner = Arc::new(Inner {
            api: self.api,
            device_id: self.device.device_id.clone(),
            location_id: self.location_id,
            setpoint_status: self.setpoint_status,
            refresh_interval: self.refresh_interval,
            fan_enabled,
            allowed_states,
            state: Mutex::new(SyncState {
                device: self.device,
                fan: None,
                characteristics,
            }),
            thermostat_pending: AtomicBool::new(false),
            fan_pending: AtomicBool::new(false),
            thermostat_tx,
            fan_tx,
            unit_tx,
            update_callbacks: self.update_callbacks,
            token_refresh: self.token_refresh,
            capture,
        });

        Thermostat {
            inner,
            thermostat_rx,
            fan_rx,
            unit_rx,
        }
    }
}

/// Keeps one T-series thermostat and the host that presents it in sync.
///
/// The engine polls the cloud on a timer and publishes derived
/// characteristic values through the registered update callbacks. Host
/// writes go through a [`ThermostatHandle`] and are debounced before
/// being pushed back to the cloud, with a follow-up poll so the host
/// ends up showing whatever the device actually accepted.
pub struct Thermostat {
    inner: Arc<Inner>,
    thermostat_rx: UnboundedReceiver<()>,
    fan_rx: Option<UnboundedReceiver<()>>,
    unit_rx: UnboundedReceiver<DisplayUnit>,
}

impl Thermostat {
    pub fn builder(api: ApiClient, device: Device, location_id: impl Into<String>) -> ThermostatBuilder {
        ThermostatBuilder::new(api, device, location_id)
    }

    /// A cloneable handle for reading and writing characteristics.
    pub fn handle(&self) -> ThermostatHandle {
        ThermostatHandle {
            inner: self.inner.clone(),
        }
    }

    /// Drives the refresh timer, both flush channels and the
    /// display-unit correction. Runs until the future is dropped.
    pub async fn run(self) {
        let Thermostat {
            inner,
            thermostat_rx,
            fan_rx,
            unit_rx,
        } = self;
        tokio::join!(
            inner.refresh_loop(),
            inner.thermostat_flush_loop(thermostat_rx),
            inner.fan_flush_loop(fan_rx),
            inner.unit_revert_loop(unit_rx),
        );
    }
}

struct SyncState {
    device: Device,
    fan: Option<FanState>,
    characteristics: CharacteristicState,
}

struct Inner {
    api: ApiClient,
    device_id: String,
    location_id: String,
    setpoint_status: String,
    refresh_interval: Duration,
    fan_enabled: bool,
    allowed_states: Vec<TargetState>,
    state: Mutex<SyncState>,
    thermostat_pending: AtomicBool,
    fan_pending: AtomicBool,
    thermostat_tx: UnboundedSender<()>,
    fan_tx: Option<UnboundedSender<()>>,
    unit_tx: UnboundedSender<DisplayUnit>,
    update_callbacks: Vec<UpdateCallback>,
    token_refresh: Option<TokenRefreshCallback>,
    capture: Option<Mutex<CaptureLog>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().expect("state lock poisoned")
    }

    fn publish(&self, characteristic: Characteristic, update: Update) {
        for callback in &self.update_callbacks {
            callback(characteristic, update);
        }
    }

    /// Publish every owned characteristic value in one sweep.
    fn publish_state(&self, chars: &CharacteristicState) {
        use Characteristic::*;
        self.publish(TemperatureDisplayUnits, Update::Value(chars.display_unit.into()));
        self.publish(CurrentTemperature, Update::Value(chars.current_temperature));
        self.publish(CurrentRelativeHumidity, Update::Value(chars.relative_humidity));
        self.publish(TargetTemperature, Update::Value(chars.target_temperature));
        self.publish(HeatingThresholdTemperature, Update::Value(chars.heating_threshold));
        self.publish(CoolingThresholdTemperature, Update::Value(chars.cooling_threshold));
        self.publish(TargetHeatingCoolingState, Update::Value(chars.target_state.into()));
        self.publish(CurrentHeatingCoolingState, Update::Value(chars.current_state.into()));
        if self.fan_enabled {
            let active = if chars.fan_active { 1.0 } else { 0.0 };
            self.publish(FanActive, Update::Value(active));
            self.publish(FanTargetState, Update::Value(chars.fan_target.into()));
        }
    }

    /// Mark every owned characteristic as not responding.
    fn broadcast_fault(&self) {
        for characteristic in THERMOSTAT_CHARACTERISTICS {
            self.publish(characteristic, Update::Fault);
        }
        if self.fan_enabled {
            for characteristic in FAN_CHARACTERISTICS {
                self.publish(characteristic, Update::Fault);
            }
        }
    }

    fn signal_token_refresh(&self) {
        if let Some(callback) = &self.token_refresh {
            callback();
        }
    }

    /// Shared failure path for polls and pushes: log the error, give the
    /// owner a chance to renew the access token, and fault every owned
    /// characteristic until a later poll succeeds.
    fn fault(&self, context: &'static str, err: &Error) {
        error!(context, error = %err, "cloud request failed");
        if let Some(capture) = &self.capture {
            capture
                .lock()
                .expect("capture log lock poisoned")
                .log_fault(context, &err.to_string());
        }
        self.signal_token_refresh();
        self.broadcast_fault();
    }

    /// Fetch device (and fan) state, recompute the characteristics and
    /// publish all of them to the host.
    async fn refresh(&self) -> Result<()> {
        let device = self.api.get_device(&self.device_id, &self.location_id).await?;

        // A failed fan fetch must not discard the device state fetched a
        // moment ago; keep the last known fan characteristics instead.
        let fan = if self.fan_enabled {
            match self.api.get_fan(&self.device_id, &self.location_id).await {
                Ok(fan) => Some(fan),
                Err(err) => {
                    warn!(error = %err, "fan fetch failed, keeping last known fan state");
                    self.signal_token_refresh();
                    None
                }
            }
        } else {
            None
        };

        trace!(device = %device.device_id, mode = %device.changeable_values.mode, "device state fetched");
        if let Some(capture) = &self.capture {
            capture
                .lock()
                .expect("capture log lock poisoned")
                .log_refresh(&device, fan.as_ref());
        }

        let chars = {
            let mut guard = self.state();
            let state = &mut *guard;
            state.device = device;
            if fan.is_some() {
                state.fan = fan;
            }
            // Recompute the fan pair only from a fan state fetched this
            // cycle; `state.fan` may predate a failed fetch.
            state.characteristics.update_from(&state.device, fan.as_ref());
            state.characteristics
        };

        self.publish_state(&chars);
        Ok(())
    }

    /// Flush pending thermostat writes. The payload carries the mode and
    /// both setpoints, with the target temperature standing in for the
    /// setpoint the current mode actually uses; when all of that matches
    /// the device's last known values the write is skipped. A successful
    /// write is followed by a full refresh, since the device may clamp
    /// or reject parts of the request.
    async fn push_changes(&self) -> Result<()> {
        let payload = {
            let guard = self.state();
            let chars = &guard.characteristics;
            let values = &guard.device.changeable_values;
            let unit = guard.device.units;

            let (heat, cool) = match chars.target_state {
                TargetState::Heat => (chars.target_temperature, chars.cooling_threshold),
                TargetState::Cool => (chars.heating_threshold, chars.target_temperature),
                TargetState::Off | TargetState::Auto => {
                    (chars.heating_threshold, chars.cooling_threshold)
                }
            };

            let mode = chars.target_state.mode_name();
            if mode == values.mode
                && heat == to_celsius(values.heat_setpoint, unit)
                && cool == to_celsius(values.cool_setpoint, unit)
            {
                debug!("no thermostat changes to push");
                return Ok(());
            }

            info!(mode, heat, cool, "pushing thermostat changes");
            protocol::thermostat_payload(
                mode,
                &self.setpoint_status,
                from_celsius(heat, unit),
                from_celsius(cool, unit),
            )
        };

        if let Some(capture) = &self.capture {
            capture
                .lock()
                .expect("capture log lock poisoned")
                .log_push("thermostat", &payload);
        }

        self.api
            .post_thermostat(&self.device_id, &self.location_id, &payload)
            .await?;
        self.refresh().await
    }

    /// Flush the pending fan state. Unlike the thermostat channel this
    /// always writes: target state and active flag collapse into a
    /// single mode, and only the device knows how it resolves.
    async fn push_fan_changes(&self) -> Result<()> {
        let mode = {
            let state = self.state();
            FanMode::from_characteristics(
                state.characteristics.fan_target,
                state.characteristics.fan_active,
            )
        };

        info!(mode = mode.as_str(), "pushing fan changes");
        let payload = protocol::fan_payload(mode.as_str());
        if let Some(capture) = &self.capture {
            capture
                .lock()
                .expect("capture log lock poisoned")
                .log_push("fan", &payload);
        }

        self.api
            .post_fan(&self.device_id, &self.location_id, &payload)
            .await?;
        self.refresh().await
    }

    async fn refresh_loop(&self) {
        let mut ticker = interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            // A tick landing while a thermostat write is pending is
            // skipped outright, not deferred; polling here would
            // overwrite host edits that have not reached the device yet.
            if self.thermostat_pending.load(Ordering::SeqCst) {
                trace!("refresh tick skipped, thermostat update in progress");
                continue;
            }
            if let Err(err) = self.refresh().await {
                self.fault("refresh", &err);
            }
        }
    }

    async fn thermostat_flush_loop(&self, mut rx: UnboundedReceiver<()>) {
        while debounce(&mut rx).await {
            if let Err(err) = self.push_changes().await {
                self.fault("thermostat push", &err);
            }
            self.thermostat_pending.store(false, Ordering::SeqCst);
        }
    }

    async fn fan_flush_loop(&self, rx: Option<UnboundedReceiver<()>>) {
        let Some(mut rx) = rx else { return };
        while debounce(&mut rx).await {
            if let Err(err) = self.push_fan_changes().await {
                self.fault("fan push", &err);
            }
            self.fan_pending.store(false, Ordering::SeqCst);
        }
    }

    /// The display unit is a hardware setting, not host-controllable.
    /// When the host writes it anyway, republish the stored unit after a
    /// short delay so the host UI snaps back.
    async fn unit_revert_loop(&self, mut rx: UnboundedReceiver<DisplayUnit>) {
        while let Some(requested) = rx.recv().await {
            debug!(?requested, "display unit is read-only, scheduling correction");
            sleep(UNIT_REVERT_DELAY).await;
            let unit = self.state().characteristics.display_unit;
            self.publish(
                Characteristic::TemperatureDisplayUnits,
                Update::Value(unit.into()),
            );
        }
    }

    // The pending flags are only raised when the nudge reaches a live
    // engine; with `run` gone nothing would ever lower them again.
    fn nudge_thermostat(&self) {
        if self.thermostat_tx.send(()).is_ok() {
            self.thermostat_pending.store(true, Ordering::SeqCst);
        } else {
            debug!("thermostat write dropped, engine not running");
        }
    }

    fn nudge_fan(&self) {
        if let Some(tx) = &self.fan_tx
            && tx.send(()).is_ok()
        {
            self.fan_pending.store(true, Ordering::SeqCst);
        } else {
            debug!("fan write dropped, engine not running");
        }
    }
}

/// Waits for the first nudge, then keeps restarting the window until the
/// channel stays quiet for a full [`DEBOUNCE_WINDOW`]. Returns `false`
/// once the channel is closed and drained.
async fn debounce(rx: &mut UnboundedReceiver<()>) -> bool {
    if rx.recv().await.is_none() {
        return false;
    }
    loop {
        match timeout(DEBOUNCE_WINDOW, rx.recv()).await {
            Ok(Some(())) => continue,
            Ok(None) => return true,
            Err(_) => return true,
        }
    }
}

/// Read/write access to a running [`Thermostat`].
///
/// Setters update the characteristic state immediately and arm the
/// matching flush channel; the actual cloud write happens on the engine
/// task once the debounce window closes.
#[derive(Clone)]
pub struct ThermostatHandle {
    inner: Arc<Inner>,
}

impl ThermostatHandle {
    /// Set the target heating/cooling state. The target temperature is
    /// recomputed from the device's stored setpoints and republished
    /// right away, so the host never shows a cooling setpoint next to a
    /// heating mode.
    pub fn set_target_heating_cooling_state(&self, value: TargetState) {
        let target = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            state.characteristics.target_state = value;
            let values = &state.device.changeable_values;
            let unit = state.device.units;
            state.characteristics.target_temperature = match value {
                TargetState::Heat => to_celsius(values.heat_setpoint, unit),
                _ => to_celsius(values.cool_setpoint, unit),
            };
            state.characteristics.target_temperature
        };
        self.inner
            .publish(Characteristic::TargetTemperature, Update::Value(target));
        self.inner.nudge_thermostat();
    }

    /// Set the target temperature in Celsius. Which setpoint it lands in
    /// is decided by the target state at flush time.
    pub fn set_target_temperature(&self, value: f64) {
        self.inner.state().characteristics.target_temperature = value;
        self.inner.nudge_thermostat();
    }

    /// Set the Auto-mode heating threshold in Celsius.
    pub fn set_heating_threshold(&self, value: f64) {
        self.inner.state().characteristics.heating_threshold = value;
        self.inner.nudge_thermostat();
    }

    /// Set the Auto-mode cooling threshold in Celsius.
    pub fn set_cooling_threshold(&self, value: f64) {
        self.inner.state().characteristics.cooling_threshold = value;
        self.inner.nudge_thermostat();
    }

    /// The display unit cannot be changed remotely; the stored unit is
    /// republished shortly after, reverting the host's optimistic value.
    pub fn set_display_unit(&self, value: DisplayUnit) {
        if self.inner.unit_tx.send(value).is_err() {
            debug!("display unit write dropped, engine not running");
        }
    }

    pub fn set_fan_active(&self, active: bool) {
        if !self.inner.fan_enabled {
            debug!("fan write ignored, no fan service");
            return;
        }
        self.inner.state().characteristics.fan_active = active;
        self.inner.nudge_fan();
    }

    pub fn set_target_fan_state(&self, value: TargetFanState) {
        if !self.inner.fan_enabled {
            debug!("fan write ignored, no fan service");
            return;
        }
        self.inner.state().characteristics.fan_target = value;
        self.inner.nudge_fan();
    }

    /// Poll the cloud once, outside the regular schedule. Failures take
    /// the same path as a failed scheduled poll.
    pub async fn refresh(&self) -> Result<()> {
        match self.inner.refresh().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.fault("refresh", &err);
                Err(err)
            }
        }
    }

    /// Last published characteristic values.
    pub fn characteristics(&self) -> CharacteristicState {
        self.inner.state().characteristics
    }

    /// Last device state fetched from the cloud.
    pub fn device(&self) -> Device {
        self.inner.state().device.clone()
    }

    pub fn fan_state(&self) -> Option<FanState> {
        self.inner.state().fan
    }

    /// Target states the device supports, in the order the host should
    /// present them.
    pub fn allowed_target_states(&self) -> &[TargetState] {
        &self.inner.allowed_states
    }

    /// Heating setpoint bounds in Celsius, `(min, max)`.
    pub fn heat_setpoint_range(&self) -> (f64, f64) {
        let state = self.inner.state();
        let unit = state.device.units;
        (
            to_celsius(state.device.min_heat_setpoint, unit),
            to_celsius(state.device.max_heat_setpoint, unit),
        )
    }

    /// Cooling setpoint bounds in Celsius, `(min, max)`.
    pub fn cool_setpoint_range(&self) -> (f64, f64) {
        let state = self.inner.state();
        let unit = state.device.units;
        (
            to_celsius(state.device.min_cool_setpoint, unit),
            to_celsius(state.device.max_cool_setpoint, unit),
        )
    }

    /// Whether a thermostat write is waiting to flush or in flight.
    pub fn thermostat_update_pending(&self) -> bool {
        self.inner.thermostat_pending.load(Ordering::SeqCst)
    }

    /// Whether a fan write is waiting to flush or in flight.
    pub fn fan_update_pending(&self) -> bool {
        self.inner.fan_pending.load(Ordering::SeqCst)
    }

    pub fn has_fan(&self) -> bool {
        self.inner.fan_enabled
    }
}
