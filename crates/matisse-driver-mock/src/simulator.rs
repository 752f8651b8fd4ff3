//! Simulated Matisse controller speaking the ASCII command protocol.

use crate::optics::OpticsModel;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use matisse_core::protocol::{
    self, ControlLoop, Motor, Piezo, BIFI_WAVELENGTH, DIODE_POWER, ERROR_CLEAR, ERROR_CODE_QUERY,
    FAST_PIEZO_LOCK, THIN_ETALON_REFLEX,
};
use matisse_core::Transport;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

const ACK: &str = "OK";
const UNKNOWN_PARAMETER: &str = "ERROR:CODE 1 - unknown parameter";
const READ_ONLY_PARAMETER: &str = "ERROR:CODE 2 - parameter is read-only";
const INVALID_VALUE: &str = "ERROR:CODE 3 - invalid value";
const OUT_OF_RANGE: &str = "ERROR:CODE 4 - value out of range";

/// Tunable wavelength range of the simulated BiFi (nm).
const WAVELENGTH_RANGE: (f64, f64) = (690.0, 1050.0);

/// Thin etalon motor position at power-on.
const THIN_ETALON_HOME: i64 = 10_000;

/// A parameter write applied once the simulated clock reaches `at`.
#[derive(Debug, Clone)]
struct ScheduledWrite {
    at: Instant,
    parameter: String,
    value: String,
}

#[derive(Debug)]
struct SimState {
    optics: OpticsModel,
    /// Settable parameters keyed by mnemonic (`"SPZT:NOW"` -> `"0.35"`).
    params: HashMap<String, String>,
    bifi_position: i64,
    bifi_wavelength: f64,
    thin_etalon_position: i64,

    lock_from: Option<Instant>,
    lock_lost_at: Option<Instant>,
    lock_delay_after_engage: Option<Duration>,
    fast_piezo_engaged_at: Option<Instant>,

    scheduled: Vec<ScheduledWrite>,
    rejections: Vec<(String, String)>,
    failures: Vec<(String, String)>,
    disconnected: bool,
    pending_error: Option<String>,

    noise_amplitude: f64,
    reading_drift: f64,
    readings_taken: u64,
    rng: ChaCha8Rng,

    response_delay: Duration,
    log: Vec<String>,
}

impl SimState {
    fn new() -> Self {
        let optics = OpticsModel::default();
        let mut params = HashMap::new();
        for piezo in Piezo::ALL {
            let initial = match piezo {
                Piezo::PiezoEtalon => 0.0,
                Piezo::SlowPiezo | Piezo::RefCell => 0.35,
            };
            params.insert(piezo.position_parameter().to_string(), initial.to_string());
        }
        for control_loop in ControlLoop::ALL {
            params.insert(control_loop.status_parameter().to_string(), "STOP".to_string());
        }

        Self {
            bifi_position: optics.bifi_reference_position,
            bifi_wavelength: optics.bifi_reference_nm,
            thin_etalon_position: THIN_ETALON_HOME,
            optics,
            params,
            lock_from: None,
            lock_lost_at: None,
            lock_delay_after_engage: None,
            fast_piezo_engaged_at: None,
            scheduled: Vec::new(),
            rejections: Vec::new(),
            failures: Vec::new(),
            disconnected: false,
            pending_error: None,
            noise_amplitude: 0.0,
            reading_drift: 0.0,
            readings_taken: 0,
            rng: ChaCha8Rng::seed_from_u64(0),
            response_delay: Duration::ZERO,
            log: Vec::new(),
        }
    }

    fn apply_due_writes(&mut self, now: Instant) {
        self.scheduled.sort_by_key(|write| write.at);
        let due = self.scheduled.iter().take_while(|w| w.at <= now).count();
        let writes: Vec<ScheduledWrite> = self.scheduled.drain(..due).collect();
        for write in writes {
            trace!(parameter = %write.parameter, value = %write.value, "scheduled write");
            // Scheduled writes model the instrument itself, so they bypass
            // rejection rules.
            let _ = self.write(&write.parameter, &write.value, now);
        }
    }

    fn loop_running(&self, control_loop: ControlLoop) -> bool {
        self.params
            .get(control_loop.status_parameter())
            .is_some_and(|v| v == "RUN")
    }

    fn is_locked(&self, now: Instant) -> bool {
        if !self.loop_running(ControlLoop::FastPiezo) {
            return false;
        }
        let scheduled = self.lock_from.is_some_and(|from| now >= from);
        let after_engage = match (self.lock_delay_after_engage, self.fast_piezo_engaged_at) {
            (Some(delay), Some(engaged)) => now >= engaged + delay,
            _ => false,
        };
        let lost = self.lock_lost_at.is_some_and(|at| now >= at);
        (scheduled || after_engage) && !lost
    }

    fn noisy(&mut self, value: f64) -> f64 {
        self.readings_taken += 1;
        let drift = self.reading_drift * self.readings_taken as f64;
        let noise = if self.noise_amplitude > 0.0 {
            self.rng.gen_range(-self.noise_amplitude..=self.noise_amplitude)
        } else {
            0.0
        };
        value + drift + noise
    }

    fn read(&mut self, parameter: &str, now: Instant) -> std::result::Result<String, String> {
        let value = match parameter {
            p if p == BIFI_WAVELENGTH => self.bifi_wavelength.to_string(),
            p if p == FAST_PIEZO_LOCK => {
                let flag = if self.is_locked(now) { "TRUE" } else { "FALSE" };
                flag.to_string()
            }
            p if p == DIODE_POWER => {
                let power = self.optics.diode_power(self.bifi_position);
                self.noisy(power).to_string()
            }
            p if p == THIN_ETALON_REFLEX => {
                let reflex = self.optics.reflex(self.thin_etalon_position);
                self.noisy(reflex).to_string()
            }
            p if p == Motor::BirefringentFilter.position_parameter() => {
                self.bifi_position.to_string()
            }
            p if p == Motor::ThinEtalon.position_parameter() => {
                self.thin_etalon_position.to_string()
            }
            p => match self.params.get(p) {
                Some(value) => value.clone(),
                None => return Err(UNKNOWN_PARAMETER.to_string()),
            },
        };
        Ok(protocol::set(parameter, value))
    }

    fn write(
        &mut self,
        parameter: &str,
        value: &str,
        now: Instant,
    ) -> std::result::Result<(), String> {
        match parameter {
            p if p == BIFI_WAVELENGTH => {
                let nm: f64 = value.parse().map_err(|_| INVALID_VALUE.to_string())?;
                if !(WAVELENGTH_RANGE.0..=WAVELENGTH_RANGE.1).contains(&nm) {
                    return Err(OUT_OF_RANGE.to_string());
                }
                self.bifi_wavelength = nm;
                self.bifi_position = self.optics.bifi_position(nm);
            }
            p if p == Motor::BirefringentFilter.position_parameter() => {
                let position = parse_position(value)?;
                self.bifi_position = position;
                self.bifi_wavelength = self.optics.bifi_wavelength(position);
            }
            p if p == Motor::ThinEtalon.position_parameter() => {
                self.thin_etalon_position = parse_position(value)?;
            }
            p if p == FAST_PIEZO_LOCK || p == DIODE_POWER || p == THIN_ETALON_REFLEX => {
                return Err(READ_ONLY_PARAMETER.to_string());
            }
            p if ControlLoop::ALL.iter().any(|l| l.status_parameter() == p) => {
                let running = match value.to_ascii_uppercase().as_str() {
                    "RUN" => true,
                    "STOP" => false,
                    _ => return Err(INVALID_VALUE.to_string()),
                };
                if p == ControlLoop::FastPiezo.status_parameter() {
                    if running && !self.loop_running(ControlLoop::FastPiezo) {
                        self.fast_piezo_engaged_at = Some(now);
                    } else if !running {
                        self.fast_piezo_engaged_at = None;
                    }
                }
                let state = if running { "RUN" } else { "STOP" };
                self.params.insert(p.to_string(), state.to_string());
            }
            p if self.params.contains_key(p) => {
                let parsed: f64 = value.parse().map_err(|_| INVALID_VALUE.to_string())?;
                self.params.insert(p.to_string(), parsed.to_string());
            }
            _ => return Err(UNKNOWN_PARAMETER.to_string()),
        }
        Ok(())
    }

    fn handle(&mut self, command: &str, now: Instant) -> Result<String> {
        self.log.push(command.to_string());
        if self.disconnected {
            return Err(anyhow!("simulated Matisse is disconnected"));
        }
        if let Some((_, message)) = self.failures.iter().find(|(p, _)| command.starts_with(p)) {
            return Err(anyhow!("{}", message));
        }
        self.apply_due_writes(now);

        if command == ERROR_CODE_QUERY {
            let code = self.pending_error.take().unwrap_or_else(|| "ERROR:CODE 0".into());
            return Ok(code);
        }
        if command == ERROR_CLEAR {
            self.pending_error = None;
            return Ok(ACK.to_string());
        }
        if let Some((_, code)) = self.rejections.iter().find(|(p, _)| command.starts_with(p)) {
            self.pending_error = Some(code.clone());
            return Ok(protocol::ERROR_SENTINEL.to_string());
        }

        let outcome = match command.strip_suffix('?') {
            Some(parameter) => self.read(parameter, now),
            None => match command.split_once(char::is_whitespace) {
                Some((parameter, value)) => {
                    self.write(parameter, value.trim(), now).map(|()| ACK.to_string())
                }
                None => Err(UNKNOWN_PARAMETER.to_string()),
            },
        };
        match outcome {
            Ok(response) => Ok(response),
            Err(code) => {
                self.pending_error = Some(code);
                Ok(protocol::ERROR_SENTINEL.to_string())
            }
        }
    }
}

fn parse_position(value: &str) -> std::result::Result<i64, String> {
    protocol::parse_i64(value).ok_or_else(|| INVALID_VALUE.to_string())
}

/// In-process Matisse simulator.
///
/// Models the parameters the controller touches: loop status flags, motor
/// and piezo positions, the BiFi wavelength, the fast piezo lock indicator,
/// and the diode power and thin etalon reflex signals used by the coarse
/// scans. Cloning yields another handle to the same simulated instrument, so
/// a test can keep one handle for scripting and inspection while the
/// controller owns the transport.
///
/// Time-dependent behavior (lock acquisition, limit excursions) is expressed
/// against `tokio::time::Instant`, so tests running on a paused clock are
/// deterministic.
#[derive(Debug, Clone)]
pub struct SimulatedMatisse {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedMatisse {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMatisse {
    /// Create a simulator with all loops stopped and actuators mid-travel.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Boxed transport for `InstrumentLink`.
    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    /// Replace the optics model.
    pub fn set_optics(&self, optics: OpticsModel) {
        let mut state = self.state.lock();
        state.bifi_position = optics.bifi_reference_position;
        state.bifi_wavelength = optics.bifi_reference_nm;
        state.optics = optics;
    }

    /// Report a lock from `delay` after now, provided the fast piezo loop runs.
    pub fn lock_after(&self, delay: Duration) {
        self.state.lock().lock_from = Some(Instant::now() + delay);
    }

    /// Report a lock `delay` after the fast piezo loop is switched on.
    pub fn lock_when_engaged(&self, delay: Duration) {
        self.state.lock().lock_delay_after_engage = Some(delay);
    }

    /// Stop reporting the lock from `delay` after now.
    pub fn lose_lock_after(&self, delay: Duration) {
        self.state.lock().lock_lost_at = Some(Instant::now() + delay);
    }

    /// Write `value` to `parameter` once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, parameter: &str, value: impl ToString) {
        self.state.lock().scheduled.push(ScheduledWrite {
            at: Instant::now() + delay,
            parameter: parameter.to_string(),
            value: value.to_string(),
        });
    }

    /// Set a piezo position directly, as if the feedback loop moved it.
    pub fn set_piezo(&self, piezo: Piezo, position: f64) {
        self.state
            .lock()
            .params
            .insert(piezo.position_parameter().to_string(), position.to_string());
    }

    /// Current piezo position.
    pub fn piezo(&self, piezo: Piezo) -> f64 {
        self.state
            .lock()
            .params
            .get(piezo.position_parameter())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Current motor position.
    pub fn motor(&self, motor: Motor) -> i64 {
        let state = self.state.lock();
        match motor {
            Motor::BirefringentFilter => state.bifi_position,
            Motor::ThinEtalon => state.thin_etalon_position,
        }
    }

    /// Current BiFi wavelength (nm).
    pub fn bifi_wavelength(&self) -> f64 {
        self.state.lock().bifi_wavelength
    }

    /// Whether the instrument has a loop switched on.
    pub fn loop_running(&self, control_loop: ControlLoop) -> bool {
        self.state.lock().loop_running(control_loop)
    }

    /// Reject every command starting with `prefix`, reporting `code`.
    pub fn reject(&self, prefix: &str, code: &str) {
        self.state
            .lock()
            .rejections
            .push((prefix.to_string(), code.to_string()));
    }

    /// Remove every rejection rule.
    pub fn clear_rejections(&self) {
        self.state.lock().rejections.clear();
    }

    /// Fail the transport on every command starting with `prefix`.
    pub fn fail_on(&self, prefix: &str, message: &str) {
        self.state
            .lock()
            .failures
            .push((prefix.to_string(), message.to_string()));
    }

    /// Make every subsequent exchange fail at the transport level.
    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    /// Add uniform noise of `amplitude` to power and reflex readings.
    pub fn with_noise(self, amplitude: f64, seed: u64) -> Self {
        {
            let mut state = self.state.lock();
            state.noise_amplitude = amplitude;
            state.rng = ChaCha8Rng::seed_from_u64(seed);
        }
        self
    }

    /// Shift every power and reflex reading by `drift` more than the last,
    /// so consecutive readings never agree.
    pub fn set_reading_drift(&self, drift: f64) {
        self.state.lock().reading_drift = drift;
    }

    /// Delay every response by `delay`.
    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().response_delay = delay;
    }

    /// Every command received so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Commands received so far that start with `prefix`.
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Forget the command log.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

#[async_trait]
impl Transport for SimulatedMatisse {
    async fn exchange(&mut self, command: &str) -> Result<String> {
        let delay = self.state.lock().response_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let now = Instant::now();
        self.state.lock().handle(command.trim(), now)
    }

    fn describe(&self) -> String {
        "simulated Matisse".to_string()
    }
}
