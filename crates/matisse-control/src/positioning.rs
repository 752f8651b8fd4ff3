//! Wavelength and actuator position set operations.
//!
//! Every set is fire-and-forget: the command is sent once and the operation
//! completes on acknowledgement, without polling for convergence.

use matisse_core::config::{ActuatorLimits, WavelengthSettings};
use matisse_core::protocol::{self, BIFI_WAVELENGTH};
use matisse_core::{InstrumentLink, MatisseError, MatisseResult, Motor, Piezo};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, instrument};

/// Whether a wavelength change needs explicit operator confirmation.
///
/// True when the current wavelength is known and the requested one differs
/// from it by at least `threshold_nm`.
pub fn requires_confirmation(current_nm: Option<f64>, requested_nm: f64, threshold_nm: f64) -> bool {
    current_nm.is_some_and(|current| (current - requested_nm).abs() >= threshold_nm)
}

/// Last wavelength confirmed by the instrument, shared between components.
#[derive(Debug, Clone, Default)]
pub struct TargetWavelength(Arc<RwLock<Option<f64>>>);

impl TargetWavelength {
    /// Current target, if one has been set.
    pub fn get(&self) -> Option<f64> {
        *self.0.read()
    }

    fn set(&self, wavelength_nm: f64) {
        *self.0.write() = Some(wavelength_nm);
    }
}

/// Set operations on the BiFi, motors and piezos.
#[derive(Debug, Clone)]
pub struct Positioner {
    link: InstrumentLink,
    target: TargetWavelength,
    wavelength: WavelengthSettings,
    limits: ActuatorLimits,
}

impl Positioner {
    /// Create a positioner.
    pub fn new(
        link: InstrumentLink,
        target: TargetWavelength,
        wavelength: WavelengthSettings,
        limits: ActuatorLimits,
    ) -> Self {
        Self {
            link,
            target,
            wavelength,
            limits,
        }
    }

    /// Shared target wavelength.
    pub fn target(&self) -> &TargetWavelength {
        &self.target
    }

    /// Target wavelength, if one has been set.
    pub fn target_wavelength(&self) -> Option<f64> {
        self.target.get()
    }

    /// Tune the BiFi to `wavelength_nm` and record it as the target.
    ///
    /// The target is only updated after the instrument acknowledges, while
    /// the link session is still held.
    #[instrument(skip(self), err)]
    pub async fn set_wavelength(&self, wavelength_nm: f64) -> MatisseResult<()> {
        self.check_wavelength(wavelength_nm)?;
        info!("Setting wavelength to {} nm...", wavelength_nm);

        let mut session = self.link.session().await;
        session
            .command(&protocol::set(BIFI_WAVELENGTH, wavelength_nm))
            .await?;
        self.target.set(wavelength_nm);
        Ok(())
    }

    /// Move the BiFi to an approximate wavelength without changing the target.
    #[instrument(skip(self), err)]
    pub async fn set_bifi_wavelength(&self, wavelength_nm: f64) -> MatisseResult<()> {
        self.check_wavelength(wavelength_nm)?;
        info!("Setting BiFi approximate wavelength to {} nm...", wavelength_nm);
        self.link
            .command(&protocol::set(BIFI_WAVELENGTH, wavelength_nm))
            .await
    }

    /// BiFi position expressed as a wavelength (nm).
    pub async fn bifi_wavelength(&self) -> MatisseResult<f64> {
        self.link.read_f64(BIFI_WAVELENGTH).await
    }

    /// Move a stepper motor to an absolute position.
    #[instrument(skip(self), err)]
    pub async fn set_motor_position(&self, motor: Motor, position: i64) -> MatisseResult<()> {
        info!("Moving {} to {}", motor, position);
        self.link
            .command(&protocol::set(motor.position_parameter(), position))
            .await
    }

    /// Absolute motor position.
    pub async fn motor_position(&self, motor: Motor) -> MatisseResult<i64> {
        self.link.read_i64(motor.position_parameter()).await
    }

    /// Move a piezo within its travel window.
    #[instrument(skip(self), err)]
    pub async fn set_piezo_position(&self, piezo: Piezo, position: f64) -> MatisseResult<()> {
        let window = self.limits.window(piezo);
        if !(window.lower..=window.upper).contains(&position) {
            return Err(MatisseError::InvalidParameter(format!(
                "{} position {} outside travel [{}, {}]",
                piezo, position, window.lower, window.upper
            )));
        }
        info!("Setting {} to {}", piezo, position);
        self.link
            .command(&protocol::set(piezo.position_parameter(), position))
            .await
    }

    /// Current piezo position.
    pub async fn piezo_position(&self, piezo: Piezo) -> MatisseResult<f64> {
        self.link.read_f64(piezo.position_parameter()).await
    }

    /// Reference wavelength for the confirmation check: the target if set,
    /// otherwise the current BiFi reading.
    pub async fn current_wavelength(&self) -> MatisseResult<f64> {
        match self.target.get() {
            Some(target) => Ok(target),
            None => self.bifi_wavelength().await,
        }
    }

    /// Whether moving to `requested_nm` needs confirmation.
    pub async fn needs_confirmation(&self, requested_nm: f64) -> MatisseResult<bool> {
        let current = self.current_wavelength().await?;
        Ok(requires_confirmation(
            Some(current),
            requested_nm,
            self.wavelength.confirm_threshold_nm,
        ))
    }

    /// Fail with [`MatisseError::InvalidParameter`] when `wavelength_nm` is
    /// outside the configured range.
    pub fn check_wavelength(&self, wavelength_nm: f64) -> MatisseResult<()> {
        if !self.wavelength.contains(wavelength_nm) {
            return Err(MatisseError::InvalidParameter(format!(
                "wavelength {} nm outside [{}, {}] nm",
                wavelength_nm, self.wavelength.min_nm, self.wavelength.max_nm
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matisse_driver_mock::SimulatedMatisse;

    fn positioner() -> (Positioner, SimulatedMatisse) {
        let sim = SimulatedMatisse::new();
        let positioner = Positioner::new(
            InstrumentLink::new(sim.transport()),
            TargetWavelength::default(),
            WavelengthSettings::default(),
            ActuatorLimits::default(),
        );
        (positioner, sim)
    }

    #[test]
    fn confirmation_threshold() {
        assert!(requires_confirmation(Some(800.0), 812.0, 10.0));
        assert!(requires_confirmation(Some(800.0), 790.0, 10.0));
        assert!(!requires_confirmation(Some(800.0), 809.0, 10.0));
        assert!(!requires_confirmation(None, 812.0, 10.0));
    }

    #[tokio::test]
    async fn set_wavelength_round_trips() {
        let (positioner, sim) = positioner();
        positioner.set_wavelength(785.125).await.unwrap();

        assert_eq!(positioner.target_wavelength(), Some(785.125));
        assert_eq!(positioner.bifi_wavelength().await.unwrap(), 785.125);
        assert_eq!(sim.commands_matching("MOTBI:WL "), vec!["MOTBI:WL 785.125".to_string()]);
    }

    #[tokio::test]
    async fn rejected_wavelength_keeps_previous_target() {
        let (positioner, sim) = positioner();
        positioner.set_wavelength(780.5).await.unwrap();
        sim.reject("MOTBI:WL ", "ERROR:CODE 4 - value out of range");

        let err = positioner.set_wavelength(790.0).await.unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(positioner.target_wavelength(), Some(780.5));
    }

    #[tokio::test]
    async fn out_of_range_wavelength_is_not_sent() {
        let (positioner, sim) = positioner();
        let err = positioner.set_wavelength(1500.0).await.unwrap_err();
        assert!(matches!(err, MatisseError::InvalidParameter(_)));
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn bifi_wavelength_does_not_change_target() {
        let (positioner, sim) = positioner();
        positioner.set_bifi_wavelength(781.0).await.unwrap();
        assert_eq!(positioner.target_wavelength(), None);
        assert_eq!(sim.bifi_wavelength(), 781.0);
    }

    #[tokio::test]
    async fn motor_and_piezo_positions() {
        let (positioner, sim) = positioner();
        positioner
            .set_motor_position(Motor::ThinEtalon, 12_500)
            .await
            .unwrap();
        assert_eq!(positioner.motor_position(Motor::ThinEtalon).await.unwrap(), 12_500);

        positioner
            .set_piezo_position(Piezo::RefCell, 0.42)
            .await
            .unwrap();
        assert_eq!(sim.piezo(Piezo::RefCell), 0.42);
        assert_eq!(positioner.piezo_position(Piezo::RefCell).await.unwrap(), 0.42);

        let err = positioner
            .set_piezo_position(Piezo::SlowPiezo, 2.0)
            .await
            .unwrap_err();
        assert!(matches!(err, MatisseError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn confirmation_falls_back_to_bifi_reading() {
        let (positioner, _sim) = positioner();
        // BiFi reads 780 nm, no target yet
        assert!(positioner.needs_confirmation(792.0).await.unwrap());
        assert!(!positioner.needs_confirmation(785.0).await.unwrap());

        positioner.set_wavelength(800.0).await.unwrap();
        assert!(positioner.needs_confirmation(812.0).await.unwrap());
        assert!(!positioner.needs_confirmation(809.0).await.unwrap());
    }
}
