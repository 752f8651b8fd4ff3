//! Coarse tuning sweeps of the birefringent filter and thin etalon motors.
//!
//! A sweep visits `start - range ..= start + range` in `step` increments,
//! waits `settle` after each move, and samples a proxy signal until two
//! consecutive readings agree. The motor is then parked at the chosen
//! position. On any failure the motor goes back to where it started.
//!
//! Each kind of scan is exclusive with itself but not with the lock
//! supervisor or the other scan kind.
//!
//! [`Scanner::cancel_all`] stops running sweeps between steps. A cancelled
//! sweep takes the failure path, so its motor is back at the start position
//! before the claim is released.

use crate::positioning::TargetWavelength;
use matisse_core::config::{ScanSettings, SweepSettings};
use matisse_core::protocol::{self, BIFI_WAVELENGTH, DIODE_POWER, THIN_ETALON_REFLEX};
use matisse_core::{InstrumentLink, MatisseError, MatisseResult, ScanKind};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Summary of a completed sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Which sweep ran
    pub kind: ScanKind,
    /// Motor position before the sweep
    pub start_position: i64,
    /// Position the motor was parked at
    pub chosen_position: i64,
    /// Number of positions sampled
    pub samples: usize,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    position: i64,
    value: f64,
    wavelength_nm: Option<f64>,
}

/// Exclusive claim on one kind of scan; released on drop.
#[derive(Debug)]
pub struct ScanClaim {
    running: Arc<watch::Sender<HashSet<ScanKind>>>,
    cancel: watch::Receiver<u64>,
    generation: u64,
    kind: ScanKind,
}

impl ScanClaim {
    /// Kind of scan this claim covers.
    pub fn kind(&self) -> ScanKind {
        self.kind
    }

    /// Whether [`Scanner::cancel_all`] was called after this claim was taken.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow() != self.generation
    }

    fn check_cancelled(&self) -> MatisseResult<()> {
        if self.is_cancelled() {
            return Err(MatisseError::ScanCancelled(self.kind));
        }
        Ok(())
    }

    /// Wait for the motor to settle, waking early on cancellation.
    async fn settle(&mut self, duration: Duration) -> MatisseResult<()> {
        let generation = self.generation;
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.wait_for(|g| *g != generation) => {}
        }
        self.check_cancelled()
    }
}

impl Drop for ScanClaim {
    fn drop(&mut self) {
        let kind = self.kind;
        self.running.send_modify(|running| {
            running.remove(&kind);
        });
    }
}

/// Runs coarse tuning sweeps.
#[derive(Debug, Clone)]
pub struct Scanner {
    link: InstrumentLink,
    target: TargetWavelength,
    settings: ScanSettings,
    running: Arc<watch::Sender<HashSet<ScanKind>>>,
    cancel: Arc<watch::Sender<u64>>,
}

impl Scanner {
    /// Create a scanner.
    pub fn new(link: InstrumentLink, target: TargetWavelength, settings: ScanSettings) -> Self {
        Self {
            link,
            target,
            settings,
            running: Arc::new(watch::channel(HashSet::new()).0),
            cancel: Arc::new(watch::channel(0).0),
        }
    }

    /// Claim a scan kind, failing with [`MatisseError::ScanInProgress`] when
    /// a sweep of that kind is already running.
    pub fn claim(&self, kind: ScanKind) -> MatisseResult<ScanClaim> {
        if !self.running.send_if_modified(|running| running.insert(kind)) {
            return Err(MatisseError::ScanInProgress(kind));
        }
        let cancel = self.cancel.subscribe();
        let generation = *cancel.borrow();
        Ok(ScanClaim {
            running: self.running.clone(),
            cancel,
            generation,
            kind,
        })
    }

    /// Whether a sweep of `kind` is running.
    pub fn is_running(&self, kind: ScanKind) -> bool {
        self.running.borrow().contains(&kind)
    }

    /// Stop every sweep running now. Each returns its motor to the start
    /// position and fails with [`MatisseError::ScanCancelled`]. Sweeps
    /// claimed afterwards are not affected.
    pub fn cancel_all(&self) {
        self.cancel.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Wait until no sweep is running.
    pub async fn wait_idle(&self) {
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| running.is_empty()).await;
    }

    /// Sweep the birefringent filter and park it on the best power peak.
    pub async fn birefringent_filter_scan(&self) -> MatisseResult<ScanReport> {
        let claim = self.claim(ScanKind::BirefringentFilter)?;
        self.run_claimed(claim).await
    }

    /// Sweep the thin etalon and park it next to the reflex minimum.
    pub async fn thin_etalon_scan(&self) -> MatisseResult<ScanReport> {
        let claim = self.claim(ScanKind::ThinEtalon)?;
        self.run_claimed(claim).await
    }

    /// Run the sweep covered by an existing claim.
    #[instrument(skip_all, fields(scan = %claim.kind()), err)]
    pub async fn run_claimed(&self, mut claim: ScanClaim) -> MatisseResult<ScanReport> {
        let kind = claim.kind();
        let sweep = self.sweep_settings(kind);
        if sweep.step <= 0 || sweep.range <= 0 {
            return Err(MatisseError::Configuration(format!(
                "{} needs a positive range and step",
                kind
            )));
        }
        if sweep.step_count() > sweep.max_steps {
            return Err(MatisseError::Configuration(format!(
                "{} needs {} steps but max_steps is {}",
                kind,
                sweep.step_count(),
                sweep.max_steps
            )));
        }

        let motor = kind.motor();
        let start = self.link.read_i64(motor.position_parameter()).await?;
        info!("Starting {} around {}", kind, start);

        let result = self.sweep(&mut claim, sweep, start).await;
        if let Err(e) = &result {
            warn!(error = %e, "{} failed; returning {} to {}", kind, motor, start);
            if let Err(restore_err) = self.move_motor(kind, start).await {
                warn!(error = %restore_err, "Failed to restore {}", motor);
            }
        }
        drop(claim);
        result
    }

    async fn sweep(
        &self,
        claim: &mut ScanClaim,
        sweep: &SweepSettings,
        start: i64,
    ) -> MatisseResult<ScanReport> {
        let kind = claim.kind();
        let mut samples = Vec::with_capacity(sweep.step_count());
        let positions = (start - sweep.range..=start + sweep.range).step_by(sweep.step as usize);
        for position in positions {
            claim.check_cancelled()?;
            self.move_motor(kind, position).await?;
            claim.settle(sweep.settle).await?;
            samples.push(self.sample(kind, sweep, position).await?);
        }

        let chosen = match kind {
            ScanKind::BirefringentFilter => {
                choose_bifi_position(&samples, self.target.get(), self.settings.bifi.peak_fraction)
            }
            ScanKind::ThinEtalon => {
                choose_thin_etalon_position(&samples, self.settings.thin_etalon.offset)
            }
        }
        .ok_or_else(|| MatisseError::ScanDivergence {
            scan: kind,
            reason: "no usable signal".to_string(),
        })?;

        self.move_motor(kind, chosen).await?;
        info!("{} finished; {} set to {}", kind, kind.motor(), chosen);
        Ok(ScanReport {
            kind,
            start_position: start,
            chosen_position: chosen,
            samples: samples.len(),
        })
    }

    async fn sample(
        &self,
        kind: ScanKind,
        sweep: &SweepSettings,
        position: i64,
    ) -> MatisseResult<Sample> {
        let sample = match kind {
            ScanKind::BirefringentFilter => Sample {
                position,
                value: self.stable_reading(kind, DIODE_POWER, sweep).await?,
                wavelength_nm: Some(self.link.read_f64(BIFI_WAVELENGTH).await?),
            },
            ScanKind::ThinEtalon => Sample {
                position,
                value: self.stable_reading(kind, THIN_ETALON_REFLEX, sweep).await?,
                wavelength_nm: None,
            },
        };
        debug!(position, value = sample.value, "scan sample");
        Ok(sample)
    }

    async fn stable_reading(
        &self,
        kind: ScanKind,
        parameter: &str,
        sweep: &SweepSettings,
    ) -> MatisseResult<f64> {
        let mut previous = self.link.read_f64(parameter).await?;
        for _ in 1..sweep.max_reading_attempts {
            let current = self.link.read_f64(parameter).await?;
            if (current - previous).abs() <= sweep.stability_tolerance {
                return Ok(current);
            }
            previous = current;
        }
        Err(MatisseError::ScanDivergence {
            scan: kind,
            reason: format!(
                "{} did not settle after {} readings",
                parameter, sweep.max_reading_attempts
            ),
        })
    }

    async fn move_motor(&self, kind: ScanKind, position: i64) -> MatisseResult<()> {
        let parameter = kind.motor().position_parameter();
        self.link.command(&protocol::set(parameter, position)).await
    }

    fn sweep_settings(&self, kind: ScanKind) -> &SweepSettings {
        match kind {
            ScanKind::BirefringentFilter => &self.settings.bifi.sweep,
            ScanKind::ThinEtalon => &self.settings.thin_etalon.sweep,
        }
    }
}

/// Pick the BiFi position: among interior local power maxima at least
/// `peak_fraction` of the global maximum, the one whose wavelength is nearest
/// the target; the global maximum when there is no target or no such peak.
fn choose_bifi_position(
    samples: &[Sample],
    target_nm: Option<f64>,
    peak_fraction: f64,
) -> Option<i64> {
    let global = samples
        .iter()
        .max_by(|a, b| a.value.total_cmp(&b.value))
        .filter(|s| s.value > 0.0)?;

    let threshold = global.value * peak_fraction;
    let peaks: Vec<&Sample> = samples
        .windows(3)
        .filter(|w| w[1].value > w[0].value && w[1].value >= w[2].value)
        .map(|w| &w[1])
        .filter(|s| s.value >= threshold)
        .collect();

    let chosen = match target_nm {
        Some(target) if !peaks.is_empty() => peaks
            .into_iter()
            .filter_map(|s| s.wavelength_nm.map(|wl| (s, (wl - target).abs())))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(s, _)| s)
            .unwrap_or(global),
        _ => global,
    };
    Some(chosen.position)
}

/// Pick the thin etalon position: the reflex minimum shifted by `offset`.
fn choose_thin_etalon_position(samples: &[Sample], offset: i64) -> Option<i64> {
    samples
        .iter()
        .min_by(|a, b| a.value.total_cmp(&b.value))
        .map(|s| s.position + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(values: &[(i64, f64, f64)]) -> Vec<Sample> {
        values
            .iter()
            .map(|&(position, value, wl)| Sample {
                position,
                value,
                wavelength_nm: Some(wl),
            })
            .collect()
    }

    #[test]
    fn bifi_prefers_peak_nearest_target() {
        let s = samples(&[
            (0, 0.1, 778.0),
            (1, 0.8, 778.1),
            (2, 0.2, 778.2),
            (3, 0.3, 778.3),
            (4, 1.0, 778.4),
            (5, 0.1, 778.5),
        ]);
        assert_eq!(choose_bifi_position(&s, None, 0.5), Some(4));
        assert_eq!(choose_bifi_position(&s, Some(778.0), 0.5), Some(1));
        assert_eq!(choose_bifi_position(&s, Some(778.45), 0.5), Some(4));
    }

    #[test]
    fn bifi_ignores_weak_peaks() {
        let s = samples(&[
            (0, 0.1, 778.0),
            (1, 0.3, 778.1),
            (2, 0.2, 778.2),
            (3, 1.0, 778.3),
            (4, 0.1, 778.4),
        ]);
        assert_eq!(choose_bifi_position(&s, Some(778.1), 0.5), Some(3));
    }

    #[test]
    fn bifi_without_power_has_no_choice() {
        let s = samples(&[(0, 0.0, 778.0), (1, 0.0, 778.1)]);
        assert_eq!(choose_bifi_position(&s, None, 0.5), None);
    }

    #[test]
    fn thin_etalon_picks_offset_minimum() {
        let s = samples(&[(100, 0.9, 0.0), (110, 0.4, 0.0), (120, 0.7, 0.0)]);
        assert_eq!(choose_thin_etalon_position(&s, -5), Some(105));
        assert_eq!(choose_thin_etalon_position(&[], -5), None);
    }
}
