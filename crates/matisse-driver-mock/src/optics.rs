//! Signal models behind the simulated diode power and thin etalon reflex.

/// A single transmission peak of the birefringent filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerPeak {
    /// Motor position of the peak centre (steps)
    pub center: i64,
    /// Peak diode power (arbitrary units)
    pub height: f64,
    /// Gaussian half-width (steps)
    pub width: f64,
}

/// Motor/optics model of the simulated cavity.
#[derive(Debug, Clone, PartialEq)]
pub struct OpticsModel {
    /// BiFi motor position at which the BiFi reads `bifi_reference_nm`.
    pub bifi_reference_position: i64,
    /// BiFi wavelength at the reference position (nm).
    pub bifi_reference_nm: f64,
    /// Wavelength change per BiFi motor step (nm).
    pub bifi_nm_per_step: f64,
    /// Diode power peaks along the BiFi travel.
    pub power_peaks: Vec<PowerPeak>,
    /// Thin etalon motor position of the reflex minimum.
    pub reflex_center: i64,
    /// Gaussian half-width of the reflex dip (steps).
    pub reflex_width: f64,
    /// Depth of the reflex dip below the unit baseline.
    pub reflex_depth: f64,
}

impl Default for OpticsModel {
    fn default() -> Self {
        Self {
            bifi_reference_position: 100_000,
            bifi_reference_nm: 780.0,
            bifi_nm_per_step: 0.01,
            power_peaks: vec![
                PowerPeak {
                    center: 99_800,
                    height: 0.9,
                    width: 40.0,
                },
                PowerPeak {
                    center: 100_000,
                    height: 0.3,
                    width: 40.0,
                },
                PowerPeak {
                    center: 100_200,
                    height: 1.0,
                    width: 40.0,
                },
            ],
            reflex_center: 10_300,
            reflex_width: 200.0,
            reflex_depth: 0.7,
        }
    }
}

impl OpticsModel {
    /// BiFi wavelength at a motor position.
    pub fn bifi_wavelength(&self, position: i64) -> f64 {
        self.bifi_reference_nm
            + (position - self.bifi_reference_position) as f64 * self.bifi_nm_per_step
    }

    /// BiFi motor position closest to a wavelength.
    pub fn bifi_position(&self, wavelength_nm: f64) -> i64 {
        let offset = (wavelength_nm - self.bifi_reference_nm) / self.bifi_nm_per_step;
        self.bifi_reference_position + offset.round() as i64
    }

    /// Diode power at a BiFi motor position.
    pub fn diode_power(&self, bifi_position: i64) -> f64 {
        self.power_peaks
            .iter()
            .map(|peak| peak.height * gaussian(bifi_position - peak.center, peak.width))
            .sum()
    }

    /// Thin etalon reflex at a thin etalon motor position.
    pub fn reflex(&self, thin_etalon_position: i64) -> f64 {
        1.0 - self.reflex_depth
            * gaussian(thin_etalon_position - self.reflex_center, self.reflex_width)
    }
}

fn gaussian(offset: i64, width: f64) -> f64 {
    let x = offset as f64 / width;
    (-x * x).exp()
}
