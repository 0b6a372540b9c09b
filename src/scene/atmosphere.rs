//! Planet atmosphere parameters
//!
//! Scattering coefficients are per meter at sea level; each medium falls
//! off with altitude over its average density height.

use glam::Vec3;

/// Scattering and absorption of a planet's atmosphere
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Atmosphere {
    pub planet_radius_km: f32,
    pub atmosphere_radius_km: f32,
    pub rayleigh_coefficients: Vec3,
    /// Height in km over which rayleigh density falls to 1/e
    pub rayleigh_average_km: f32,
    pub mie_coefficients: Vec3,
    pub mie_average_km: f32,
    /// Absorption only
    pub ozone_coefficients: Vec3,
    /// Altitude in km of the ozone layer's peak
    pub ozone_average_km: f32,
}

impl Default for Atmosphere {
    /// Earth
    fn default() -> Self {
        Self {
            planet_radius_km: 6360.0,
            atmosphere_radius_km: 6460.0,
            rayleigh_coefficients: Vec3::new(5.802, 13.558, 33.1) * 1e-6,
            rayleigh_average_km: 8.0,
            mie_coefficients: Vec3::splat(3.996) * 1e-6,
            mie_average_km: 1.2,
            ozone_coefficients: Vec3::new(0.650, 1.881, 0.085) * 1e-6,
            ozone_average_km: 25.0,
        }
    }
}

impl Atmosphere {
    pub const PLANET_RADIUS_RANGE_KM: (f32, f32) = (3000.0, 10000.0);
    pub const ATMOSPHERE_RADIUS_RANGE_KM: (f32, f32) = (3001.0, 12000.0);
    pub const AVERAGE_RANGE_KM: (f32, f32) = (1.0, 30.0);

    /// Clamp radii and densities into their editable ranges; the atmosphere
    /// always ends above the ground
    pub fn clamped(mut self) -> Self {
        let (lo, hi) = Self::PLANET_RADIUS_RANGE_KM;
        self.planet_radius_km = self.planet_radius_km.clamp(lo, hi);
        let (lo, hi) = Self::ATMOSPHERE_RADIUS_RANGE_KM;
        self.atmosphere_radius_km = self
            .atmosphere_radius_km
            .clamp(lo.max(self.planet_radius_km + 1.0), hi.max(self.planet_radius_km + 1.0));
        let (lo, hi) = Self::AVERAGE_RANGE_KM;
        self.rayleigh_average_km = self.rayleigh_average_km.clamp(lo, hi);
        self.mie_average_km = self.mie_average_km.clamp(lo, hi);
        self.ozone_average_km = self.ozone_average_km.clamp(lo, hi);
        self.rayleigh_coefficients = self.rayleigh_coefficients.max(Vec3::ZERO);
        self.mie_coefficients = self.mie_coefficients.max(Vec3::ZERO);
        self.ozone_coefficients = self.ozone_coefficients.max(Vec3::ZERO);
        self
    }

    pub fn thickness_km(&self) -> f32 {
        self.atmosphere_radius_km - self.planet_radius_km
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earth_is_inside_the_editable_ranges() {
        let earth = Atmosphere::default();
        assert_eq!(earth.clamped(), earth);
        assert_eq!(earth.thickness_km(), 100.0);
    }

    #[test]
    fn clamping_keeps_the_atmosphere_above_ground() {
        let thin = Atmosphere {
            planet_radius_km: 9000.0,
            atmosphere_radius_km: 4000.0,
            rayleigh_average_km: 0.0,
            mie_coefficients: Vec3::new(-1.0, 2.0, 0.0),
            ..Default::default()
        }
        .clamped();
        assert!(thin.atmosphere_radius_km > thin.planet_radius_km);
        assert_eq!(thin.rayleigh_average_km, 1.0);
        assert_eq!(thin.mie_coefficients, Vec3::new(0.0, 2.0, 0.0));
    }
}
