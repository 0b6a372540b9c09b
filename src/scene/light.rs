//! Light types for the scene

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::backend::clip_space_correction;
use crate::BackendType;

/// Directional light (like the sun)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    /// Direction the light travels, normalized
    pub direction: Vec3,
    pub color: Vec3,
    pub power: f32,
    /// World to shadow-map clip space
    pub view_projection: Mat4,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self {
            direction: Vec3::new(-0.5, -1.0, -0.5).normalize(),
            color: Vec3::ONE,
            power: 1.0,
            view_projection: Mat4::IDENTITY,
        }
    }
}

/// Point light with a physical radius
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphereLight {
    pub position: Vec3,
    pub color: Vec3,
    /// Luminous power in lumens
    pub power: f32,
    pub radius: f32,
}

impl Default for SphereLight {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            color: Vec3::ONE,
            power: 100.0,
            radius: 1.0,
        }
    }
}

impl SphereLight {
    pub fn new(position: Vec3, color: Vec3, power: f32) -> Self {
        Self {
            position,
            color,
            power,
            ..Default::default()
        }
    }

    pub fn to_gpu_data(&self) -> GpuSphereLight {
        GpuSphereLight {
            position_power: self.position.extend(self.power),
            color_radius: self.color.extend(self.radius),
        }
    }
}

/// Sphere light layout read by the lighting shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuSphereLight {
    /// xyz = position, w = power
    pub position_power: Vec4,
    /// xyz = color, w = radius
    pub color_radius: Vec4,
}

/// The sun, placed on the sky by azimuth and elevation
#[derive(Debug, Clone, PartialEq)]
pub struct Sun {
    /// Radians clockwise from -Z seen from above
    pub azimuth: f32,
    /// Elevation above the horizon in radians
    pub angle: f32,
    color: Vec3,
    power: f32,
    /// Half extent of the square area covered by the shadow map
    pub shadow_extent: f32,
}

impl Default for Sun {
    fn default() -> Self {
        Self {
            azimuth: 0.6,
            angle: 0.9,
            color: Vec3::new(1.0, 0.95, 0.85),
            power: 3.0,
            shadow_extent: 20.0,
        }
    }
}

impl Sun {
    pub fn new(azimuth: f32, angle: f32) -> Self {
        Self {
            azimuth,
            angle,
            ..Default::default()
        }
    }

    pub fn color(&self) -> Vec3 {
        self.color
    }

    pub fn set_color(&mut self, color: Vec3) {
        self.color = color;
    }

    pub fn power(&self) -> f32 {
        self.power
    }

    pub fn set_power(&mut self, power: f32) {
        self.power = power;
    }

    /// Unit vector from the ground towards the sun
    pub fn to_sun(&self) -> Vec3 {
        Vec3::new(
            self.angle.cos() * self.azimuth.sin(),
            self.angle.sin(),
            -self.angle.cos() * self.azimuth.cos(),
        )
    }

    /// Direction the sunlight travels
    pub fn direction(&self) -> Vec3 {
        -self.to_sun()
    }

    /// Orthographic light-space transform centered on `focus`
    pub fn light_view_projection(&self, focus: Vec3, backend: BackendType) -> Mat4 {
        let extent = self.shadow_extent.max(0.1);
        let direction = self.direction();
        let up = if direction.cross(Vec3::Y).length_squared() < 1e-6 {
            Vec3::Z
        } else {
            Vec3::Y
        };
        let eye = focus - direction * extent * 2.0;
        let view = Mat4::look_at_rh(eye, focus, up);
        let projection = Mat4::orthographic_rh(-extent, extent, -extent, extent, 0.1, extent * 4.0);
        clip_space_correction(backend) * projection * view
    }

    pub fn to_directional_light(&self, focus: Vec3, backend: BackendType) -> DirectionalLight {
        DirectionalLight {
            direction: self.direction(),
            color: self.color,
            power: self.power,
            view_projection: self.light_view_projection(focus, backend),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_write_through() {
        let mut sun = Sun::default();
        sun.set_color(Vec3::new(1.0, 0.0, 0.0));
        sun.set_power(7.5);
        assert_eq!(sun.color(), Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(sun.power(), 7.5);

        let light = sun.to_directional_light(Vec3::ZERO, BackendType::Headless);
        assert_eq!(light.color, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(light.power, 7.5);
    }

    #[test]
    fn overhead_sun_points_down() {
        let sun = Sun::new(0.0, std::f32::consts::FRAC_PI_2);
        assert!((sun.direction() - -Vec3::Y).length() < 1e-5);
        // straight down must not produce a degenerate view
        let m = sun.light_view_projection(Vec3::ZERO, BackendType::Headless);
        assert!(m.is_finite());
    }

    #[test]
    fn focus_projects_to_shadow_map_center() {
        let sun = Sun::default();
        let focus = Vec3::new(3.0, 0.0, -2.0);
        let clip = sun.light_view_projection(focus, BackendType::Dx12) * focus.extend(1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-4 && ndc.y.abs() < 1e-4);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn sphere_light_radius_defaults_to_one() {
        let light = SphereLight::new(Vec3::ONE, Vec3::ONE, 800.0);
        assert_eq!(light.radius, 1.0);
        assert_eq!(light.to_gpu_data().color_radius.w, 1.0);
        assert_eq!(light.to_gpu_data().position_power.w, 800.0);
    }
}
