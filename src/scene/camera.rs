//! Camera system

use glam::{Mat4, Vec2, Vec3};

use crate::backend::clip_space_correction;
use crate::BackendType;

use super::{Buttons, FrameParams, InputState};

/// Camera projection type
#[derive(Debug, Clone, Copy)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: std::f32::consts::FRAC_PI_4, // 45 degrees
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn orthographic(width: f32, height: f32, near: f32, far: f32) -> Self {
        let half_w = width / 2.0;
        let half_h = height / 2.0;
        Projection::Orthographic {
            left: -half_w,
            right: half_w,
            bottom: -half_h,
            top: half_h,
            near,
            far,
        }
    }

    /// Right-handed, depth zero to one, before any backend correction
    pub fn matrix(&self) -> Mat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
                near,
                far,
            } => Mat4::orthographic_rh(left, right, bottom, top, near, far),
        }
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        if let Projection::Perspective { aspect: a, .. } = self {
            *a = aspect;
        }
    }
}

/// Free-flying camera oriented by yaw and pitch
///
/// Yaw 0 looks down -Z; positive pitch looks up.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    /// Radians around +Y
    pub yaw: f32,
    /// Radians, clamped just short of straight up/down
    pub pitch: f32,
    pub projection: Projection,
    /// Units per second
    pub move_speed: f32,
    /// Radians per pixel of mouse movement
    pub mouse_sensitivity: f32,
}

const PITCH_LIMIT: f32 = std::f32::consts::FRAC_PI_2 - 0.01;

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 5.0),
            yaw: 0.0,
            pitch: 0.0,
            projection: Projection::default(),
            move_speed: 5.0,
            mouse_sensitivity: 0.003,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Orient the camera towards `target`
    pub fn look_at(&mut self, target: Vec3) {
        let direction = (target - self.position).normalize_or_zero();
        if direction == Vec3::ZERO {
            return;
        }
        self.yaw = direction.x.atan2(-direction.z);
        self.pitch = direction.y.asin().clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    pub fn forward(&self) -> Vec3 {
        Vec3::new(
            self.yaw.sin() * self.pitch.cos(),
            self.pitch.sin(),
            -self.yaw.cos() * self.pitch.cos(),
        )
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(Vec3::Y).normalize()
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward(), Vec3::Y)
    }

    /// Projection with the backend's clip-space correction applied
    pub fn projection_matrix(&self, backend: BackendType) -> Mat4 {
        clip_space_correction(backend) * self.projection.matrix()
    }

    pub fn view_projection_matrix(&self, backend: BackendType) -> Mat4 {
        self.projection_matrix(backend) * self.view_matrix()
    }

    pub fn set_aspect(&mut self, width: f32, height: f32) {
        if height > 0.0 {
            self.projection.set_aspect(width / height);
        }
    }

    /// Free-fly movement: WASD/QE style buttons, mouse look while held
    pub fn update(&mut self, input: &InputState, dt: f32) {
        if input.buttons.contains(Buttons::MOUSE_LOOK) {
            let delta = input.mouse_delta * self.mouse_sensitivity;
            self.yaw += delta.x;
            self.pitch = (self.pitch - delta.y).clamp(-PITCH_LIMIT, PITCH_LIMIT);
        }
        if input.scroll_delta != 0.0 {
            self.move_speed = (self.move_speed * (1.0 + input.scroll_delta * 0.1)).clamp(0.1, 100.0);
        }

        let mut direction = Vec2::ZERO;
        let mut vertical = 0.0;
        let pairs = [
            (Buttons::FORWARD, Vec2::Y),
            (Buttons::BACKWARD, -Vec2::Y),
            (Buttons::RIGHT, Vec2::X),
            (Buttons::LEFT, -Vec2::X),
        ];
        for (button, axis) in pairs {
            if input.buttons.contains(button) {
                direction += axis;
            }
        }
        if input.buttons.contains(Buttons::UP) {
            vertical += 1.0;
        }
        if input.buttons.contains(Buttons::DOWN) {
            vertical -= 1.0;
        }

        let mut speed = self.move_speed * dt;
        if input.buttons.contains(Buttons::SPRINT) {
            speed *= 2.0;
        }
        let movement = self.forward() * direction.y + self.right() * direction.x + Vec3::Y * vertical;
        self.position += movement.normalize_or_zero() * speed;
    }

    /// Write view, corrected projection, eye and viewport into `frame`
    pub fn write_frame(&self, frame: &mut FrameParams, backend: BackendType, width: u32, height: u32) {
        frame.view = self.view_matrix();
        frame.projection = self.projection_matrix(backend);
        frame.eye = self.position;
        frame.viewport = (width, height);
        frame.backend = backend;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn look_at_points_forward_at_target() {
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, 5.0));
        camera.look_at(Vec3::new(5.0, 0.0, 0.0));
        let expected = Vec3::new(5.0, 0.0, -5.0).normalize();
        assert!((camera.forward() - expected).length() < 1e-5);
    }

    #[test]
    fn vulkan_projection_is_y_flipped() {
        let camera = Camera::default();
        let dx = camera.projection_matrix(BackendType::Dx12);
        let vk = camera.projection_matrix(BackendType::Vulkan);
        assert_eq!(vk.row(1), -dx.row(1));
        assert_eq!(vk.row(0), dx.row(0));
    }

    #[test]
    fn forward_button_moves_along_view_direction() {
        let mut camera = Camera::new(Vec3::ZERO);
        let input = InputState {
            buttons: Buttons::FORWARD,
            ..Default::default()
        };
        camera.update(&input, 1.0);
        assert!((camera.position - Vec3::new(0.0, 0.0, -5.0)).length() < 1e-5);
    }
}
