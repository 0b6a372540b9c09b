//! Per-frame data shared between entity updates and rendering
//!
//! Entity jobs run in parallel and only ever see `&FrameParams`; every field
//! they write to is behind its own lock, held just for the append.

use bitflags::bitflags;
use glam::{Mat4, Vec2, Vec3};
use parking_lot::{Mutex, MutexGuard};

use crate::BackendType;

use super::{Atmosphere, DirectionalLight, DynamicDrawCall, SphereLight, StaticDrawCall};

/// Sphere lights the lighting pass can shade per frame
pub const MAX_SPHERE_LIGHTS: usize = 4;

bitflags! {
    /// Buttons held this frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u32 {
        const FORWARD = 1 << 0;
        const BACKWARD = 1 << 1;
        const LEFT = 1 << 2;
        const RIGHT = 1 << 3;
        const UP = 1 << 4;
        const DOWN = 1 << 5;
        const SPRINT = 1 << 6;
        const MOUSE_LOOK = 1 << 7;
        const ACTION = 1 << 8;
    }
}

/// Input sampled once per frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub buttons: Buttons,
    /// Cursor position in window pixels
    pub mouse_position: Vec2,
    /// Cursor movement since the previous frame
    pub mouse_delta: Vec2,
    pub scroll_delta: f32,
}

impl InputState {
    pub fn is_down(&self, buttons: Buttons) -> bool {
        self.buttons.contains(buttons)
    }

    /// Drop per-frame deltas, keeping held buttons
    pub fn reset_deltas(&mut self) {
        self.mouse_delta = Vec2::ZERO;
        self.scroll_delta = 0.0;
    }
}

/// A list appended to from many threads
#[derive(Debug)]
pub struct DrawList<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for DrawList<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> DrawList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.items.lock().push(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Lock the list for reading
    pub fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.items.lock()
    }

    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

/// Everything one frame carries from simulation to rendering
#[derive(Debug)]
pub struct FrameParams {
    pub frame_index: u64,
    /// Seconds since the previous frame
    pub delta_time: f32,
    /// Seconds since the engine started
    pub time: f32,
    pub view: Mat4,
    /// Projection including the backend's clip-space correction
    pub projection: Mat4,
    pub eye: Vec3,
    pub viewport: (u32, u32),
    pub backend: BackendType,
    pub input: InputState,
    pub static_draws: DrawList<StaticDrawCall>,
    pub dynamic_draws: DrawList<DynamicDrawCall>,
    pub gui_draws: DrawList<DynamicDrawCall>,
    sun: Mutex<Option<DirectionalLight>>,
    sphere_lights: Mutex<Vec<SphereLight>>,
    atmosphere: Mutex<Option<Atmosphere>>,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            frame_index: 0,
            delta_time: 0.0,
            time: 0.0,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            eye: Vec3::ZERO,
            viewport: (1, 1),
            backend: BackendType::Headless,
            input: InputState::default(),
            static_draws: DrawList::new(),
            dynamic_draws: DrawList::new(),
            gui_draws: DrawList::new(),
            sun: Mutex::new(None),
            sphere_lights: Mutex::new(Vec::with_capacity(MAX_SPHERE_LIGHTS)),
            atmosphere: Mutex::new(None),
        }
    }
}

impl FrameParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection * self.view
    }

    /// Start a new frame: draw lists and lights are emptied, camera and
    /// input are kept until overwritten
    pub fn reset(&mut self, frame_index: u64, delta_time: f32) {
        self.frame_index = frame_index;
        self.delta_time = delta_time;
        self.time += delta_time;
        self.static_draws.clear();
        self.dynamic_draws.clear();
        self.gui_draws.clear();
        *self.sun.get_mut() = None;
        self.sphere_lights.get_mut().clear();
        *self.atmosphere.get_mut() = None;
    }

    /// Occupy the single directional light slot; the last writer wins
    pub fn set_sun(&self, light: DirectionalLight) {
        *self.sun.lock() = Some(light);
    }

    pub fn sun(&self) -> Option<DirectionalLight> {
        *self.sun.lock()
    }

    /// Add a sphere light; returns false once all slots are taken
    pub fn push_sphere_light(&self, light: SphereLight) -> bool {
        let mut lights = self.sphere_lights.lock();
        if lights.len() >= MAX_SPHERE_LIGHTS {
            return false;
        }
        lights.push(light);
        true
    }

    pub fn sphere_lights(&self) -> Vec<SphereLight> {
        self.sphere_lights.lock().clone()
    }

    /// Occupy the single atmosphere slot; the last writer wins
    pub fn set_atmosphere(&self, atmosphere: Atmosphere) {
        *self.atmosphere.lock() = Some(atmosphere);
    }

    pub fn atmosphere(&self) -> Option<Atmosphere> {
        *self.atmosphere.lock()
    }
}

static_assertions::assert_impl_all!(FrameParams: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_light_slots_are_capped() {
        let frame = FrameParams::new();
        for _ in 0..MAX_SPHERE_LIGHTS {
            assert!(frame.push_sphere_light(SphereLight::default()));
        }
        assert!(!frame.push_sphere_light(SphereLight::default()));
        assert_eq!(frame.sphere_lights().len(), MAX_SPHERE_LIGHTS);
    }

    #[test]
    fn reset_clears_lists_and_lights() {
        let mut frame = FrameParams::new();
        frame.set_sun(DirectionalLight::default());
        frame.set_atmosphere(Atmosphere::default());
        frame.push_sphere_light(SphereLight::default());
        frame
            .dynamic_draws
            .push(DynamicDrawCall::lines("line", Mat4::IDENTITY, &[Vec3::ZERO, Vec3::X], Vec3::ONE));
        frame.reset(2, 0.5);
        assert!(frame.sun().is_none());
        assert!(frame.atmosphere().is_none());
        assert!(frame.sphere_lights().is_empty());
        assert!(frame.dynamic_draws.is_empty());
        assert_eq!(frame.frame_index, 2);
        assert_eq!(frame.time, 0.5);
    }

    #[test]
    fn concurrent_pushes_are_all_kept() {
        let list = DrawList::new();
        std::thread::scope(|s| {
            for t in 0..4 {
                let list = &list;
                s.spawn(move || {
                    for i in 0..250 {
                        list.push(t * 1000 + i);
                    }
                });
            }
        });
        assert_eq!(list.len(), 1000);
    }
}
