//! Scene entities
//!
//! Entities are updated from worker threads and only receive `&self`, so
//! any state they change per frame lives behind a mutex.

use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use parking_lot::Mutex;

use crate::backend::PrimitiveTopology;
use crate::resources::{Geometry, Material};

use super::{
    Atmosphere, ColorVertex, DynamicDrawCall, FrameParams, SphereLight, StaticDrawCall, Sun,
    Transform,
};

/// Stable identifier of an entity inside a [`World`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

/// Something living in the scene that contributes to a frame
pub trait Entity: Send + Sync {
    fn name(&self) -> &str;

    /// First stage: simulate and move
    fn update(&self, _frame: &FrameParams) {}

    /// Second stage, after every entity finished `update`: publish draws and lights
    fn late_update(&self, _frame: &FrameParams) {}

    /// Move the entity by `offset`; entities without a position return false
    fn translate(&self, _offset: Vec3) -> bool {
        false
    }

    fn position(&self) -> Option<Vec3> {
        None
    }
}

/// Flat list of entities addressed by id
#[derive(Default)]
pub struct World {
    entities: Vec<(EntityId, Box<dyn Entity>)>,
    next_id: u64,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, entity: impl Entity + 'static) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        log::debug!("Spawned entity {} ({})", id.0, entity.name());
        self.entities.push((id, Box::new(entity)));
        id
    }

    pub fn despawn(&mut self, id: EntityId) -> bool {
        let before = self.entities.len();
        self.entities.retain(|(e, _)| *e != id);
        before != self.entities.len()
    }

    pub fn get(&self, id: EntityId) -> Option<&dyn Entity> {
        self.entities
            .iter()
            .find(|(e, _)| *e == id)
            .map(|(_, entity)| entity.as_ref())
    }

    pub fn find(&self, name: &str) -> Option<EntityId> {
        self.entities
            .iter()
            .find(|(_, entity)| entity.name() == name)
            .map(|(id, _)| *id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &dyn Entity> {
        self.entities.iter().map(|(_, e)| e.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Renders geometry through a material
pub struct MeshEntity {
    name: String,
    transform: Mutex<Transform>,
    geometry: Arc<Geometry>,
    material: Option<Arc<dyn Material>>,
    /// Axis and radians per second
    spin: Option<(Vec3, f32)>,
}

impl MeshEntity {
    pub fn new(name: impl Into<String>, geometry: Arc<Geometry>, transform: Transform) -> Self {
        Self {
            name: name.into(),
            transform: Mutex::new(transform),
            geometry,
            material: None,
            spin: None,
        }
    }

    pub fn with_material(mut self, material: Arc<dyn Material>) -> Self {
        self.material = Some(material);
        self
    }

    pub fn with_spin(mut self, axis: Vec3, radians_per_second: f32) -> Self {
        self.spin = Some((axis.normalize_or_zero(), radians_per_second));
        self
    }

    pub fn transform(&self) -> Transform {
        *self.transform.lock()
    }
}

impl Entity for MeshEntity {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&self, frame: &FrameParams) {
        if let Some((axis, speed)) = self.spin {
            if axis != Vec3::ZERO {
                self.transform
                    .lock()
                    .rotate_axis(axis, speed * frame.delta_time);
            }
        }
    }

    fn late_update(&self, frame: &FrameParams) {
        let draw = StaticDrawCall {
            name: self.name.clone(),
            transform: self.transform.lock().matrix(),
            material: self.material.clone(),
            geometry: self.geometry.clone(),
            topology: PrimitiveTopology::TriangleList,
        };
        frame.static_draws.push(draw);
    }

    fn translate(&self, offset: Vec3) -> bool {
        self.transform.lock().translate(offset);
        true
    }

    fn position(&self) -> Option<Vec3> {
        Some(self.transform.lock().position)
    }
}

/// Point light occupying one of the frame's sphere light slots
pub struct SphereLightEntity {
    name: String,
    light: Mutex<SphereLight>,
}

impl SphereLightEntity {
    pub fn new(name: impl Into<String>, light: SphereLight) -> Self {
        Self {
            name: name.into(),
            light: Mutex::new(light),
        }
    }

    pub fn light(&self) -> SphereLight {
        *self.light.lock()
    }
}

impl Entity for SphereLightEntity {
    fn name(&self) -> &str {
        &self.name
    }

    fn late_update(&self, frame: &FrameParams) {
        if !frame.push_sphere_light(*self.light.lock()) {
            log::trace!("Sphere light {} dropped, all slots taken", self.name);
        }
    }

    fn translate(&self, offset: Vec3) -> bool {
        self.light.lock().position += offset;
        true
    }

    fn position(&self) -> Option<Vec3> {
        Some(self.light.lock().position)
    }
}

/// The scene's directional light
///
/// The shadow map is centered on `focus`.
pub struct SunEntity {
    name: String,
    sun: Mutex<Sun>,
    focus: Mutex<Vec3>,
}

impl SunEntity {
    pub fn new(name: impl Into<String>, sun: Sun) -> Self {
        Self {
            name: name.into(),
            sun: Mutex::new(sun),
            focus: Mutex::new(Vec3::ZERO),
        }
    }

    pub fn sun(&self) -> Sun {
        self.sun.lock().clone()
    }

    pub fn set_color(&self, color: Vec3) {
        self.sun.lock().set_color(color);
    }

    pub fn set_power(&self, power: f32) {
        self.sun.lock().set_power(power);
    }

    pub fn set_angles(&self, azimuth: f32, angle: f32) {
        let mut sun = self.sun.lock();
        sun.azimuth = azimuth;
        sun.angle = angle;
    }
}

impl Entity for SunEntity {
    fn name(&self) -> &str {
        &self.name
    }

    fn late_update(&self, frame: &FrameParams) {
        let focus = *self.focus.lock();
        let light = self.sun.lock().to_directional_light(focus, frame.backend);
        frame.set_sun(light);
    }

    /// Moves the shadow focus point
    fn translate(&self, offset: Vec3) -> bool {
        *self.focus.lock() += offset;
        true
    }

    fn position(&self) -> Option<Vec3> {
        Some(*self.focus.lock())
    }
}

/// Publishes the planet's atmosphere; the sky is only drawn while one exists
pub struct AtmosphereEntity {
    name: String,
    atmosphere: Mutex<Atmosphere>,
}

impl AtmosphereEntity {
    pub fn new(name: impl Into<String>, atmosphere: Atmosphere) -> Self {
        Self {
            name: name.into(),
            atmosphere: Mutex::new(atmosphere.clamped()),
        }
    }

    pub fn atmosphere(&self) -> Atmosphere {
        *self.atmosphere.lock()
    }

    /// Values outside the editable ranges are clamped
    pub fn set_atmosphere(&self, atmosphere: Atmosphere) {
        *self.atmosphere.lock() = atmosphere.clamped();
    }
}

impl Entity for AtmosphereEntity {
    fn name(&self) -> &str {
        &self.name
    }

    fn late_update(&self, frame: &FrameParams) {
        frame.set_atmosphere(*self.atmosphere.lock());
    }
}

/// Debug or overlay shape drawn with inline vertices
pub struct DebugShapeEntity {
    name: String,
    transform: Mutex<Transform>,
    vertices: Vec<ColorVertex>,
    indices: Vec<u16>,
    color: Vec4,
    topology: PrimitiveTopology,
    /// Draw into the screen-space gui list instead of the world
    gui: bool,
}

impl DebugShapeEntity {
    pub fn new(
        name: impl Into<String>,
        vertices: Vec<ColorVertex>,
        indices: Vec<u16>,
        topology: PrimitiveTopology,
    ) -> Self {
        Self {
            name: name.into(),
            transform: Mutex::new(Transform::default()),
            vertices,
            indices,
            color: Vec4::ONE,
            topology,
            gui: false,
        }
    }

    /// Unit-length RGB axes at the origin
    pub fn axes(name: impl Into<String>) -> Self {
        let mut vertices = Vec::with_capacity(6);
        for axis in [Vec3::X, Vec3::Y, Vec3::Z] {
            vertices.push(ColorVertex::new(Vec3::ZERO, axis));
            vertices.push(ColorVertex::new(axis, axis));
        }
        Self::new(name, vertices, Vec::new(), PrimitiveTopology::LineList)
    }

    /// Wireframe cube of edge length `size`
    pub fn wire_cube(name: impl Into<String>, size: f32, color: Vec3) -> Self {
        let h = size * 0.5;
        let corners: Vec<ColorVertex> = (0..8)
            .map(|i| {
                let p = Vec3::new(
                    if i & 1 == 0 { -h } else { h },
                    if i & 2 == 0 { -h } else { h },
                    if i & 4 == 0 { -h } else { h },
                );
                ColorVertex::new(p, color)
            })
            .collect();
        let indices = vec![
            0, 1, 2, 3, 4, 5, 6, 7, // x edges
            0, 2, 1, 3, 4, 6, 5, 7, // y edges
            0, 4, 1, 5, 2, 6, 3, 7, // z edges
        ];
        Self::new(name, corners, indices, PrimitiveTopology::LineList)
    }

    /// Flat grid in the XZ plane with `cells` squares per side
    pub fn grid(name: impl Into<String>, cells: u16, spacing: f32, color: Vec3) -> Self {
        let half = cells as f32 * spacing * 0.5;
        let mut vertices = Vec::with_capacity((cells as usize + 1) * 4);
        for i in 0..=cells {
            let t = -half + i as f32 * spacing;
            vertices.push(ColorVertex::new(Vec3::new(t, 0.0, -half), color));
            vertices.push(ColorVertex::new(Vec3::new(t, 0.0, half), color));
            vertices.push(ColorVertex::new(Vec3::new(-half, 0.0, t), color));
            vertices.push(ColorVertex::new(Vec3::new(half, 0.0, t), color));
        }
        Self::new(name, vertices, Vec::new(), PrimitiveTopology::LineList)
    }

    pub fn with_transform(self, transform: Transform) -> Self {
        *self.transform.lock() = transform;
        self
    }

    pub fn with_color(mut self, color: Vec4) -> Self {
        self.color = color;
        self
    }

    pub fn in_gui(mut self) -> Self {
        self.gui = true;
        self
    }

    fn draw_call(&self, transform: Mat4) -> DynamicDrawCall {
        DynamicDrawCall {
            name: self.name.clone(),
            transform,
            vertices: self.vertices.clone(),
            indices: self.indices.clone(),
            color: self.color,
            topology: self.topology,
        }
    }
}

impl Entity for DebugShapeEntity {
    fn name(&self) -> &str {
        &self.name
    }

    fn late_update(&self, frame: &FrameParams) {
        if self.vertices.is_empty() {
            return;
        }
        let draw = self.draw_call(self.transform.lock().matrix());
        if self.gui {
            frame.gui_draws.push(draw);
        } else {
            frame.dynamic_draws.push(draw);
        }
    }

    fn translate(&self, offset: Vec3) -> bool {
        self.transform.lock().translate(offset);
        true
    }

    fn position(&self) -> Option<Vec3> {
        Some(self.transform.lock().position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn world_ids_are_stable_after_despawn() {
        let mut world = World::new();
        let a = world.spawn(DebugShapeEntity::axes("a"));
        let b = world.spawn(DebugShapeEntity::axes("b"));
        assert!(world.despawn(a));
        assert!(world.get(a).is_none());
        assert_eq!(world.get(b).map(|e| e.name()), Some("b"));
        assert_eq!(world.find("b"), Some(b));
        let c = world.spawn(DebugShapeEntity::axes("c"));
        assert_ne!(c, a);
    }

    #[test]
    fn sun_entity_publishes_updated_color() {
        let sun = SunEntity::new("sun", Sun::default());
        sun.set_color(Vec3::new(0.2, 0.4, 0.6));
        sun.set_power(11.0);
        let frame = FrameParams::new();
        sun.late_update(&frame);
        let light = frame.sun().unwrap();
        assert_eq!(light.color, Vec3::new(0.2, 0.4, 0.6));
        assert_eq!(light.power, 11.0);
    }

    #[test]
    fn debug_shapes_choose_their_list() {
        let frame = FrameParams::new();
        DebugShapeEntity::grid("grid", 4, 1.0, Vec3::ONE).late_update(&frame);
        DebugShapeEntity::wire_cube("box", 1.0, Vec3::ONE)
            .in_gui()
            .late_update(&frame);
        assert_eq!(frame.dynamic_draws.len(), 1);
        assert_eq!(frame.gui_draws.len(), 1);
        assert_eq!(frame.dynamic_draws.lock()[0].vertices.len(), 20);
    }

    #[test]
    fn atmosphere_entity_publishes_clamped_params() {
        let entity = AtmosphereEntity::new("sky", Atmosphere::default());
        entity.set_atmosphere(Atmosphere {
            planet_radius_km: 20000.0,
            ..Default::default()
        });
        assert_eq!(entity.atmosphere().planet_radius_km, 10000.0);

        let frame = FrameParams::new();
        assert!(frame.atmosphere().is_none());
        entity.late_update(&frame);
        assert_eq!(frame.atmosphere(), Some(entity.atmosphere()));
    }

    #[test]
    fn translate_moves_sphere_light() {
        let entity = SphereLightEntity::new("lamp", SphereLight::default());
        assert!(entity.translate(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(entity.light().position, Vec3::new(1.0, 2.0, 3.0));
    }
}
