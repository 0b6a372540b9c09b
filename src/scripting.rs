//! Script integration
//!
//! Scripts never see engine internals. A [`ScriptHost`] is handed a
//! [`ScriptCapabilities`] once per frame, after entity updates, and can only
//! read input and move entities through it.

use glam::Vec3;

use crate::scene::{EntityId, InputState, World};

/// What a script may do to the engine
pub trait ScriptCapabilities {
    /// Input sampled for the current frame
    fn get_input_state(&self) -> InputState;

    /// Move an entity by `offset`
    ///
    /// Returns false when the entity does not exist or has no position.
    fn translate_entity(&self, entity: EntityId, offset: Vec3) -> bool;

    /// Look an entity up by name
    fn find_entity(&self, _name: &str) -> Option<EntityId> {
        None
    }
}

/// An embedded script runtime driven by the engine
pub trait ScriptHost: Send {
    fn run(&mut self, caps: &dyn ScriptCapabilities, delta_time: f32);
}

/// Capabilities backed by the engine's world for one frame
pub struct EngineCapabilities<'a> {
    world: &'a World,
    input: InputState,
}

impl<'a> EngineCapabilities<'a> {
    pub fn new(world: &'a World, input: InputState) -> Self {
        Self { world, input }
    }
}

impl ScriptCapabilities for EngineCapabilities<'_> {
    fn get_input_state(&self) -> InputState {
        self.input
    }

    fn translate_entity(&self, entity: EntityId, offset: Vec3) -> bool {
        match self.world.get(entity) {
            Some(target) => target.translate(offset),
            None => {
                log::trace!("Script moved unknown entity {}", entity.0);
                false
            }
        }
    }

    fn find_entity(&self, name: &str) -> Option<EntityId> {
        self.world.find(name)
    }
}

/// Host that calls a closure every frame
pub struct FnScriptHost<F> {
    script: F,
}

impl<F> FnScriptHost<F>
where
    F: FnMut(&dyn ScriptCapabilities, f32) + Send,
{
    pub fn new(script: F) -> Self {
        Self { script }
    }
}

impl<F> ScriptHost for FnScriptHost<F>
where
    F: FnMut(&dyn ScriptCapabilities, f32) + Send,
{
    fn run(&mut self, caps: &dyn ScriptCapabilities, delta_time: f32) {
        (self.script)(caps, delta_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Buttons, SphereLight, SphereLightEntity};

    #[test]
    fn translate_moves_positioned_entities_only() {
        let mut world = World::new();
        let lamp = world.spawn(SphereLightEntity::new("lamp", SphereLight::default()));
        let caps = EngineCapabilities::new(&world, InputState::default());

        assert!(caps.translate_entity(lamp, Vec3::X));
        assert_eq!(world.get(lamp).and_then(|e| e.position()), Some(Vec3::X));
        assert!(!caps.translate_entity(EntityId(999), Vec3::X));
        assert_eq!(caps.find_entity("lamp"), Some(lamp));
    }

    #[test]
    fn host_reads_input_through_capabilities() {
        let mut world = World::new();
        let lamp = world.spawn(SphereLightEntity::new("lamp", SphereLight::default()));
        let input = InputState {
            buttons: Buttons::FORWARD,
            ..Default::default()
        };
        let caps = EngineCapabilities::new(&world, input);

        let mut host = FnScriptHost::new(|caps: &dyn ScriptCapabilities, dt: f32| {
            if caps.get_input_state().is_down(Buttons::FORWARD) {
                if let Some(id) = caps.find_entity("lamp") {
                    caps.translate_entity(id, Vec3::new(0.0, 0.0, -dt));
                }
            }
        });
        host.run(&caps, 0.5);
        assert_eq!(world.get(lamp).and_then(|e| e.position()), Some(Vec3::new(0.0, 0.0, -0.5)));
    }
}
