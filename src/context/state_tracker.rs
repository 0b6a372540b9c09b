//! Texture state tracking
//!
//! The context is the single source of truth for each texture's state.
//! Transitions are gathered into a batch that drops no-op transitions and
//! collapses repeated requests for the same texture, then flushed to the
//! backend in one go.

use std::collections::HashMap;

use crate::backend::{GraphicsBackend, TextureHandle, TextureState};

#[derive(Debug, Default)]
pub struct TextureStateTracker {
    states: HashMap<TextureHandle, TextureState>,
}

impl TextureStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, texture: TextureHandle, state: TextureState) {
        self.states.insert(texture, state);
    }

    pub fn forget(&mut self, texture: TextureHandle) {
        self.states.remove(&texture);
    }

    pub fn state(&self, texture: TextureHandle) -> Option<TextureState> {
        self.states.get(&texture).copied()
    }

    /// Overwrite the tracked state without emitting a transition
    pub fn reset(&mut self, texture: TextureHandle, state: TextureState) {
        if let Some(current) = self.states.get_mut(&texture) {
            *current = state;
        }
    }

    /// Transition one texture immediately; returns whether anything was emitted
    pub fn transition(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        texture: TextureHandle,
        after: TextureState,
    ) -> bool {
        let mut batch = TransitionBatch::new();
        batch.add(texture, after);
        batch.flush(self, backend) > 0
    }
}

/// Transitions collected for a single flush
#[derive(Debug, Default)]
pub struct TransitionBatch {
    requests: Vec<(TextureHandle, TextureState)>,
}

impl TransitionBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `texture` to end up in `after`; a later request for the same
    /// texture replaces an earlier one
    pub fn add(&mut self, texture: TextureHandle, after: TextureState) {
        if let Some(existing) = self.requests.iter_mut().find(|(t, _)| *t == texture) {
            existing.1 = after;
        } else {
            self.requests.push((texture, after));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Emit the transitions that change state; returns how many were emitted
    pub fn flush(
        self,
        tracker: &mut TextureStateTracker,
        backend: &mut dyn GraphicsBackend,
    ) -> usize {
        let mut emitted = 0;
        for (texture, after) in self.requests {
            let Some(before) = tracker.state(texture) else {
                log::warn!("Transition requested for untracked texture {}", texture.id());
                continue;
            };
            if before == after {
                continue;
            }
            log::trace!("Texture {}: {:?} -> {:?}", texture.id(), before, after);
            backend.transition_texture(texture, before, after);
            tracker.reset(texture, after);
            emitted += 1;
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessBackend, RecordedCommand};
    use crate::backend::{TextureApi, TextureDesc, TextureFormat};

    fn setup() -> (HeadlessBackend, TextureStateTracker, TextureHandle) {
        let mut backend = HeadlessBackend::new(4, 4);
        let texture = backend
            .create_texture(
                &TextureDesc::render_target("t", 4, 4, TextureFormat::Rgba8Unorm),
                None,
            )
            .unwrap();
        let mut tracker = TextureStateTracker::new();
        tracker.register(texture, TextureState::ShaderRead);
        (backend, tracker, texture)
    }

    #[test]
    fn same_state_is_skipped() {
        let (mut backend, mut tracker, texture) = setup();
        assert!(!tracker.transition(&mut backend, texture, TextureState::ShaderRead));
        assert!(backend.commands().is_empty());
    }

    #[test]
    fn batch_collapses_duplicates() {
        let (mut backend, mut tracker, texture) = setup();
        let mut batch = TransitionBatch::new();
        batch.add(texture, TextureState::CopyDst);
        batch.add(texture, TextureState::RenderTarget);
        assert_eq!(batch.flush(&mut tracker, &mut backend), 1);
        assert_eq!(
            backend.commands(),
            &[RecordedCommand::Transition {
                texture,
                before: TextureState::ShaderRead,
                after: TextureState::RenderTarget
            }]
        );
        assert_eq!(tracker.state(texture), Some(TextureState::RenderTarget));
    }
}
