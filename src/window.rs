//! Window management using winit
//!
//! [`run`] opens a window, builds an [`EngineContext`] on it and ticks the
//! engine on every redraw, feeding it the input gathered from window events.

use std::sync::Arc;
use std::time::Instant;

use glam::Vec2;
use winit::{
    dpi::PhysicalSize,
    event::{ElementState, Event, MouseButton, MouseScrollDelta, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::{KeyCode, PhysicalKey},
    window::WindowBuilder,
};

use crate::engine::EngineContext;
use crate::error::{RenderError, RenderResult};
use crate::scene::{Buttons, InputState};
use crate::EngineConfig;

/// Button bound to a physical key, if any
pub fn button_for_key(key: KeyCode) -> Option<Buttons> {
    match key {
        KeyCode::KeyW | KeyCode::ArrowUp => Some(Buttons::FORWARD),
        KeyCode::KeyS | KeyCode::ArrowDown => Some(Buttons::BACKWARD),
        KeyCode::KeyA | KeyCode::ArrowLeft => Some(Buttons::LEFT),
        KeyCode::KeyD | KeyCode::ArrowRight => Some(Buttons::RIGHT),
        KeyCode::KeyE | KeyCode::Space => Some(Buttons::UP),
        KeyCode::KeyQ | KeyCode::ControlLeft => Some(Buttons::DOWN),
        KeyCode::ShiftLeft | KeyCode::ShiftRight => Some(Buttons::SPRINT),
        KeyCode::KeyF | KeyCode::Enter => Some(Buttons::ACTION),
        _ => None,
    }
}

/// Accumulates window events into the engine's per-frame input
#[derive(Debug, Default)]
pub struct InputTracker {
    state: InputState,
    last_cursor: Option<Vec2>,
}

impl InputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(code) = event.physical_key {
                    if let Some(button) = button_for_key(code) {
                        self.set(button, event.state == ElementState::Pressed);
                    }
                }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                let pressed = *state == ElementState::Pressed;
                match button {
                    MouseButton::Right => self.set(Buttons::MOUSE_LOOK, pressed),
                    MouseButton::Left => self.set(Buttons::ACTION, pressed),
                    _ => {}
                }
            }
            WindowEvent::CursorMoved { position, .. } => {
                let position = Vec2::new(position.x as f32, position.y as f32);
                if let Some(last) = self.last_cursor {
                    self.state.mouse_delta += position - last;
                }
                self.last_cursor = Some(position);
                self.state.mouse_position = position;
            }
            WindowEvent::CursorLeft { .. } => {
                self.last_cursor = None;
            }
            WindowEvent::MouseWheel { delta, .. } => {
                self.state.scroll_delta += match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y,
                    MouseScrollDelta::PixelDelta(pos) => pos.y as f32 / 120.0,
                };
            }
            WindowEvent::Focused(false) => {
                self.state.buttons = Buttons::empty();
            }
            _ => {}
        }
    }

    fn set(&mut self, button: Buttons, pressed: bool) {
        self.state.buttons.set(button, pressed);
    }

    /// Input for this frame; deltas start over afterwards
    pub fn take(&mut self) -> InputState {
        let state = self.state;
        self.state.reset_deltas();
        state
    }
}

/// Open a window and run the engine until it is closed
///
/// `setup` runs once after the engine is created, to populate the scene.
pub fn run<F>(config: EngineConfig, setup: F) -> RenderResult<()>
where
    F: FnOnce(&mut EngineContext) -> RenderResult<()>,
{
    let event_loop =
        EventLoop::new().map_err(|e| RenderError::Initialization(format!("event loop: {e}")))?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title(config.title.clone())
            .with_inner_size(PhysicalSize::new(config.width, config.height))
            .build(&event_loop)
            .map_err(|e| RenderError::Initialization(format!("window: {e}")))?,
    );

    let mut engine = EngineContext::new(config, Some(window.clone()))?;
    setup(&mut engine)?;

    let mut input = InputTracker::new();
    let mut last_frame = Instant::now();
    let mut failure: Option<RenderError> = None;

    event_loop
        .run(|event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);
            match event {
                Event::WindowEvent { event, .. } => {
                    input.handle_event(&event);
                    match event {
                        WindowEvent::CloseRequested => elwt.exit(),
                        WindowEvent::Resized(size) => {
                            if let Err(e) = engine.resize(size.width, size.height) {
                                log::error!("Resize failed: {e}");
                                failure = Some(e);
                                elwt.exit();
                            }
                        }
                        WindowEvent::RedrawRequested => {
                            let now = Instant::now();
                            let delta_time = (now - last_frame).as_secs_f32();
                            last_frame = now;
                            engine.set_input(input.take());
                            match engine.tick(delta_time) {
                                Ok(()) => {}
                                Err(RenderError::SurfaceLost) => {
                                    log::warn!("Surface lost, reconfiguring");
                                    let size = window.inner_size();
                                    if let Err(e) = engine.resize(size.width, size.height) {
                                        failure = Some(e);
                                        elwt.exit();
                                    }
                                }
                                Err(e) => {
                                    log::error!("Frame failed: {e}");
                                    failure = Some(e);
                                    elwt.exit();
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Event::AboutToWait => window.request_redraw(),
                _ => {}
            }
        })
        .map_err(|e| RenderError::Initialization(format!("event loop: {e}")))?;

    engine.shutdown();
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_keys_map_to_buttons() {
        assert_eq!(button_for_key(KeyCode::KeyW), Some(Buttons::FORWARD));
        assert_eq!(button_for_key(KeyCode::ShiftLeft), Some(Buttons::SPRINT));
        assert_eq!(button_for_key(KeyCode::F12), None);
    }

    #[test]
    fn take_keeps_buttons_and_clears_deltas() {
        let mut tracker = InputTracker::new();
        tracker.set(Buttons::FORWARD, true);
        tracker.state.mouse_delta = Vec2::new(3.0, 4.0);
        tracker.state.scroll_delta = 1.0;

        let first = tracker.take();
        assert_eq!(first.mouse_delta, Vec2::new(3.0, 4.0));
        let second = tracker.take();
        assert!(second.is_down(Buttons::FORWARD));
        assert_eq!(second.mouse_delta, Vec2::ZERO);
        assert_eq!(second.scroll_delta, 0.0);
    }
}
