use glam::Vec3;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};
use crate::app::game::CAMERA_STEP;

/// Keyboard state driving the camera. Keys are matched by physical position, so Shift does not
/// change which key W is.
#[derive(Default)]
pub struct InputState {
    shift_down: bool,
    camera_offset: Vec3,
}

impl InputState {
    pub fn process_window_events(&mut self, event: &WindowEvent) {
        if let WindowEvent::KeyboardInput {
            event: KeyEvent {
                physical_key: PhysicalKey::Code(code),
                state,
                ..
            },
            ..
        } = event
        {
            self.process_key(*code, *state);
        }
    }

    pub fn process_key(&mut self, code: KeyCode, state: ElementState) {
        let pressed = state == ElementState::Pressed;
        match (code, pressed) {
            (KeyCode::ShiftLeft | KeyCode::ShiftRight, _) => self.shift_down = pressed,
            (KeyCode::KeyW | KeyCode::KeyS, true) => {
                let step = if code == KeyCode::KeyW { CAMERA_STEP } else { -CAMERA_STEP };
                if self.shift_down {
                    self.camera_offset.y = step;
                } else {
                    self.camera_offset.z = step;
                }
            }
            (KeyCode::KeyW | KeyCode::KeyS, false) => {
                self.camera_offset.y = 0.0;
                self.camera_offset.z = 0.0;
            }
            (KeyCode::KeyA, true) => self.camera_offset.x = -CAMERA_STEP,
            (KeyCode::KeyD, true) => self.camera_offset.x = CAMERA_STEP,
            (KeyCode::KeyA | KeyCode::KeyD, false) => self.camera_offset.x = 0.0,
            _ => {}
        }
    }

    /// Offset to move the camera by on every game update.
    pub fn camera_offset(&self) -> Vec3 {
        self.camera_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_turns_forward_into_up() {
        let mut input = InputState::default();
        input.process_key(KeyCode::KeyW, ElementState::Pressed);
        assert_eq!(input.camera_offset(), Vec3::new(0.0, 0.0, CAMERA_STEP));

        input.process_key(KeyCode::ShiftLeft, ElementState::Pressed);
        input.process_key(KeyCode::KeyS, ElementState::Pressed);
        assert_eq!(input.camera_offset().y, -CAMERA_STEP);
    }

    #[test]
    fn releasing_stops_motion() {
        let mut input = InputState::default();
        input.process_key(KeyCode::KeyA, ElementState::Pressed);
        input.process_key(KeyCode::KeyW, ElementState::Pressed);
        input.process_key(KeyCode::KeyA, ElementState::Released);
        input.process_key(KeyCode::KeyW, ElementState::Released);
        assert_eq!(input.camera_offset(), Vec3::ZERO);
    }
}
