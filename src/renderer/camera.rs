use std::f32::consts::FRAC_PI_4;
use glam::{Mat4, Vec3};

/// Left-handed perspective camera: +X right, +Y up, +Z into the screen.
pub struct Camera {
    position: Vec3,
    forward: Vec3,
    up: Vec3,
    fov_y: f32,
    near: f32,
    far: f32,
    aspect_ratio: f32,
}

impl Camera {
    const DEFAULT_FOV_Y: f32 = FRAC_PI_4;

    pub fn new(width: u32, height: u32) -> Self {
        let mut camera = Self {
            position: Vec3::new(0.0, 0.0, -1.0),
            forward: Vec3::Z,
            up: Vec3::Y,
            fov_y: Self::DEFAULT_FOV_Y,
            near: 0.1,
            far: 1000.0,
            aspect_ratio: 1.0,
        };
        camera.set_viewport_size(width, height);
        camera
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn translate(&mut self, offset: Vec3) {
        self.position += offset;
    }

    pub fn set_viewport_size(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect_ratio = width as f32 / height as f32;
        }
    }

    pub fn get_view_mat(&self) -> Mat4 {
        Mat4::look_to_lh(self.position, self.forward, self.up)
    }

    pub fn get_proj_mat(&self) -> Mat4 {
        Mat4::perspective_lh(self.fov_y, self.aspect_ratio, self.near, self.far)
    }

    pub fn get_position(&self) -> Vec3 {
        self.position
    }

    pub fn get_forward(&self) -> Vec3 {
        self.forward
    }

    pub fn get_aspect_ratio(&self) -> f32 {
        self.aspect_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn points_in_front_land_inside_the_depth_range() {
        let camera = Camera::new(800, 600);
        let view_proj = camera.get_proj_mat() * camera.get_view_mat();
        let clip = view_proj * Vec4::new(0.0, 0.0, 10.0, 1.0);
        let depth = clip.z / clip.w;
        assert!(depth > 0.0 && depth < 1.0);
        assert!((clip.x / clip.w).abs() < 1e-5);
    }

    #[test]
    fn translate_moves_the_eye() {
        let mut camera = Camera::new(800, 600);
        camera.set_position(Vec3::new(0.0, 0.0, -10.0));
        camera.translate(Vec3::new(0.05, 0.0, 0.0));
        assert_eq!(camera.get_position(), Vec3::new(0.05, 0.0, -10.0));
        assert!((camera.get_aspect_ratio() - 800.0 / 600.0).abs() < 1e-6);
    }
}
