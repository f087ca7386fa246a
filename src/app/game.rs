use std::time::{Duration, Instant};
use color_eyre::Result;
use glam::{Mat4, Vec3};
use rand::Rng;
use crate::renderer::contexts::resource_ctx::texture_manager::TextureHandle;
use crate::renderer::resources::mesh::MeshDesc;
use crate::renderer::resources::{MeshHandle, SpriteHandle, TextureSource};
use crate::renderer::Renderer;

const BOX_COUNT: usize = 100;
const UPDATE_INTERVAL: Duration = Duration::from_millis(16);
pub const CAMERA_STEP: f32 = 0.05;

const DYNAMIC_IMAGE_WIDTH: u32 = 512;
const DYNAMIC_IMAGE_HEIGHT: u32 = 256;
const TILE_SIZE: u32 = 16;

const FACE_COLORS: [[u8; 3]; 6] = [
    [255, 64, 64],
    [64, 255, 64],
    [64, 64, 255],
    [255, 255, 64],
    [64, 255, 255],
    [255, 64, 255],
];

/// A box placed in the world. The world matrix is only rebuilt when the transform changed.
struct GameObject {
    mesh: MeshHandle,
    position: Vec3,
    rotation_y: f32,
    scale: Vec3,
    world: Mat4,
    dirty: bool,
}

impl GameObject {
    fn new(mesh: MeshHandle, position: Vec3, rotation_y: f32) -> Self {
        Self {
            mesh,
            position,
            rotation_y,
            scale: Vec3::ONE,
            world: Mat4::IDENTITY,
            dirty: true,
        }
    }

    fn update_transform(&mut self) {
        if !self.dirty {
            return;
        }
        // Scale first, then rotate, then translate.
        self.world = Mat4::from_translation(self.position)
            * Mat4::from_rotation_y(self.rotation_y)
            * Mat4::from_scale(self.scale);
        self.dirty = false;
    }
}

/// CPU copy of the animated dynamic texture: starts opaque red, then one 16x16 tile per update
/// is painted in a slowly shifting colour.
pub struct TileAnimation {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    tile_index: u32,
    color: [u32; 3],
}

impl TileAnimation {
    pub fn new(width: u32, height: u32) -> Self {
        let pixels = [255, 0, 0, 255].repeat((width * height) as usize);
        Self {
            pixels,
            width,
            height,
            tile_index: 0,
            color: [0, 0, 0],
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn paint_next_tile(&mut self) {
        let tiles_x = self.width / TILE_SIZE;
        let tiles_y = self.height / TILE_SIZE;
        if self.tile_index >= tiles_x * tiles_y {
            self.tile_index = 0;
        }

        let start_x = (self.tile_index % tiles_x) * TILE_SIZE;
        let start_y = (self.tile_index / tiles_x) * TILE_SIZE;
        let [r, g, b] = self.color.map(|c| c as u8);
        for y in start_y..start_y + TILE_SIZE {
            let row = ((y * self.width + start_x) * 4) as usize;
            for pixel in self.pixels[row..row + (TILE_SIZE * 4) as usize].chunks_exact_mut(4) {
                pixel.copy_from_slice(&[r, g, b, 255]);
            }
        }

        self.tile_index += 1;
        self.color[0] += 8;
        if self.color[0] > 255 {
            self.color[0] = 0;
            self.color[1] += 8;
        }
        if self.color[1] > 255 {
            self.color[1] = 0;
            self.color[2] += 8;
        }
        if self.color[2] > 255 {
            self.color[2] = 0;
        }
    }
}

/// Demo scene: a field of textured boxes, a sprite showing a tiled texture and a sprite showing
/// the animated dynamic texture.
pub struct Game {
    objects: Vec<GameObject>,
    face_textures: Vec<TextureHandle>,

    dynamic_texture: TextureHandle,
    tiles: TileAnimation,
    sprite_textured: SpriteHandle,
    sprite_texture: TextureHandle,
    sprite_common: SpriteHandle,

    camera_offset: Vec3,
    last_update: Option<Instant>,
}

impl Game {
    pub fn new(renderer: &mut Renderer) -> Result<Self> {
        let face_textures = FACE_COLORS
            .iter()
            .map(|&[r, g, b]| renderer.create_tiled_texture(64, 64, r, g, b))
            .collect::<Result<Vec<_>>>()?;

        let mut rng = rand::rng();
        let mut objects = Vec::with_capacity(BOX_COUNT);
        for _ in 0..BOX_COUNT {
            let faces: [TextureSource; 6] = std::array::from_fn(|face| TextureSource::Shared(face_textures[face]));
            let mesh = renderer.create_mesh_object(&MeshDesc::new_box(faces))?;
            let position = Vec3::new(rng.random_range(-10..=10) as f32, 0.0, rng.random_range(-10..=10) as f32);
            let rotation_y = (rng.random_range(0..=180) as f32).to_radians();
            objects.push(GameObject::new(mesh, position, rotation_y));
        }

        renderer.set_camera_pos(0.0, 0.0, -10.0);

        let tiles = TileAnimation::new(DYNAMIC_IMAGE_WIDTH, DYNAMIC_IMAGE_HEIGHT);
        let dynamic_texture = renderer.create_dynamic_texture(DYNAMIC_IMAGE_WIDTH, DYNAMIC_IMAGE_HEIGHT)?;
        renderer.update_texture_with_image(dynamic_texture, tiles.pixels(), DYNAMIC_IMAGE_WIDTH, DYNAMIC_IMAGE_HEIGHT)?;

        let sprite_texture = renderer.create_tiled_texture(1024, 1024, 200, 200, 200)?;
        let sprite_textured = renderer.create_sprite_object_with_texture(&TextureSource::Shared(sprite_texture), None)?;
        let sprite_common = renderer.create_sprite_object()?;

        log::info!("Game initialized with {} objects", objects.len());
        Ok(Self {
            objects,
            face_textures,
            dynamic_texture,
            tiles,
            sprite_textured,
            sprite_texture,
            sprite_common,
            camera_offset: Vec3::ZERO,
            last_update: None,
        })
    }

    pub fn set_camera_offset(&mut self, offset: Vec3) {
        self.camera_offset = offset;
    }

    pub fn dynamic_texture(&self) -> TextureHandle {
        self.dynamic_texture
    }

    /// Advances the scene unless the previous update was less than 16 ms ago.
    /// Returns whether an update ran.
    pub fn update(&mut self, renderer: &mut Renderer, now: Instant) -> Result<bool> {
        if self.last_update.is_some_and(|last| now.duration_since(last) < UPDATE_INTERVAL) {
            return Ok(false);
        }
        self.last_update = Some(now);

        if self.camera_offset != Vec3::ZERO {
            renderer.move_camera(self.camera_offset.x, self.camera_offset.y, self.camera_offset.z);
        }
        for object in &mut self.objects {
            object.update_transform();
        }

        self.tiles.paint_next_tile();
        let (width, height) = self.tiles.size();
        renderer.update_texture_with_image(self.dynamic_texture, self.tiles.pixels(), width, height)?;
        Ok(true)
    }

    /// Records and presents one frame.
    pub fn render(&self, renderer: &mut Renderer) -> Result<()> {
        renderer.begin_render()?;

        for object in &self.objects {
            renderer.render_mesh_object(object.mesh, object.world, None)?;
        }
        renderer.render_sprite(self.sprite_textured, 100, 80, 100, 100, 0.0)?;
        renderer.render_sprite_with_texture(self.sprite_common, 0, 0, 100, 100, None, 0.0, self.dynamic_texture)?;

        renderer.end_render()?;
        renderer.present()
    }

    /// Releases every object the game created. The renderer has to be idle.
    pub fn destroy(self, renderer: &mut Renderer) -> Result<()> {
        for object in self.objects {
            renderer.delete_mesh_object(object.mesh)?;
        }
        renderer.delete_sprite_object(self.sprite_textured)?;
        renderer.delete_sprite_object(self.sprite_common)?;
        renderer.delete_texture(self.sprite_texture)?;
        renderer.delete_texture(self.dynamic_texture)?;
        for texture in self.face_textures {
            renderer.delete_texture(texture)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(tiles: &TileAnimation, x: u32, y: u32) -> [u8; 4] {
        let offset = ((y * tiles.width + x) * 4) as usize;
        tiles.pixels[offset..offset + 4].try_into().unwrap()
    }

    #[test]
    fn image_starts_opaque_red() {
        let tiles = TileAnimation::new(32, 32);
        assert_eq!(pixel(&tiles, 31, 31), [255, 0, 0, 255]);
    }

    #[test]
    fn tiles_advance_left_to_right_with_shifting_colour() {
        let mut tiles = TileAnimation::new(64, 32);
        tiles.paint_next_tile();
        tiles.paint_next_tile();
        assert_eq!(pixel(&tiles, 0, 0), [0, 0, 0, 255]);
        assert_eq!(pixel(&tiles, 15, 15), [0, 0, 0, 255]);
        assert_eq!(pixel(&tiles, 16, 0), [8, 0, 0, 255]);
        assert_eq!(pixel(&tiles, 32, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn red_channel_carries_into_green() {
        let mut tiles = TileAnimation::new(16, 16);
        for _ in 0..33 {
            tiles.paint_next_tile();
        }
        // 32 steps of 8 overflow red once.
        assert_eq!(pixel(&tiles, 0, 0), [0, 8, 0, 255]);
    }

    #[test]
    fn tile_index_wraps_after_the_last_tile() {
        let mut tiles = TileAnimation::new(32, 16);
        for _ in 0..3 {
            tiles.paint_next_tile();
        }
        assert_eq!(pixel(&tiles, 0, 0), [16, 0, 0, 255]);
        assert_eq!(pixel(&tiles, 16, 0), [8, 0, 0, 255]);
    }

    #[test]
    fn world_matrix_translates_after_rotating() {
        let mut object = GameObject::new(MeshHandle::default(), Vec3::new(1.0, 0.0, 2.0), std::f32::consts::FRAC_PI_2);
        object.update_transform();
        let p = object.world.transform_point3(Vec3::X);
        assert!((p - Vec3::new(1.0, 0.0, 1.0)).length() < 1e-5);
        assert!(!object.dirty);
    }
}
