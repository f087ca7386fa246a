mod common;

use vesta::renderer::config::RenderConfig;
use vesta::renderer::contexts::resource_ctx::texture_manager::UploadState;
use vesta::renderer::core::{Format, RenderDevice};
use vesta::renderer::error::{PoolExhausted, RenderError};
use vesta::renderer::resources::mesh::MeshDesc;
use vesta::renderer::resources::TextureSource;
use vesta::renderer::DrawStatus;
use common::{frame, renderer, renderer_with, small_config};

const RED: [u8; 4] = [255, 0, 0, 255];

fn red_tile(size: u32) -> Vec<u8> {
    RED.repeat((size * size) as usize)
}

#[test]
fn dynamic_texture_update_reaches_the_gpu_on_draw() {
    let (device, mut renderer) = renderer();
    let texture = renderer.create_dynamic_texture(512, 256).unwrap();
    let sprite = renderer.create_sprite_object().unwrap();

    renderer.update_texture_with_image(texture, &red_tile(16), 16, 16).unwrap();
    assert_eq!(renderer.textures().upload_state(texture), Some(UploadState::Dirty));

    frame(&mut renderer, |r| {
        r.render_sprite_with_texture(sprite, 0, 0, 100, 100, None, 0.0, texture)?;
        Ok(())
    });
    assert_eq!(renderer.textures().upload_state(texture), Some(UploadState::Clean));

    device.flush().unwrap();
    let texels = device.read_texture(renderer.textures().texture(texture).unwrap()).unwrap();
    assert_eq!(texels.len(), 512 * 256 * 4);
    for y in 0..16 {
        for x in 0..16 {
            let offset = (y * 512 + x) * 4;
            assert_eq!(texels[offset..offset + 4], RED, "texel ({}, {})", x, y);
        }
    }

    renderer.delete_sprite_object(sprite).unwrap();
    renderer.delete_texture(texture).unwrap();
    renderer.shutdown().unwrap();
}

#[test]
fn repeated_updates_before_a_draw_copy_once() {
    let (device, mut renderer) = renderer();
    let texture = renderer.create_dynamic_texture(64, 64).unwrap();
    let sprite = renderer.create_sprite_object().unwrap();
    let id = renderer.textures().texture(texture).unwrap();

    for _ in 0..100 {
        renderer.update_texture_with_image(texture, &red_tile(16), 16, 16).unwrap();
    }
    frame(&mut renderer, |r| {
        r.render_sprite_with_texture(sprite, 0, 0, 64, 64, None, 0.0, texture)?;
        r.render_sprite_with_texture(sprite, 64, 0, 64, 64, None, 0.0, texture)?;
        Ok(())
    });
    assert_eq!(device.texture_copy_count(id).unwrap(), 1);

    // A clean texture is drawn without another copy.
    frame(&mut renderer, |r| {
        r.render_sprite_with_texture(sprite, 0, 0, 64, 64, None, 0.0, texture)?;
        Ok(())
    });
    assert_eq!(device.texture_copy_count(id).unwrap(), 1);

    renderer.delete_sprite_object(sprite).unwrap();
    renderer.delete_texture(texture).unwrap();
    renderer.shutdown().unwrap();
}

#[test]
fn only_dynamic_textures_accept_image_updates() {
    let (_device, mut renderer) = renderer();
    let texture = renderer.create_tiled_texture(16, 16, 255, 0, 0).unwrap();

    let err = renderer.update_texture_with_image(texture, &red_tile(16), 16, 16).unwrap_err();
    assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::NotDynamic)));

    let dynamic = renderer.create_dynamic_texture(8, 8).unwrap();
    let err = renderer.update_texture_with_image(dynamic, &red_tile(16), 16, 16).unwrap_err();
    assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::ImageTooLarge { .. })));

    renderer.delete_texture(texture).unwrap();
    renderer.delete_texture(dynamic).unwrap();
    renderer.shutdown().unwrap();
}

#[test]
fn file_textures_are_shared_by_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checker.png");
    image::RgbaImage::from_pixel(4, 4, image::Rgba(RED)).save(&path).unwrap();

    let (device, mut renderer) = renderer();
    let first = renderer.create_texture_from_file(&path).unwrap();
    let second = renderer.create_texture_from_file(&path).unwrap();
    assert_eq!(first, second);
    assert_eq!(renderer.textures().ref_count(first), Some(2));
    assert_eq!(renderer.textures().live_count(), 2); // plus the fallback texture

    renderer.delete_texture(first).unwrap();
    assert_eq!(renderer.textures().ref_count(first), Some(1));
    assert!(renderer.textures().is_file_cached(&path));

    let id = renderer.textures().texture(first).unwrap();
    device.flush().unwrap();
    assert_eq!(device.read_texture(id).unwrap()[..4], RED);

    renderer.delete_texture(second).unwrap();
    assert_eq!(renderer.textures().ref_count(first), None);
    assert!(!renderer.textures().is_file_cached(&path));

    let err = renderer.delete_texture(first).unwrap_err();
    assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::DoubleFree(_))));

    // Loading again after the last release reads the file anew.
    let reloaded = renderer.create_texture_from_file(&path).unwrap();
    assert_eq!(renderer.textures().ref_count(reloaded), Some(1));
    renderer.delete_texture(reloaded).unwrap();
    renderer.shutdown().unwrap();
}

#[test]
fn meshes_hold_a_reference_to_shared_textures() {
    let (device, mut renderer) = renderer();
    let texture = renderer.create_tiled_texture(16, 16, 0, 0, 255).unwrap();
    let desc = MeshDesc::new_box(std::array::from_fn(|_| TextureSource::Shared(texture)));
    let boxes = (0..3)
        .map(|_| renderer.create_mesh_object(&desc).unwrap())
        .collect::<Vec<_>>();
    // One reference per tri-group of every box, plus the creator's.
    assert_eq!(renderer.textures().ref_count(texture), Some(1 + 3 * 6));

    renderer.delete_texture(texture).unwrap();
    frame(&mut renderer, |r| {
        for &mesh in &boxes {
            assert_eq!(r.render_mesh_object(mesh, glam::Mat4::IDENTITY, None)?, DrawStatus::Recorded);
        }
        Ok(())
    });
    device.flush().unwrap();
    assert_eq!(device.stats().unwrap().draws, 3 * 6);

    for mesh in boxes {
        renderer.delete_mesh_object(mesh).unwrap();
    }
    assert_eq!(renderer.textures().ref_count(texture), None);
    renderer.shutdown().unwrap();
}

#[test]
fn mesh_with_a_missing_face_texture_releases_everything_it_took() {
    let (device, mut renderer) = renderer();
    let texture = renderer.create_tiled_texture(16, 16, 0, 255, 0).unwrap();
    let live = device.live_object_count();

    let mut faces: [TextureSource; 6] = std::array::from_fn(|_| TextureSource::Shared(texture));
    faces[5] = TextureSource::File("/nonexistent/missing.png".into());
    assert!(renderer.create_mesh_object(&MeshDesc::new_box(faces)).is_err());

    assert_eq!(renderer.mesh_count(), 0);
    assert_eq!(renderer.textures().ref_count(texture), Some(1));
    assert_eq!(device.live_object_count(), live);

    renderer.delete_texture(texture).unwrap();
    renderer.shutdown().unwrap();
}

#[test]
fn texels_of_the_wrong_size_leave_nothing_behind() {
    let (device, mut renderer) = renderer();
    let live = device.live_object_count();

    let err = renderer.create_static_texture(2, 2, Format::Rgba8Unorm, &[0u8; 3]).unwrap_err();
    assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::ImageDataSize { .. })));
    assert_eq!(device.live_object_count(), live);
    assert_eq!(renderer.textures().live_count(), 1);

    renderer.shutdown().unwrap();
}

#[test]
fn full_persistent_heap_fails_texture_creation_cleanly() {
    // One slot goes to the fallback texture.
    let (device, mut renderer) = renderer_with(RenderConfig {
        max_descriptor_count: 2,
        ..small_config()
    });
    let texture = renderer.create_tiled_texture(4, 4, 255, 0, 0).unwrap();
    let live = device.live_object_count();

    let err = renderer.create_tiled_texture(4, 4, 0, 0, 255).unwrap_err();
    assert_eq!(err.downcast_ref::<PoolExhausted>().map(|e| e.pool), Some("persistent descriptor heap"));
    assert!(renderer.create_dynamic_texture(8, 8).is_err());
    assert_eq!(device.live_object_count(), live);

    renderer.delete_texture(texture).unwrap();
    renderer.shutdown().unwrap();
}
