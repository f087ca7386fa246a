mod common;

use vesta::renderer::config::RenderConfig;
use vesta::renderer::core::RenderDevice;
use vesta::renderer::contexts::resource_ctx::texture_manager::TextureHandle;
use vesta::renderer::error::RenderError;
use vesta::renderer::resources::mesh::{MeshDesc, TriGroupDesc};
use vesta::renderer::resources::TextureSource;
use vesta::renderer::{DrawStatus, FramePhase};
use common::{frame, renderer, renderer_with, small_config};

#[test]
fn ten_empty_frames_cycle_two_contexts() {
    let (device, mut renderer) = renderer_with(RenderConfig {
        enable_validation: false,
        ..Default::default()
    });
    assert_eq!(renderer.frames().frame_count(), 2);
    // Setup uploads wait on their own fence.
    let setup_waits = device.fence_waits().unwrap().len();

    for n in 1..=10u64 {
        frame(&mut renderer, |_| Ok(()));
        if n >= 2 {
            let mut values = renderer.frames().last_fence_values();
            values.sort();
            assert_eq!(values, vec![n - 1, n]);
        }
    }

    // The first advance reuses a context that never ran; every later one waits on the frame
    // before the one just presented.
    let waited = device.fence_waits().unwrap()[setup_waits..]
        .iter()
        .map(|wait| wait.value)
        .collect::<Vec<_>>();
    assert_eq!(waited, (1..=9).collect::<Vec<_>>());

    renderer.shutdown().unwrap();
    assert_eq!(device.live_object_count(), 0);
}

#[test]
fn contexts_are_reused_only_after_their_fence_completed() {
    let (device, mut renderer) = renderer();
    let sprite = renderer.create_sprite_object().unwrap();
    let texture = renderer.create_tiled_texture(8, 8, 0, 255, 0).unwrap();
    let mut signaled = vec![0u64; renderer.frames().frame_count()];

    for n in 1..=6u64 {
        let slot = renderer.frames().current_index();
        let before = device.fence_waits().unwrap().len();
        frame(&mut renderer, |r| {
            let status = r.render_sprite_with_texture(sprite, 0, 0, 8, 8, None, 0.0, texture)?;
            assert_eq!(status, DrawStatus::Recorded);
            Ok(())
        });
        signaled[slot] = n;

        let reused = renderer.frames().current_index();
        let waits = device.fence_waits().unwrap()[before..].to_vec();
        if signaled[reused] == 0 {
            assert!(waits.is_empty());
        } else {
            // Nothing flushes the queue between frames, so every reuse has to block.
            assert_eq!(waits.len(), 1);
            let wait = waits[0];
            assert_eq!(wait.value, signaled[reused]);
            assert!(device.fence_completed_value(wait.fence).unwrap() >= signaled[reused]);
        }
    }

    renderer.delete_sprite_object(sprite).unwrap();
    renderer.delete_texture(texture).unwrap();
    renderer.shutdown().unwrap();
}

#[test]
fn calls_out_of_order_are_rejected() {
    let (_device, mut renderer) = renderer();
    let texture = renderer.create_tiled_texture(4, 4, 255, 255, 255).unwrap();

    let err = renderer.end_render().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RenderError>(),
        Some(RenderError::OutOfOrder { operation: "end_render", actual: FramePhase::Idle })
    ));

    renderer.begin_render().unwrap();
    assert!(renderer.begin_render().is_err());
    assert!(renderer.present().is_err());
    let err = renderer.delete_texture(texture).unwrap_err();
    assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::OutOfOrder { .. })));
    assert!(renderer.update_window_size(640, 480).is_err());

    renderer.end_render().unwrap();
    assert_eq!(renderer.phase(), FramePhase::Submitted);
    renderer.present().unwrap();
    assert_eq!(renderer.phase(), FramePhase::Idle);

    renderer.delete_texture(texture).unwrap();
    renderer.shutdown().unwrap();
}

#[test]
fn resize_rebuilds_the_target_only_when_the_size_changes() {
    let (device, mut renderer) = renderer();
    frame(&mut renderer, |_| Ok(()));

    assert!(renderer.update_window_size(640, 480).unwrap());
    assert_eq!(renderer.window_size(), (640, 480));
    assert!(!renderer.update_window_size(640, 480).unwrap());

    let err = renderer.update_window_size(0, 480).unwrap_err();
    assert!(matches!(err.downcast_ref::<RenderError>(), Some(RenderError::InvalidWindowSize { .. })));

    // Resizing drained the queue.
    assert_eq!(device.pending_op_count().unwrap(), 0);
    frame(&mut renderer, |_| Ok(()));
    renderer.shutdown().unwrap();
}

#[test]
fn exhausted_constant_buffer_pool_drops_draws_for_one_frame() {
    let (_device, mut renderer) = renderer_with(RenderConfig {
        max_draw_count_per_frame: 2,
        ..small_config()
    });
    let sprite = renderer.create_sprite_object().unwrap();
    let texture = renderer.create_tiled_texture(4, 4, 0, 0, 255).unwrap();

    frame(&mut renderer, |r| {
        for _ in 0..2 {
            assert_eq!(r.render_sprite_with_texture(sprite, 0, 0, 4, 4, None, 0.0, texture)?, DrawStatus::Recorded);
        }
        let status = r.render_sprite_with_texture(sprite, 0, 0, 4, 4, None, 0.0, texture)?;
        match status {
            DrawStatus::Dropped(exhausted) => assert_eq!(exhausted.capacity, 2),
            other => panic!("expected a dropped draw, got {:?}", other),
        }
        Ok(())
    });

    // Pools come back after the context is reused.
    for _ in 0..2 {
        frame(&mut renderer, |r| {
            assert_eq!(r.render_sprite_with_texture(sprite, 0, 0, 4, 4, None, 0.0, texture)?, DrawStatus::Recorded);
            Ok(())
        });
    }

    renderer.delete_sprite_object(sprite).unwrap();
    renderer.delete_texture(texture).unwrap();
    renderer.shutdown().unwrap();
}

fn textured_box(texture: TextureHandle) -> MeshDesc {
    MeshDesc::new_box(std::array::from_fn(|_| TextureSource::Shared(texture)))
}

/// The box's vertices split into `count` textured tri-groups, reusing face indices.
fn mesh_with_groups(texture: TextureHandle, count: usize) -> MeshDesc {
    let mut desc = textured_box(texture);
    let groups = (0..count)
        .map(|i| TriGroupDesc {
            indices: desc.tri_groups[i % 6].indices.clone(),
            texture: Some(TextureSource::Shared(texture)),
        })
        .collect();
    desc.tri_groups = groups;
    desc
}

fn expect_dropped(status: DrawStatus, pool: &str) {
    match status {
        DrawStatus::Dropped(exhausted) => assert_eq!(exhausted.pool, pool),
        other => panic!("expected a draw dropped by {}, got {:?}", pool, other),
    }
}

#[test]
fn dropped_mesh_draw_leaves_room_for_sprites() {
    let (device, mut renderer) = renderer_with(RenderConfig {
        max_draw_count_per_frame: 4,
        ..small_config()
    });
    let texture = renderer.create_tiled_texture(4, 4, 255, 0, 0).unwrap();
    let mesh = renderer.create_mesh_object(&textured_box(texture)).unwrap();
    let sprite = renderer.create_sprite_object().unwrap();

    frame(&mut renderer, |r| {
        for _ in 0..4 {
            assert_eq!(r.render_mesh_object(mesh, glam::Mat4::IDENTITY, None)?, DrawStatus::Recorded);
        }
        let descriptors = r.frames().current().descriptor_pool.allocated_count();
        expect_dropped(r.render_mesh_object(mesh, glam::Mat4::IDENTITY, None)?, "Mesh");
        assert_eq!(r.frames().current().descriptor_pool.allocated_count(), descriptors);

        assert_eq!(r.render_sprite_with_texture(sprite, 0, 0, 4, 4, None, 0.0, texture)?, DrawStatus::Recorded);
        Ok(())
    });
    device.flush().unwrap();
    assert_eq!(device.stats().unwrap().draws, 4 * 6 + 1);

    renderer.delete_sprite_object(sprite).unwrap();
    renderer.delete_mesh_object(mesh).unwrap();
    renderer.delete_texture(texture).unwrap();
    renderer.shutdown().unwrap();
}

#[test]
fn full_table_heap_drops_the_draw_without_taking_its_constant_buffer() {
    let (_device, mut renderer) = renderer_with(RenderConfig {
        max_draw_count_per_frame: 4,
        ..small_config()
    });
    // 4 draws of at most MAX_DESCRIPTOR_COUNT_FOR_DRAW tables each.
    assert_eq!(renderer.frames().current().descriptor_pool.capacity(), 4 * 9);
    let texture = renderer.create_tiled_texture(4, 4, 0, 255, 0).unwrap();
    let wide = renderer.create_mesh_object(&mesh_with_groups(texture, 8)).unwrap();
    let narrow = renderer.create_mesh_object(&mesh_with_groups(texture, 1)).unwrap();
    let sprite = renderer.create_sprite_object().unwrap();

    frame(&mut renderer, |r| {
        for _ in 0..3 {
            assert_eq!(r.render_sprite_with_texture(sprite, 0, 0, 4, 4, None, 0.0, texture)?, DrawStatus::Recorded);
        }
        for _ in 0..3 {
            assert_eq!(r.render_mesh_object(wide, glam::Mat4::IDENTITY, None)?, DrawStatus::Recorded);
        }
        // 3 * 2 + 3 * 9 descriptors in use, 3 left.
        expect_dropped(r.render_mesh_object(wide, glam::Mat4::IDENTITY, None)?, "descriptor table heap");

        // The fourth mesh constant buffer is still free.
        assert_eq!(r.render_mesh_object(narrow, glam::Mat4::IDENTITY, None)?, DrawStatus::Recorded);
        expect_dropped(r.render_mesh_object(narrow, glam::Mat4::IDENTITY, None)?, "Mesh");
        Ok(())
    });

    renderer.delete_sprite_object(sprite).unwrap();
    renderer.delete_mesh_object(wide).unwrap();
    renderer.delete_mesh_object(narrow).unwrap();
    renderer.delete_texture(texture).unwrap();
    renderer.shutdown().unwrap();
}

#[test]
fn sprite_without_texture_is_skipped() {
    let (_device, mut renderer) = renderer();
    let sprite = renderer.create_sprite_object().unwrap();
    frame(&mut renderer, |r| {
        assert_eq!(r.render_sprite(sprite, 0, 0, 10, 10, 0.0)?, DrawStatus::Skipped);
        Ok(())
    });
    renderer.delete_sprite_object(sprite).unwrap();
    renderer.shutdown().unwrap();
}

#[test]
fn undeleted_objects_are_released_and_reported() {
    let (device, mut renderer) = renderer();
    renderer.create_sprite_object().unwrap();
    frame(&mut renderer, |_| Ok(()));

    let err = renderer.shutdown().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RenderError>(),
        Some(RenderError::ResourceLeak { what: "sprite objects", count: 1 })
    ));
    assert_eq!(device.live_object_count(), 0);
}
