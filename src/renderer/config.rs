use crate::renderer::error::RenderError;

/// Contains configuration options for the renderer like vsync, frame pipelining depth and pool capacities
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub vsync: bool,

    /// Number of swap-chain images. The renderer pipelines one frame fewer than this.
    pub swap_chain_frame_count: u32,
    /// Capacity of every per-frame constant-buffer pool.
    pub max_draw_count_per_frame: u32,
    /// Capacity of the persistent texture descriptor heap.
    pub max_descriptor_count: u32,

    pub clear_color: [f32; 4],
    pub enable_validation: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            vsync: false,
            swap_chain_frame_count: 3,
            max_draw_count_per_frame: 4096,
            max_descriptor_count: 4096,
            clear_color: [1.0, 0.0, 1.0, 1.0],
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl RenderConfig {
    /// Upper bound of descriptors a single draw takes from the frame's table heap:
    /// one constant buffer plus one texture per tri-group.
    pub const MAX_DESCRIPTOR_COUNT_FOR_DRAW: u32 = 1 + crate::renderer::resources::mesh::MAX_TRI_GROUP_COUNT as u32;

    pub fn pending_frame_count(&self) -> u32 {
        self.swap_chain_frame_count - 1
    }

    pub fn descriptor_count_per_frame(&self) -> u32 {
        self.max_draw_count_per_frame * Self::MAX_DESCRIPTOR_COUNT_FOR_DRAW
    }

    pub fn validate(&self) -> Result<(), RenderError> {
        if self.swap_chain_frame_count < 2 {
            return Err(RenderError::InvalidConfig("swap_chain_frame_count must be at least 2"));
        }
        if self.max_draw_count_per_frame == 0 {
            return Err(RenderError::InvalidConfig("max_draw_count_per_frame must be non-zero"));
        }
        if self.max_descriptor_count == 0 {
            return Err(RenderError::InvalidConfig("max_descriptor_count must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipelines_two_frames_behind_three_images() {
        let config = RenderConfig::default();
        assert_eq!(config.pending_frame_count(), 2);
        assert_eq!(config.descriptor_count_per_frame(), 4096 * 9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn single_buffered_swap_chain_is_rejected() {
        let config = RenderConfig { swap_chain_frame_count: 1, ..Default::default() };
        assert!(matches!(config.validate(), Err(RenderError::InvalidConfig(_))));
    }
}
