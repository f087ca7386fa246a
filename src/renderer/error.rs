use thiserror::Error;

/// A per-frame linear pool ran out of slots. Recoverable: the caller drops the draw and the
/// pool is reset the next time its frame context comes around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{pool} exhausted: requested {requested}, {available} of {capacity} available")]
pub struct PoolExhausted {
    pub pool: &'static str,
    pub requested: u32,
    pub available: u32,
    pub capacity: u32,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    PoolExhausted(#[from] PoolExhausted),

    #[error("freed index {index} while no index of {capacity} is allocated")]
    IndexUnderflow { index: u32, capacity: u32 },

    #[error("index {index} is not allocated (capacity {capacity})")]
    IndexNotAllocated { index: u32, capacity: u32 },

    #[error("descriptor handle {handle:#x} does not belong to heap starting at {start:#x}")]
    DescriptorOutOfHeap { handle: u64, start: u64 },

    #[error("descriptor handle {handle:#x} is not on a {stride}-byte slot boundary of heap starting at {start:#x}")]
    MisalignedDescriptor { handle: u64, start: u64, stride: u32 },

    #[error("{0} released more times than it was acquired")]
    DoubleFree(&'static str),

    #[error("invalid {0} handle")]
    InvalidHandle(&'static str),

    #[error("source image {src_width}x{src_height} does not fit texture {width}x{height}")]
    ImageTooLarge { src_width: u32, src_height: u32, width: u32, height: u32 },

    #[error("source image holds {actual} bytes, {expected} expected")]
    ImageDataSize { expected: usize, actual: usize },

    #[error("invalid window size {width}x{height}")]
    InvalidWindowSize { width: u32, height: u32 },

    #[error("{operation} called while the frame is {actual:?}")]
    OutOfOrder { operation: &'static str, actual: crate::renderer::FramePhase },

    #[error("mesh has {count} tri-groups, at most {max} supported")]
    TooManyTriGroups { count: usize, max: usize },

    #[error("texture is not dynamic")]
    NotDynamic,

    #[error("{count} {what} still alive at shutdown")]
    ResourceLeak { what: &'static str, count: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
