/// "Contexts" split the renderer's state by lifetime: the device and its target, the ring of
/// frames in flight, load-time resources and the shared pipelines.

pub mod device_ctx;
pub mod frame_ctx;
pub mod pipeline_ctx;
pub mod resource_ctx;
