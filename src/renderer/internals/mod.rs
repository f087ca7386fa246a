/// "Internals" refers to low-level allocators the frame and resource contexts are built from.

pub mod index_allocator;
pub mod descriptor_allocator;
pub mod linear_descriptor_allocator;
pub mod constant_buffer_pool;
