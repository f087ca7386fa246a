pub mod app;
pub mod renderer;
