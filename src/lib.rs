pub mod anchor;
pub mod app;
pub mod artifacts;
pub mod clock;
pub mod compiler;
pub mod config;
pub mod extract;
pub mod logging;
pub mod paginate;
pub mod render;
pub mod resolve;
pub mod session;
pub mod sync;
pub mod typing;
