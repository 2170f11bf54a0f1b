pub mod daemon;
pub mod file_system;
pub mod logging;
pub mod sync;
