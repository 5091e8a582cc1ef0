pub mod cmdline;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod storage_paths;

pub use cmdline::*;
pub use config::*;
pub use error::*;
pub use event_bus::*;
pub use storage_paths::*;
