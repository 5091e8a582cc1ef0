pub mod command;
pub mod event;
pub mod frame;
pub mod runtime;

pub use command::*;
pub use event::*;
pub use frame::*;
pub use runtime::*;
