pub mod async_task;
pub mod host;
pub mod signal;
pub mod time;

pub use async_task::*;
pub use host::*;
pub use signal::*;
pub use time::*;
