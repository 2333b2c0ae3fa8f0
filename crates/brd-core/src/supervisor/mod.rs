//! Worker Supervisor - isolated worker processes running one engine each

mod channel;
mod manager;
mod worker;

pub use channel::*;
pub use manager::*;
pub use worker::*;
