//! Request handlers.

pub mod health;
pub mod jobs;
pub mod workers;

pub use health::*;
pub use jobs::*;
pub use workers::*;
