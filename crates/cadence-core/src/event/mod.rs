//! Pipeline lifecycle notifications.

pub mod bus;

pub use bus::{EventBus, RunEvents};
