//! Common types for the Gemini client core

mod secret;
mod time;

pub use secret::Secret;
pub use time::unix_now_secs;
