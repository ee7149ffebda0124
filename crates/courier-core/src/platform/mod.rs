//! Messaging platform abstractions (Telegram today; other user-account clients later).

pub mod port;
pub mod throttled;
pub mod types;
