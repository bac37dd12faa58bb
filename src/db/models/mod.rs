//! Database models.

pub mod notification;

pub use self::notification::*;
