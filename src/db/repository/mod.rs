pub mod notification;

pub use notification::{NotificationFilter, NotificationRepository};
