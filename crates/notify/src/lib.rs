pub mod notification;
pub mod webhook;

pub use notification::{Notification, NotificationSink, NotifyError, NullNotifier};
pub use webhook::WebhookNotifier;
