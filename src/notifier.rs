pub mod telegram;

use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::NotifyError;

/// Sink for alert messages.
pub trait Notifier: Send + Sync {
    fn send(
        &self,
        channel_id: i64,
        text: &str,
    ) -> BoxFuture<'_, Result<(), Report<NotifyError>>>;
}
