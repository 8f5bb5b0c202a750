pub mod sqlite;

use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::StoreError;
use crate::model::{AlarmRecord, Condition};

/// Read-only view of the alarm database maintained by the configuration bot.
pub trait AlarmStore: Send + Sync {
    /// Every alarm row currently flagged enabled.
    fn select_enabled_alarms(
        &self,
    ) -> BoxFuture<'_, Result<Vec<AlarmRecord>, Report<StoreError>>>;

    /// The condition record attached to one alarm.
    fn select_condition(
        &self,
        alarm_id: i64,
    ) -> BoxFuture<'_, Result<Condition, Report<StoreError>>>;
}
