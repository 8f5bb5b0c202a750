use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum ExchangeError {
    #[display("failed to connect to {exchange}")]
    Connection { exchange: String },
    #[display("request to {exchange} failed")]
    Request { exchange: String },
    #[display("failed to parse response from {exchange}")]
    ResponseParse { exchange: String },
    #[display("{exchange} does not support interval {interval}")]
    UnsupportedInterval { exchange: String, interval: String },
    #[display("stream for {exchange} closed")]
    StreamClosed { exchange: String },
}

#[derive(Debug, Display, Error)]
pub enum StoreError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to query data")]
    Query,
    #[display("malformed condition record for alarm {alarm_id}")]
    MalformedCondition { alarm_id: i64 },
}

#[derive(Debug, Display, Error)]
pub enum IndicatorError {
    #[display("insufficient data: need {required}, got {available}")]
    InsufficientData { required: usize, available: usize },
}

#[derive(Debug, Display, Error)]
pub enum NotifyError {
    #[display("failed to reach notification transport")]
    Transport,
    #[display("notification rejected: {description}")]
    Rejected { description: String },
}
