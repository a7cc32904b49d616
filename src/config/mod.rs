pub mod schema;

pub use schema::{
    Config, DebounceConfig, ObservabilityConfig, ReliabilityConfig, ReminderConfig,
};
