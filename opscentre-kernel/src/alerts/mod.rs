pub mod engine;
pub mod sink;
pub mod thresholds;

pub use engine::{Alert, AlertDelta, AlertEngine, AlertError, AlertFilter, AlertKey, AlertSettings, AlertState, DeltaKind};
pub use sink::{AlertSink, LogSink, MqttSink};
pub use thresholds::{Severity, ThresholdConfigInvalid, ThresholdRuleConfig, ThresholdTable};
