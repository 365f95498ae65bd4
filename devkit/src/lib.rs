/*!
# Opscentre DevKit

Support crate for developing and testing the operations command centre:
- `HospitalPayloadBuilder` and a deterministic synthetic feed
- `ScriptedSource`, a metric source driven by a script instead of a network
- `CentreHarness`, a full command centre wired to scripted hospitals
- the `opscentre-simulate` binary, which publishes the synthetic feed over MQTT
*/

pub mod feed;
pub mod scripted_source;
pub mod test_utils;

pub use feed::{reference_hospitals, synthetic_payload, HospitalPayloadBuilder, HospitalProfile, Scenario};
pub use scripted_source::{ScriptedSource, Step};
pub use test_utils::{init_tracing, CentreHarness, RecordingSink};
