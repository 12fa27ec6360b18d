/*!
# EdgeLink DevKit - fakes and harness for SDK development

Library for exercising the EdgeLink SDK without a directory service, a
broker or a network:
- MQTT-less edge-events transport with server frame builders
- Scriptable directory service
- Device, location and latency probe fakes
- `TestHarness` wiring a whole session together
*/

pub mod device_stub;
pub mod dme_stub;
pub mod mqtt_stub;
pub mod test_utils;

pub use device_stub::{FixedLocation, MockDeviceInfo, MockProbe};
pub use dme_stub::MockDirectory;
pub use mqtt_stub::{MockEventTransport, ServerEventBuilder};
pub use test_utils::{RecordingHost, TestHarness};
