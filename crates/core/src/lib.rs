pub mod commands;
pub mod events;
pub mod fanout;
pub mod state;
pub mod topics;

pub use commands::Command;
pub use events::{AlarmEvent, DeviceId, InvalidDeviceId};
pub use fanout::{Delivery, FanOut, Observer, ObserverError, ObserverId};
pub use state::{Device, Reconciler, Snapshot};
pub use topics::*;
