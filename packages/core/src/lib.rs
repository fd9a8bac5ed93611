//! `RelayBus` Core — message model, property values, and clock sources.

pub mod clock;
pub mod message;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use message::{properties, Direction, Message};
pub use types::Value;
