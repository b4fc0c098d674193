//! Wire format of the battery JSON-over-UDP protocol.
//!
//! Everything that touches raw datagrams lives here: request encoding, the
//! strict reply parser, method constants, mode payload builders and the
//! telemetry normalization helpers.

mod frame;
mod methods;
mod mode;
pub mod telemetry;

pub use frame::{encode_request, parse_reply, ProtocolError, ReplyBody, ReplyFrame};
pub use methods::*;
pub use mode::{
    is_negative_ack, ClockTime, ManualSchedule, ModeConfig, PassiveConfig, ValidationError,
    Weekday, WeekdaySet,
};
