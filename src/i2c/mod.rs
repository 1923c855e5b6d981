//! I2C proxy transport
//!
//! - [`LineFramer`]: ring buffer that splits a byte stream into lines
//! - [`I2cChannel`]: command socket, poll socket and poll dispatch
//! - [`protocol`]: request encoding and response parsing

mod channel;
mod dispatch;
mod line_framer;
pub mod poll;
pub mod protocol;
mod source;

pub use channel::{CHANNEL_SOURCE, ChannelSettings, ChannelState, DEFAULT_BUFFER_SIZE, I2cChannel};
pub use line_framer::LineFramer;
pub use poll::{PollCallback, PollEvent, PollId, PollRequest, UserData};
pub use source::ByteSource;
