//! The I2C proxy connection as a robot component

use super::{Component, Lifecycle};
use crate::error::Result;
use crate::i2c::I2cChannel;
use std::sync::Arc;

/// Wraps an [`I2cChannel`] so the robot connects it first and the watchdog
/// pings it.
pub struct I2cBus {
    lifecycle: Lifecycle,
    channel: Arc<I2cChannel>,
}

impl I2cBus {
    pub const NAME: &'static str = "I2C";

    /// Component and channel notifications share one notifier
    pub fn new(channel: Arc<I2cChannel>) -> Self {
        Self {
            lifecycle: Lifecycle::with_notifier(Self::NAME, channel.notifier()),
            channel,
        }
    }

    pub fn channel(&self) -> &Arc<I2cChannel> {
        &self.channel
    }
}

impl Component for I2cBus {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// False until host and both ports are configured
    fn check_if_possible_to_connect(&self) -> bool {
        self.channel.settings().is_complete()
    }

    fn check_if_still_connected(&self) -> bool {
        self.channel.ping()
    }

    fn on_connecting(&self) -> Result<bool> {
        if self.channel.is_connected() {
            return Ok(true);
        }
        self.channel.connect()
    }

    fn on_disconnecting(&self) {
        if let Err(e) = self.channel.disconnect() {
            log::warn!("{}: disconnect failed: {}", Self::NAME, e);
        }
    }

    fn on_disposing(&self) {
        self.channel.dispose();
    }
}
