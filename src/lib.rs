//! beagle-link - Workstation-side link to an embedded board's I2C proxy
//!
//! The board runs a small proxy that exposes its I2C bus over two TCP
//! sockets. This crate provides:
//!
//! - [`i2c::LineFramer`]: ring buffer splitting a byte stream into lines
//! - [`i2c::I2cChannel`]: `get`/`set`/`addpoll`/`rmpoll`/`ping` over the
//!   command socket, poll pushes dispatched from the poll socket
//! - [`components`]: per-peripheral connect/disconnect lifecycle
//! - [`robot::Robot`]: supervisor with a watchdog that reconnects failed
//!   components

pub mod components;
pub mod config;
pub mod error;
pub mod i2c;
pub mod notify;
pub mod robot;

pub use components::{Component, ComponentState, I2cBus, I2cDevice};
pub use config::Config;
pub use error::{Error, Result};
pub use i2c::{ChannelSettings, ChannelState, I2cChannel};
pub use notify::{Notifier, PropertyChanged};
pub use robot::{Robot, RobotState};
