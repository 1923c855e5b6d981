//! Generic single-address I2C peripheral
//!
//! Writes its setup registers and registers a set of polls on connect, then
//! caches the last value seen for every polled register. Unit conversion is
//! left to the caller.

use super::registers;
use super::{Component, Lifecycle};
use crate::error::Result;
use crate::i2c::{I2cChannel, PollEvent, PollId, PollRequest};
use crate::notify::Notifier;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A register block to poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub delay_ms: u32,
    pub register: u8,
    pub count: usize,
}

/// Last-known register values, updated from the dispatch thread
struct Readings {
    name: String,
    values: Mutex<HashMap<u8, i32>>,
    notifier: Notifier,
}

impl Readings {
    fn property(register: u8) -> String {
        format!("Register {register:#04x}")
    }

    fn store(&self, register: u8, value: i32) {
        let previous = self.values.lock().insert(register, value);
        if previous != Some(value) {
            self.notifier
                .publish(&self.name, &Self::property(register), value);
        }
    }

    fn forget(&self, register: u8) {
        if self.values.lock().remove(&register).is_some() {
            self.notifier
                .publish(&self.name, &Self::property(register), "ERROR");
        }
    }

    fn apply(&self, event: &PollEvent, count: usize) {
        match &event.values {
            Some(values) => {
                for (offset, &value) in values.iter().enumerate() {
                    self.store(event.register.wrapping_add(offset as u8), value);
                }
            }
            None => {
                log::debug!(
                    "{}: poll error at register {:#04x}",
                    self.name,
                    event.register
                );
                for offset in 0..count {
                    self.forget(event.register.wrapping_add(offset as u8));
                }
            }
        }
    }
}

/// Peripheral at one I2C address
pub struct I2cDevice {
    lifecycle: Lifecycle,
    channel: Arc<I2cChannel>,
    address: u8,
    probe_register: u8,
    /// `(register, value)` written in order before polls are added
    setup: Vec<(u8, u8)>,
    polls: Vec<PollSpec>,
    poll_ids: Mutex<Vec<PollId>>,
    readings: Arc<Readings>,
}

impl I2cDevice {
    pub fn new(name: impl Into<String>, channel: Arc<I2cChannel>, address: u8) -> Self {
        let lifecycle = Lifecycle::new(name);
        let readings = Arc::new(Readings {
            name: lifecycle.name().to_string(),
            values: Mutex::new(HashMap::new()),
            notifier: lifecycle.notifier().clone(),
        });
        Self {
            lifecycle,
            channel,
            address,
            probe_register: 0,
            setup: Vec::new(),
            polls: Vec::new(),
            poll_ids: Mutex::new(Vec::new()),
            readings,
        }
    }

    /// Register read by the reachability and liveness probes
    pub fn with_probe_register(mut self, register: u8) -> Self {
        self.probe_register = register;
        self
    }

    /// Write `value` to `register` on every connect, before any poll is added
    pub fn with_setup_write(mut self, register: u8, value: u8) -> Self {
        self.setup.push((register, value));
        self
    }

    /// Poll `count` registers from `register` every `delay_ms` while connected
    pub fn with_poll(mut self, delay_ms: u32, register: u8, count: usize) -> Self {
        self.polls.push(PollSpec {
            delay_ms,
            register,
            count,
        });
        self
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn setup_writes(&self) -> &[(u8, u8)] {
        &self.setup
    }

    pub fn polls(&self) -> &[PollSpec] {
        &self.polls
    }

    /// Ids of the polls currently registered for this device
    pub fn poll_ids(&self) -> Vec<PollId> {
        self.poll_ids.lock().clone()
    }

    /// Last polled value of `register`
    pub fn reading(&self, register: u8) -> Option<i32> {
        self.readings.values.lock().get(&register).copied()
    }

    /// Polled 16-bit value stored high byte first at `register`
    pub fn reading_u16(&self, register: u8) -> Option<u16> {
        let values = self.readings.values.lock();
        let high = *values.get(&register)?;
        let low = *values.get(&register.wrapping_add(1))?;
        Some(registers::to_u16(low, high))
    }

    pub fn reading_i16(&self, register: u8) -> Option<i16> {
        let values = self.readings.values.lock();
        let high = *values.get(&register)?;
        let low = *values.get(&register.wrapping_add(1))?;
        Some(registers::to_i16(low, high))
    }

    pub fn get_register(&self, register: u8) -> Result<u8> {
        self.channel.get(self.address, register)
    }

    pub fn get_registers(&self, register: u8, count: usize) -> Result<Vec<u8>> {
        self.channel.get_many(self.address, register, count)
    }

    pub fn set_register(&self, register: u8, value: u8) -> Result<()> {
        self.channel.set(self.address, register, value)
    }

    fn probe(&self) -> bool {
        self.channel.is_connected() && self.get_register(self.probe_register).is_ok()
    }
}

impl Component for I2cDevice {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn check_if_possible_to_connect(&self) -> bool {
        self.probe()
    }

    fn check_if_still_connected(&self) -> bool {
        self.probe()
    }

    fn on_connecting(&self) -> Result<bool> {
        if !self.channel.is_connected() {
            log::debug!("{}: I2C channel not connected", self.name());
            return Ok(false);
        }

        for &(register, value) in &self.setup {
            self.set_register(register, value)?;
        }
        for spec in &self.polls {
            let readings = Arc::clone(&self.readings);
            let count = spec.count;
            let id = self.channel.add_poll(
                PollRequest {
                    delay_ms: spec.delay_ms,
                    address: self.address,
                    register: spec.register,
                    count,
                },
                None,
                move |event| readings.apply(event, count),
            )?;
            self.poll_ids.lock().push(id);
        }
        Ok(true)
    }

    fn on_disconnecting(&self) {
        let ids = std::mem::take(&mut *self.poll_ids.lock());
        for id in ids {
            if let Err(e) = self.channel.remove_poll(id) {
                log::debug!("{}: removing poll {} failed: {}", self.name(), id, e);
            }
        }
    }
}
