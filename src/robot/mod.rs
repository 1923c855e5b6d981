//! Robot supervisor
//!
//! Owns the ordered component list (I2C bus first) and a watchdog thread.
//! Connect walks the list in order; disconnect and dispose walk it in
//! reverse so peripherals let go of their polls before the bus closes.

mod watchdog;

use crate::components::{Component, ComponentState, I2cBus, I2cDevice};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::i2c::I2cChannel;
use crate::notify::{Notifier, PropertyChanged};
use crossbeam_channel::{Receiver, unbounded};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default time between watchdog passes
pub const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle state of the robot as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotState {
    None,
    Disconnected,
    Connected,
    Disposed,
}

impl fmt::Display for RobotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State shared with the watchdog thread
pub(crate) struct RobotShared {
    name: String,
    components: Vec<Arc<dyn Component>>,
    state: Mutex<RobotState>,
    notifier: Notifier,
    interval: Duration,
    /// Serializes init/connect/disconnect/dispose and each watchdog check
    operation: Mutex<()>,
    shutdown: AtomicBool,
    sleep_lock: Mutex<()>,
    wake: Condvar,
}

impl RobotShared {
    fn new(name: String, components: Vec<Arc<dyn Component>>, interval: Duration) -> Self {
        Self {
            name,
            components,
            state: Mutex::new(RobotState::None),
            notifier: Notifier::new(),
            interval,
            operation: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            sleep_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    fn state(&self) -> RobotState {
        *self.state.lock()
    }

    fn set_state(&self, state: RobotState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            log::info!("{}: {} -> {}", self.name, previous, state);
            self.notifier.publish(&self.name, "State", state);
        }
    }

    /// Sleep one interval. Returns `false` once shutdown is requested.
    fn sleep(&self) -> bool {
        let deadline = Instant::now() + self.interval;
        let mut guard = self.sleep_lock.lock();
        while !self.shutdown.load(Ordering::SeqCst) {
            if self.wake.wait_until(&mut guard, deadline).timed_out() {
                return !self.shutdown.load(Ordering::SeqCst);
            }
        }
        false
    }

    fn stop(&self) {
        let _guard = self.sleep_lock.lock();
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_all();
    }
}

/// Supervisor for a set of components
pub struct Robot {
    shared: Arc<RobotShared>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl Robot {
    /// Create a robot and start its watchdog. The watchdog only acts while
    /// the robot is connected.
    pub fn new(
        name: impl Into<String>,
        components: Vec<Arc<dyn Component>>,
        watchdog_interval: Duration,
    ) -> Result<Self> {
        let name = name.into();
        if watchdog_interval.is_zero() {
            return Err(Error::Config("watchdog interval must be non-zero".into()));
        }

        let shared = Arc::new(RobotShared::new(name, components, watchdog_interval));

        let thread_shared = Arc::clone(&shared);
        let watchdog = thread::Builder::new()
            .name("robot-watchdog".to_string())
            .spawn(move || watchdog::run(thread_shared))?;

        Ok(Self {
            shared,
            watchdog: Mutex::new(Some(watchdog)),
        })
    }

    /// Build the I2C bus and every configured device on one shared channel
    pub fn from_config(config: &Config) -> Result<Self> {
        let channel = Arc::new(I2cChannel::new(config.proxy.channel_settings())?);

        let mut components: Vec<Arc<dyn Component>> =
            vec![Arc::new(I2cBus::new(Arc::clone(&channel)))];
        for device in &config.devices {
            let peripheral = device
                .setup
                .iter()
                .fold(
                    I2cDevice::new(&device.name, Arc::clone(&channel), device.address)
                        .with_probe_register(device.probe_register),
                    |peripheral, write| peripheral.with_setup_write(write.register, write.value),
                );
            let peripheral = device.polls.iter().fold(peripheral, |peripheral, poll| {
                peripheral.with_poll(poll.delay_ms, poll.register, poll.count)
            });
            components.push(Arc::new(peripheral));
        }

        Self::new(&config.name, components, config.watchdog.interval())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> RobotState {
        self.shared.state()
    }

    pub fn components(&self) -> &[Arc<dyn Component>] {
        &self.shared.components
    }

    pub fn component(&self, name: &str) -> Option<&Arc<dyn Component>> {
        self.shared.components.iter().find(|c| c.name() == name)
    }

    /// One receiver for robot and component notifications
    pub fn subscribe(&self) -> Receiver<PropertyChanged> {
        let (tx, rx) = unbounded();
        self.shared.notifier.attach(tx.clone());
        for component in &self.shared.components {
            component.lifecycle().notifier().attach(tx.clone());
        }
        rx
    }

    fn require(&self, expected: RobotState, operation: &str) -> Result<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{}: {} while {}",
                self.shared.name, operation, state
            )))
        }
    }

    /// Attach every component to this robot
    pub fn init(&self) -> Result<()> {
        let _operation = self.shared.operation.lock();
        self.require(RobotState::None, "init")?;
        for component in &self.shared.components {
            component.init(&self.shared.name)?;
        }
        self.shared.set_state(RobotState::Disconnected);
        Ok(())
    }

    /// Connect every component in order. Individual failures leave that
    /// component `Failed` for the watchdog to retry.
    pub fn connect(&self) -> Result<()> {
        let _operation = self.shared.operation.lock();
        self.require(RobotState::Disconnected, "connect")?;
        for component in &self.shared.components {
            match component.connect() {
                Ok(true) => log::info!("{}: connected", component.name()),
                Ok(false) => log::warn!("{}: failed to connect", component.name()),
                Err(e) => log::warn!("{}: connect error: {}", component.name(), e),
            }
        }
        self.shared.set_state(RobotState::Connected);
        Ok(())
    }

    /// Disconnect connected components in reverse order
    pub fn disconnect(&self) -> Result<()> {
        let _operation = self.shared.operation.lock();
        self.require(RobotState::Connected, "disconnect")?;
        self.disconnect_components();
        Ok(())
    }

    fn disconnect_components(&self) {
        for component in self.shared.components.iter().rev() {
            if component.state() == ComponentState::Connected {
                component.disconnect();
            }
        }
        self.shared.set_state(RobotState::Disconnected);
    }

    /// Stop the watchdog, disconnect, and dispose every component. Idempotent.
    pub fn dispose(&self) {
        // Join the watchdog before taking the operation lock it checks under
        self.shared.stop();
        if let Some(handle) = self.watchdog.lock().take() {
            if handle.thread().id() == thread::current().id() {
                log::debug!("{}: dispose from watchdog thread, not joining", self.shared.name);
            } else if handle.join().is_err() {
                log::error!("{}: watchdog thread panicked", self.shared.name);
            }
        }

        let _operation = self.shared.operation.lock();
        if self.state() == RobotState::Disposed {
            return;
        }

        if self.state() == RobotState::Connected {
            self.disconnect_components();
        }
        for component in self.shared.components.iter().rev() {
            component.dispose();
        }
        self.shared.set_state(RobotState::Disposed);
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        self.dispose();
    }
}
