//! Robot components and their connect/disconnect lifecycle
//!
//! Every peripheral implements [`Component`]. The trait supplies the state
//! machine (`init`, `connect`, `disconnect`, `dispose`); implementors only
//! provide the probes and optional hooks.
//!
//! ```text
//!   None ──init──► Disconnected ◄──disconnect── Connected
//!                       │                          ▲
//!                       └──connect──► Failed ──────┘ (connect)
//!   any ──dispose──► Disposed
//! ```

pub mod bus;
pub mod device;
pub mod registers;

pub use bus::I2cBus;
pub use device::{I2cDevice, PollSpec};

use crate::error::{Error, Result};
use crate::notify::{Notifier, PropertyChanged};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::fmt;

/// Lifecycle state of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    None,
    Disconnected,
    Connected,
    Failed,
    Disposed,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State shared by every component: name, owner, state and notifications
pub struct Lifecycle {
    name: String,
    owner: Mutex<Option<String>>,
    state: Mutex<ComponentState>,
    /// Serializes connect/disconnect/dispose and watchdog transitions
    transition: Mutex<()>,
    notifier: Notifier,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_notifier(name, Notifier::new())
    }

    pub fn with_notifier(name: impl Into<String>, notifier: Notifier) -> Self {
        Self {
            name: name.into(),
            owner: Mutex::new(None),
            state: Mutex::new(ComponentState::None),
            transition: Mutex::new(()),
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the robot this component was initialised by
    pub fn owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    pub fn state(&self) -> ComponentState {
        *self.state.lock()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Publish a property change under this component's name
    pub fn publish(&self, property: &str, value: impl ToString) {
        self.notifier.publish(&self.name, property, value);
    }

    /// Store a new state, notifying only if it changed
    fn set_state(&self, state: ComponentState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            log::info!("{}: {} -> {}", self.name, previous, state);
            self.publish("State", state);
        }
    }

    /// Force `Failed` after a detected loss. A disposed component stays disposed.
    pub fn mark_failed(&self) {
        let _transition = self.transition.lock();
        if self.state() != ComponentState::Disposed {
            self.set_state(ComponentState::Failed);
        }
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A peripheral managed by a [`Robot`](crate::robot::Robot)
pub trait Component: Send + Sync {
    fn lifecycle(&self) -> &Lifecycle;

    /// Cheap reachability probe used before connecting and by the watchdog
    fn check_if_possible_to_connect(&self) -> bool;

    /// Liveness probe for a connected component
    fn check_if_still_connected(&self) -> bool;

    /// One-time setup such as registering polls. `Ok(false)` or an error
    /// fails the connect.
    fn on_connecting(&self) -> Result<bool> {
        Ok(true)
    }

    /// Best-effort teardown, e.g. removing polls. Must not fail.
    fn on_disconnecting(&self) {}

    fn on_disposing(&self) {}

    fn name(&self) -> &str {
        self.lifecycle().name()
    }

    fn state(&self) -> ComponentState {
        self.lifecycle().state()
    }

    fn subscribe(&self) -> Receiver<PropertyChanged> {
        self.lifecycle().notifier().subscribe()
    }

    /// Attach to the owning robot. Only legal once, from `None`.
    fn init(&self, owner: &str) -> Result<()> {
        let lifecycle = self.lifecycle();
        let _transition = lifecycle.transition.lock();
        if lifecycle.state() != ComponentState::None {
            return Err(Error::InvalidState(format!(
                "{}: init while {}",
                lifecycle.name(),
                lifecycle.state()
            )));
        }
        *lifecycle.owner.lock() = Some(owner.to_string());
        lifecycle.set_state(ComponentState::Disconnected);
        Ok(())
    }

    /// Probe, run the connect hook and move to `Connected` or `Failed`.
    ///
    /// Hook errors are logged and reported as `Ok(false)`.
    fn connect(&self) -> Result<bool> {
        let lifecycle = self.lifecycle();
        let _transition = lifecycle.transition.lock();
        let state = lifecycle.state();
        if matches!(state, ComponentState::Connected | ComponentState::Disposed) {
            return Err(Error::InvalidState(format!(
                "{}: connect while {}",
                lifecycle.name(),
                state
            )));
        }

        if !self.check_if_possible_to_connect() {
            log::debug!("{}: not reachable", lifecycle.name());
            lifecycle.set_state(ComponentState::Failed);
            return Ok(false);
        }

        let success = match self.on_connecting() {
            Ok(success) => success,
            Err(e) => {
                log::warn!("{}: connect failed: {}", lifecycle.name(), e);
                false
            }
        };

        if success {
            lifecycle.set_state(ComponentState::Connected);
        } else {
            // Release anything the hook set up before failing
            self.on_disconnecting();
            lifecycle.set_state(ComponentState::Failed);
        }
        Ok(success)
    }

    /// Run the disconnect hook and return to `Disconnected`. No-op once disposed.
    fn disconnect(&self) {
        let lifecycle = self.lifecycle();
        let _transition = lifecycle.transition.lock();
        match lifecycle.state() {
            ComponentState::Disposed | ComponentState::None => {}
            ComponentState::Disconnected => self.on_disconnecting(),
            ComponentState::Connected | ComponentState::Failed => {
                self.on_disconnecting();
                lifecycle.set_state(ComponentState::Disconnected);
            }
        }
    }

    /// Release resources and move to the terminal `Disposed` state. Idempotent.
    fn dispose(&self) {
        let lifecycle = self.lifecycle();
        let _transition = lifecycle.transition.lock();
        if lifecycle.state() == ComponentState::Disposed {
            return;
        }
        self.on_disposing();
        lifecycle.set_state(ComponentState::Disposed);
    }
}
