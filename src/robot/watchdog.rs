//! Watchdog thread: detects lost components and reconnects failed ones
//!
//! Each component check runs under the robot's operation lock, so a check
//! never overlaps a user's `connect`/`disconnect`/`dispose`.

use super::{RobotShared, RobotState};
use crate::components::{Component, ComponentState};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub(crate) fn run(shared: Arc<RobotShared>) {
    log::debug!("{}: watchdog started ({:?} interval)", shared.name, shared.interval);

    while shared.sleep() {
        check_components(&shared);
    }

    log::debug!("{}: watchdog stopped", shared.name);
}

/// One pass over every component. The pass ends early once the robot is no
/// longer connected. A panicking check is logged and the pass moves on.
pub(crate) fn check_components(shared: &RobotShared) {
    for component in &shared.components {
        let _operation = shared.operation.lock();
        if shared.shutdown.load(Ordering::SeqCst) || shared.state() != RobotState::Connected {
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| check(component.as_ref())));
        if result.is_err() {
            log::error!("{}: watchdog check panicked", component.name());
        }
    }
}

fn check(component: &dyn Component) {
    match component.state() {
        ComponentState::Connected => {
            if component.check_if_still_connected() {
                return;
            }
            log::warn!("{}: connection lost", component.name());
            component.disconnect();
            if component.state() == ComponentState::Disconnected {
                component.lifecycle().mark_failed();
            }
        }
        ComponentState::Failed => {
            if !component.check_if_possible_to_connect()
                || component.state() != ComponentState::Failed
            {
                return;
            }
            match component.connect() {
                Ok(true) => log::info!("{}: reconnected", component.name()),
                Ok(false) => log::debug!("{}: reconnect failed", component.name()),
                Err(e) => log::warn!("{}: reconnect error: {}", component.name(), e),
            }
        }
        _ => {}
    }
}
