//! Hotplug debouncing.
//!
//! Connector disconnects are not committed immediately: flaky cables
//! and link retraining produce disconnect/reconnect pairs well under a
//! second apart. A disconnect arms a deadline instead; a reconnect
//! before it fires cancels it and the output never tears down.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::hw::ConnectorId;
use crate::scheduler::Nanos;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    /// Connector became available; bring the output up.
    Connect,
    /// Reconnect while a disconnect was pending. Jitter; nothing to do.
    CancelDisconnect,
    /// Disconnect observed; tear down only once the deadline passes.
    ArmDisconnect { due: Nanos },
    /// No state change.
    None,
}

#[derive(Debug, Default)]
struct Slot {
    connected: bool,
    disconnect_at: Option<Nanos>,
}

#[derive(Debug)]
pub struct HotplugDebouncer {
    debounce: Nanos,
    slots: HashMap<ConnectorId, Slot>,
}

impl HotplugDebouncer {
    pub fn new(debounce: Nanos) -> Self {
        Self {
            debounce,
            slots: HashMap::new(),
        }
    }

    /// Records the initial probe result for a connector.
    pub fn seed(&mut self, conn: ConnectorId, connected: bool) {
        self.slots.insert(
            conn,
            Slot {
                connected,
                disconnect_at: None,
            },
        );
    }

    /// Folds in a probed connector state at time `now`.
    pub fn note(&mut self, conn: ConnectorId, connected: bool, now: Nanos) -> HotplugAction {
        let slot = self.slots.entry(conn).or_default();
        match (slot.connected, connected) {
            (false, true) => {
                slot.connected = true;
                slot.disconnect_at = None;
                debug!(?conn, "connector connected");
                HotplugAction::Connect
            }
            (true, true) => {
                if slot.disconnect_at.take().is_some() {
                    debug!(?conn, "connector back before debounce, ignoring glitch");
                    HotplugAction::CancelDisconnect
                } else {
                    HotplugAction::None
                }
            }
            (true, false) => {
                // A repeated disconnect keeps the original deadline.
                match slot.disconnect_at {
                    Some(due) => {
                        trace!(?conn, due, "disconnect already pending");
                        HotplugAction::None
                    }
                    None => {
                        let due = now + self.debounce;
                        slot.disconnect_at = Some(due);
                        debug!(?conn, due, "connector disconnect pending debounce");
                        HotplugAction::ArmDisconnect { due }
                    }
                }
            }
            (false, false) => HotplugAction::None,
        }
    }

    /// Connectors whose disconnect debounce has expired. They are
    /// committed as disconnected and returned for teardown.
    pub fn expired(&mut self, now: Nanos) -> Vec<ConnectorId> {
        let mut gone = Vec::new();
        for (conn, slot) in &mut self.slots {
            if let Some(due) = slot.disconnect_at {
                if due <= now {
                    slot.disconnect_at = None;
                    slot.connected = false;
                    debug!(?conn, "connector disconnect confirmed");
                    gone.push(*conn);
                }
            }
        }
        gone.sort();
        gone
    }

    pub fn next_deadline(&self) -> Option<Nanos> {
        self.slots.values().filter_map(|s| s.disconnect_at).min()
    }

    pub fn is_connected(&self, conn: ConnectorId) -> bool {
        self.slots.get(&conn).map(|s| s.connected).unwrap_or(false)
    }
}
