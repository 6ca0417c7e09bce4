//! Turns status transitions and connection signals into lifecycle events.

use std::fmt;

use crate::status::{PrintState, PrinterStatus, StateSnapshot};

/// Lifecycle event handed to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    StartPrint,
    PausePrint,
    CancelPrint,
    Error,
    StateChange,
}

impl Event {
    /// True for events that end the current job.
    pub fn ends_job(self) -> bool {
        matches!(self, Self::CancelPrint | Self::Error)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StartPrint => "start_print",
            Self::PausePrint => "pause_print",
            Self::CancelPrint => "cancel_print",
            Self::Error => "error",
            Self::StateChange => "state_change",
        };
        f.write_str(name)
    }
}

/// Connection lifecycle notifications from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Disconnected,
    Shutdown,
    Ready,
}

/// Classify one patch application. First matching rule wins.
pub fn classify(previous: &StateSnapshot, current: &StateSnapshot) -> Option<Event> {
    use PrintState::{Paused, Printing, Standby};

    let before = previous.state.as_ref();
    let after = current.state.as_ref();
    let state_changed = before != after;

    match (before, after) {
        (Some(Standby), Some(Printing)) => Some(Event::StartPrint),
        (Some(Printing), Some(Paused)) => Some(Event::PausePrint),
        (_, Some(Standby)) if state_changed => Some(Event::CancelPrint),
        (_, Some(Printing)) if state_changed => Some(Event::StateChange),
        (_, Some(Printing)) if previous.message != current.message => Some(Event::StateChange),
        _ => None,
    }
}

/// Lifecycle signals bypass the transition table.
pub fn classify_signal(signal: LifecycleSignal) -> Event {
    match signal {
        LifecycleSignal::Disconnected | LifecycleSignal::Shutdown => Event::Error,
        LifecycleSignal::Ready => Event::StateChange,
    }
}

/// Periodic refresh: a forced state change, but only while printing.
pub fn classify_tick(status: &PrinterStatus) -> Option<Event> {
    status.is_printing().then_some(Event::StateChange)
}
