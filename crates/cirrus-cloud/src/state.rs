//! The state/action model for compute servers.
//!
//! Two static tables define every legal lifecycle transition: one maps each
//! [`State`] to its stability, implicit target and allowed actions, the other
//! maps each [`Action`] to its target stable state and the clouds that
//! support it. These tables are the single source of truth for transition
//! legality; no other component may hardcode it.

use crate::server::Cloud;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a compute server.
///
/// Stable states stay put until an action is applied; transient states are
/// mid-flight and carry an implicit target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Off,
    Starting,
    Running,
    Stopping,
    Suspending,
    Suspended,
    Deprovisioned,
    Unknown,
}

/// A user-level action that drives a compute server between stable states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Resume,
    Stop,
    Suspend,
    Deprovision,
    Reboot,
}

/// Static description of a single state.
#[derive(Debug, Clone, Copy)]
pub struct StateInfo {
    pub label: &'static str,
    /// Stable states have no further transition pending.
    pub stable: bool,
    /// Target stable state for transient states, `None` for stable ones.
    pub target: Option<State>,
    /// Actions that may legally be applied from this state.
    pub actions: &'static [Action],
}

/// Static description of a single action.
#[derive(Debug, Clone, Copy)]
pub struct ActionInfo {
    pub label: &'static str,
    /// The stable state this action drives the server toward.
    pub target: State,
    /// Clouds supporting this action; `None` means every cloud.
    pub clouds: Option<&'static [Cloud]>,
    /// Destroys data or wipes memory; callers should confirm with the user.
    pub danger: bool,
}

impl State {
    pub const ALL: [State; 8] = [
        State::Off,
        State::Starting,
        State::Running,
        State::Stopping,
        State::Suspending,
        State::Suspended,
        State::Deprovisioned,
        State::Unknown,
    ];

    pub const fn info(self) -> &'static StateInfo {
        match self {
            State::Off => &StateInfo {
                label: "Off",
                stable: true,
                target: None,
                actions: &[Action::Start, Action::Deprovision],
            },
            State::Starting => &StateInfo {
                label: "Starting",
                stable: false,
                target: Some(State::Running),
                actions: &[Action::Start],
            },
            State::Running => &StateInfo {
                label: "Running",
                stable: true,
                target: None,
                actions: &[
                    Action::Stop,
                    Action::Deprovision,
                    Action::Reboot,
                    Action::Suspend,
                ],
            },
            State::Stopping => &StateInfo {
                label: "Stopping",
                stable: false,
                target: Some(State::Off),
                actions: &[Action::Stop],
            },
            State::Suspending => &StateInfo {
                label: "Suspending",
                stable: false,
                target: Some(State::Suspended),
                actions: &[Action::Suspend],
            },
            State::Suspended => &StateInfo {
                label: "Suspended",
                stable: true,
                target: None,
                actions: &[Action::Resume, Action::Deprovision, Action::Stop],
            },
            State::Deprovisioned => &StateInfo {
                label: "Deprovisioned",
                stable: true,
                target: None,
                actions: &[Action::Start],
            },
            State::Unknown => &StateInfo {
                label: "Unknown",
                stable: true,
                target: None,
                actions: &[],
            },
        }
    }

    pub fn is_stable(self) -> bool {
        self.info().stable
    }

    /// Resolve to the eventual stable state: transient states resolve via
    /// their target, stable states resolve to themselves.
    pub fn target(self) -> State {
        match self.info().target {
            Some(target) => target,
            None => self,
        }
    }

    /// Whether `action` may legally be applied from this state.
    pub fn allows(self, action: Action) -> bool {
        self.info().actions.contains(&action)
    }
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Start,
        Action::Resume,
        Action::Stop,
        Action::Suspend,
        Action::Deprovision,
        Action::Reboot,
    ];

    pub const fn info(self) -> &'static ActionInfo {
        match self {
            Action::Start => &ActionInfo {
                label: "Start",
                target: State::Running,
                clouds: None,
                danger: false,
            },
            Action::Resume => &ActionInfo {
                label: "Resume",
                target: State::Running,
                clouds: Some(&[Cloud::GoogleCloud]),
                danger: false,
            },
            Action::Stop => &ActionInfo {
                label: "Stop",
                target: State::Off,
                clouds: None,
                danger: false,
            },
            Action::Suspend => &ActionInfo {
                label: "Suspend",
                target: State::Suspended,
                clouds: Some(&[Cloud::GoogleCloud]),
                danger: false,
            },
            Action::Deprovision => &ActionInfo {
                label: "Deprovision",
                target: State::Deprovisioned,
                clouds: None,
                danger: true,
            },
            Action::Reboot => &ActionInfo {
                label: "Hard Reboot",
                target: State::Running,
                clouds: Some(&[Cloud::GoogleCloud, Cloud::Hyperstack]),
                danger: true,
            },
        }
    }

    /// The stable state this action drives the server toward.
    pub fn target(self) -> State {
        self.info().target
    }

    /// Whether `cloud` supports this action at all.
    pub fn supported_on(self, cloud: Cloud) -> bool {
        match self.info().clouds {
            Some(clouds) => clouds.contains(&cloud),
            None => true,
        }
    }

    /// The transient state a server passes through while this action runs,
    /// if the action has one. `Reboot` keeps the server in place.
    pub fn transient_state(self) -> Option<State> {
        match self {
            Action::Start | Action::Resume => Some(State::Starting),
            Action::Stop | Action::Deprovision => Some(State::Stopping),
            Action::Suspend => Some(State::Suspending),
            Action::Reboot => None,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Off => write!(f, "off"),
            State::Starting => write!(f, "starting"),
            State::Running => write!(f, "running"),
            State::Stopping => write!(f, "stopping"),
            State::Suspending => write!(f, "suspending"),
            State::Suspended => write!(f, "suspended"),
            State::Deprovisioned => write!(f, "deprovisioned"),
            State::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Start => write!(f, "start"),
            Action::Resume => write!(f, "resume"),
            Action::Stop => write!(f, "stop"),
            Action::Suspend => write!(f, "suspend"),
            Action::Deprovision => write!(f, "deprovision"),
            Action::Reboot => write!(f, "reboot"),
        }
    }
}
