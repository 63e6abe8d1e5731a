//! Per-plugin lifecycle state machine.
//!
//! ```text
//! Pending ──► Loaded ──► Unloading ──► Unloaded
//!    │          │  └─────────────────────▲
//!    │          └──► Failed
//!    └──► Failed
//! ```
//!
//! `Unloaded` and `Failed` are terminal. Loading the same id again starts a
//! fresh `Pending` instance instead of leaving a terminal state.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Load accepted; factory resolution or instantiation in progress
    Pending,
    /// Exports published; activity running
    Loaded,
    /// Cancellation requested; waiting for the activity to finish
    Unloading,
    /// Activity finished and removed from the live table
    Unloaded,
    /// Resolution or factory failure
    Failed,
}

impl PluginState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Unloaded | Self::Failed)
    }

    /// Not yet in a terminal state.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether the instance holds exports in the live table.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Loaded | Self::Unloading)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use PluginState::{Failed, Loaded, Pending, Unloaded, Unloading};
        matches!(
            (self, next),
            (Pending, Loaded)
                | (Pending, Failed)
                | (Loaded, Unloading)
                | (Loaded, Unloaded)
                | (Loaded, Failed)
                | (Unloading, Unloaded)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Loaded => "loaded",
            Self::Unloading => "unloading",
            Self::Unloaded => "unloaded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::PluginState::*;
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        assert!(Pending.can_transition_to(Loaded));
        assert!(Loaded.can_transition_to(Unloading));
        assert!(Unloading.can_transition_to(Unloaded));
        assert!(Pending.can_transition_to(Failed));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for next in [Pending, Loaded, Unloading, Unloaded, Failed] {
            assert!(!Unloaded.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn cannot_skip_loading() {
        assert!(!Pending.can_transition_to(Unloading));
        assert!(!Pending.can_transition_to(Unloaded));
        assert!(!Unloading.can_transition_to(Loaded));
    }

    #[test]
    fn liveness_classification() {
        assert!(Loaded.is_live() && Unloading.is_live());
        assert!(!Pending.is_live());
        assert!(Pending.is_active());
        assert!(!Failed.is_active());
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&Unloading).unwrap();
        assert_eq!(json, "\"unloading\"");
        assert_eq!(Unloading.to_string(), "unloading");
    }
}
