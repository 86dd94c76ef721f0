//! Active diagnostic trouble code source
//!
//! Campaigns may ask for the currently-active DTC set to ride along with
//! each triggered bundle. Bus adapters publish into `SharedDtcState`; the
//! inspection engine only reads.

use std::sync::Mutex;

/// Read access to the active DTC snapshot.
pub trait DtcSource: Send + Sync {
    fn active_dtcs(&self) -> Vec<String>;
}

/// Process-local DTC state updated by the OBD adapter.
#[derive(Default)]
pub struct SharedDtcState {
    active: Mutex<Vec<String>>,
}

impl SharedDtcState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active set (adapter-side).
    pub fn set_active(&self, dtcs: Vec<String>) {
        if let Ok(mut active) = self.active.lock() {
            *active = dtcs;
        }
    }
}

impl DtcSource for SharedDtcState {
    fn active_dtcs(&self) -> Vec<String> {
        self.active.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_read() {
        let state = SharedDtcState::new();
        assert!(state.active_dtcs().is_empty());

        state.set_active(vec!["P0420".to_string(), "P0171".to_string()]);
        assert_eq!(state.active_dtcs(), vec!["P0420", "P0171"]);
    }
}
