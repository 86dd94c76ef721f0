//! Campaign management
//!
//! The campaign manager owns the set of cloud-issued campaigns and the
//! active decoder manifest, drives campaign state machines, and publishes
//! two derived artifacts on every change: the inspection matrix (for the
//! engine) and the filtered decoder dictionary (for the bus adapters).
//! Publication is one-way and atomic; the engine never reaches back.

pub mod documents;
mod manager;
mod matrix;
mod state;

pub use documents::{
    Campaign, CampaignList, DocumentError, SignalRequirement, StateTemplateSet,
    StateTemplatesDiff, TriggerKind, TriggerMode,
};
pub use manager::{CampaignManager, CampaignManagerHandles, ControlEvent};
pub use matrix::{CampaignRuntime, InspectionMatrix, SignalNeed};
pub use state::{CampaignRecord, CampaignState, DropReason, RefreshOutcome};
