// src/detection/mod.rs

mod merge;
mod state_machine;
mod types;

pub use merge::{finalize_events, FinalizeConfig};
pub use state_machine::{
    Baseline, EntryStamp, HysteresisConfig, HysteresisMachine, Observation, Phase, Transition,
};
pub use types::{round_to, Event, PeakAttributes};
