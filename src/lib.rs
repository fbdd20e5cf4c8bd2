//! dsp-rig - home audio rig control daemons
//!
//! Bridges physical controls (rotary encoder, push buttons) and a CamillaDSP
//! engine through a Redis coordination store. Each physical device runs as an
//! independent long-lived process; processes never call one another directly,
//! they only publish actions and read published state.

pub mod coalesce;
pub mod config;
pub mod controller;
pub mod engine;
pub mod input;
pub mod store;

pub use coalesce::EventCoalescer;
pub use config::AppConfig;
pub use controller::DspController;
pub use engine::{CamillaClient, DspEngine, EngineError, ProcessingState};
pub use store::{RedisStore, Store, StoreError};
