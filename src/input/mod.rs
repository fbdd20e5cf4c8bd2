//! Physical input handling
//!
//! Raw GPIO edges come in over channels from blocking interrupt-poll loops
//! ([`gpio`]); the async side decodes them into clean, debounced logical
//! events: signed encoder steps ([`encoder`]) and pressed/held button
//! events ([`button`]).

pub mod button;
pub mod encoder;
pub mod gpio;

pub use button::{DebouncedInput, RawEdge};
pub use encoder::{Direction, Encoder, QuadratureDecoder};
