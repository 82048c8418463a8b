//! Built-in platform kinds.

pub mod calc;
pub mod coverage;
pub mod platformix;
pub mod scoreboard;
pub mod sequencer;
