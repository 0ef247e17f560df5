//! devrack: launch, watch and probe a rack of local dev servers.
//!
//! The supervision core lives in [`runner`] (process handles and the
//! supervisor), [`output`] (line pumps) and [`probe`] (loopback HTTP checks).
//! It reports everything through [`events::Event`]; [`console`] is one
//! consumer of those events.

pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod output;
pub mod probe;
pub mod process;
pub mod runner;
