//! Replays datastore updates through a policy calculation graph, printing the derived events.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
pub mod replay;

pub use self::args::{Args, LogFormat};
pub use policy_graph_core as core;
pub use policy_graph_index as index;
