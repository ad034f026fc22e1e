//! Agent invocation: command synthesis, binary discovery, process spawning.

pub mod command;
pub mod discovery;
pub mod spawn;
