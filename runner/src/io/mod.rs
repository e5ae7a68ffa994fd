//! Side-effecting adapters: config, processes, artifacts and external collaborators.

pub mod artifacts;
pub mod config;
pub mod llm;
pub mod process;
pub mod signals;
pub mod tools;
pub mod tutorials;
pub mod user_input;
