//! Tree-search agent core for automated machine-learning engineering.
//!
//! The runner grows a Monte Carlo search tree whose nodes are candidate
//! solutions: a generated Python program plus the shell script that runs it.
//! The layering keeps pure and effectful code apart:
//!
//! - **[`core`]**: Pure, deterministic logic (variable registry, template
//!   engine, UCT, selection and terminal policy, token ledger). No I/O.
//! - **[`io`]**: Side-effecting adapters (configuration, subprocesses,
//!   cancellation, artifact layout, chat backends, tool catalog, tutorials).
//! - **[`prompts`]** and **[`agents`]**: one prompt builder per role and the
//!   wrappers that send them through a chat backend.
//!
//! [`mcts`] owns the tree and drives the select/expand/simulate/backpropagate
//! loop; [`run`] wires real collaborators for the `mlrunner run` command.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod mcts;
pub mod prompts;
pub mod run;
pub mod state;
pub mod summary;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tree;
