//! The AgentMesh engine — distributed workers over a shared store.
//!
//! Each process embeds a [`Client`]: it registers an instance row,
//! heartbeats capabilities, and runs the cooperating worker loops
//! (RunWorker per mode, BatchPoller, ToolWorker, leader-gated
//! maintenance). Cross-instance coordination happens exclusively through
//! the store: row claims, the singleton leader lease, and notifications.

pub mod batch_poller;
pub mod client;
pub mod context;
pub mod instance;
pub mod notifier;
pub mod registry;
pub mod run_worker;
pub mod tool_worker;

pub use client::{Client, RunOptions, RunOutcome};
pub use notifier::Notifier;
pub use registry::Registry;
