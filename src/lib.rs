//! botflow: chatbot orchestration core.
//!
//! Inbound messages are normalized into a canonical [`payload::Payload`] and
//! pushed through a configurable [`pipeline::Pipeline`] of middleware steps,
//! each a remote action reached through an [`action::ActionInvoker`]. Two
//! higher-level steps do the heavy lifting: [`pattern::fsm::Fsm`], a
//! hierarchical dialog state machine persisted per user session, and
//! [`pattern::fanout::Fanout`], a concurrent multi-action invocation with
//! single-winner selection by rating.

pub mod action;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logger;
pub mod pattern;
pub mod payload;
pub mod pipeline;
pub mod session;
pub mod template;

pub use action::{ActionInvoker, ActionRef, ActionRegistry, InvokeOptions, Invocation};
pub use error::OrchestrateError;
pub use payload::Payload;
pub use pipeline::{Pipeline, PipelineRun, StepConfig};
