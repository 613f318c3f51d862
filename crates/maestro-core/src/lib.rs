//! The maestro orchestration core: mission queue, agent registry, delivery
//! substrate, routing/decomposition, the oracle controller, and the
//! learning and search-feedback loops.
//!
//! External collaborators (the durable store, the semantic index, the LLM
//! provider, the worker runtime) are reached only through narrow capability
//! seams; a root [`orchestrator::Orchestrator`] constructed at startup owns
//! every component and passes handles downward. There is no global state.

pub mod breaker;
pub mod decomposer;
pub mod delivery;
pub mod error;
pub mod feedback;
pub mod index;
pub mod learning;
pub mod llm;
pub mod oracle;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod router;
pub mod runtime;

pub use error::QueueError;
