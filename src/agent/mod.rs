//! Agents: one live session with the trading service each

#[allow(clippy::module_inception)]
mod agent;
mod handlers;
mod state;

pub use agent::{Agent, AgentBuilder, AGENT_DIMENSION, DEFAULT_START_TIMEOUT};
pub(crate) use agent::AgentInner;
pub use state::{AgentState, ErrorRecord};
