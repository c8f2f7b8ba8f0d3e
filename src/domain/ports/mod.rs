//! Ports: trait seams between the substrate and its collaborators.

pub mod agent;
pub mod state_backend;

pub use agent::{
    AnalysisAgent, ArbitrationOutcome, DownstreamAgent, IntegrationGuidance, PropagationContext,
    RefinementAgent, Reflection, Revision, RevisionOutput, ValidationAgent, ValidationRequest,
};
pub use state_backend::StateBackend;
