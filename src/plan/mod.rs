//! The planning pipeline and its artifact schemas.

pub mod pipeline;
pub mod schemas;

pub use pipeline::PlanningPipeline;
pub use schemas::{
    ArchReview, Architecture, ArchitectureComponent, ArchitectureDecision, IssueSpec, PlanResult,
    Prd, SprintPlan,
};
