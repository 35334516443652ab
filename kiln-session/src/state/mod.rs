pub mod schema;
pub mod timing;
pub mod transitions;

// Re-export the domain types for convenience
pub use schema::{
    Actor, ContextType, EntityType, Feature, FeatureId, FeatureStatus, Priority, Role, Status,
    Task, TaskId, TaskStatus,
};
pub use transitions::{validate_feature_transition, validate_task_transition};
