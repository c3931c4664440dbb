//! Plan compilation and routing for the skein orchestration engine.

pub mod cache;
pub mod compiler;
pub mod properties;
pub mod routing;

pub use cache::PlanCache;
pub use compiler::compile;
pub use routing::{resolve_route, ResolvedRoute};
