pub mod agent;
pub mod plan;
pub mod serve;
pub mod span;
