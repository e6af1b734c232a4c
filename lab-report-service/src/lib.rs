pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod render;
pub mod service;
pub mod tasks;
pub mod telemetry;
pub mod text_source;
pub mod workflow;

pub use config::ServiceConfig;
pub use error::PipelineError;
pub use models::*;
pub use service::{AppState, build_router, create_app};
pub use workflow::{ReportPipeline, build_report_workflow};
