pub mod config;
pub mod dist;
pub mod error;
pub mod freeze;
pub mod matrix;
pub mod observability;
pub mod pin;
pub mod pipeline;
pub mod platform;
pub mod preflight;
pub mod runtime;
pub mod security;
pub mod stages;
pub mod validation;

pub use config::ForgeConfig;
pub use error::{ForgeError, ForgeResult};
pub use matrix::VersionMatrix;
pub use pipeline::{PipelineContext, PipelineExecutor, PipelineReport, SkipFlags};
pub use platform::{CommandRunner, SystemRunner, ToolTable};
