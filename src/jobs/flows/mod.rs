//! Compute flows run by workers
//!
//! One flow per job kind:
//! - `PromptFlow`: AI-driven model generation from natural language
//! - `ParametricFlow`: template-driven modeling with explicit dimensions
//! - `UploadFlow`: normalization of uploaded CAD files
//! - `AssemblyFlow`: multi-document assembly composition
//! - `FemFlow`: finite-element simulation with an external solver
//!
//! Flows report progress at documented milestones through checkpoints,
//! which double as the cancellation and timeout poll points.

pub mod assembly;
pub mod fem;
pub mod parametric;
pub mod prompt;
pub mod upload;

pub use assembly::AssemblyFlow;
pub use fem::{AnalysisType, FemFlow};
pub use parametric::ParametricFlow;
pub use prompt::PromptFlow;
pub use upload::{detect_format, UploadFlow, UploadFormat};
