//! External collaborator interfaces
//!
//! This module provides the trait seams for the processes this core
//! coordinates but does not own:
//!
//! - `CadKernel`: the CAD-kernel process that opens and mutates documents
//! - `AiAdapter`: the AI provider generating modeling scripts
//! - `FemSolver`: the external FEM solver consuming input decks
//!
//! Each trait ships with a mock implementation used by tests and by
//! dev-mode deployments.

pub mod ai;
pub mod cad_kernel;
pub mod solver;

pub use ai::{AiAdapter, AiError, AiRequest, AiResponse, MockAiAdapter};
pub use cad_kernel::{
    CadKernel, ExportFormat, KernelError, KernelResult, MockCadKernel, ValidationLevel,
};
pub use solver::{FemSolver, MockFemSolver, SolverError, SolverOutput, SolverResult};
