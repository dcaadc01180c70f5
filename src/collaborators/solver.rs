//! External FEM solver collaborator interface
//!
//! The solver is invoked with an input deck path and produces result
//! files (.frd, .dat, .sta) plus an output log. Convergence failure is a
//! fatal, non-retryable error for the owning job.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

/// Solver errors
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    /// Non-retryable: the analysis did not converge
    #[error("Solver did not converge: {0}")]
    NonConvergence(String),

    #[error("Solver binary failed: {0}")]
    ExecutionFailed(String),

    #[error("Solver timed out after {0:?}")]
    Timeout(Duration),

    #[error("Input deck not found: {0}")]
    DeckNotFound(String),
}

/// Result type for solver operations
pub type SolverResult<T> = Result<T, SolverError>;

/// Files produced by a successful solve
#[derive(Debug, Clone)]
pub struct SolverOutput {
    /// Binary results (.frd)
    pub result_file: PathBuf,
    /// Tabulated data (.dat)
    pub data_file: PathBuf,
    /// Solver status trace (.sta)
    pub status_file: PathBuf,
    /// Captured stdout/stderr log
    pub log: String,
    /// Iterations until convergence
    pub iterations: u32,
}

/// The external solver collaborator.
#[async_trait]
pub trait FemSolver: Send + Sync {
    /// Run the solver on an input deck with a hard timeout.
    async fn solve(&self, deck_path: &PathBuf, timeout: Duration) -> SolverResult<SolverOutput>;
}

/// Mock solver producing synthetic result files next to the deck.
pub struct MockFemSolver {
    /// Fail with non-convergence instead of producing results
    pub diverge: bool,
}

impl MockFemSolver {
    pub fn new() -> Self {
        Self { diverge: false }
    }

    pub fn diverging() -> Self {
        Self { diverge: true }
    }
}

impl Default for MockFemSolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FemSolver for MockFemSolver {
    async fn solve(&self, deck_path: &PathBuf, _timeout: Duration) -> SolverResult<SolverOutput> {
        if !deck_path.exists() {
            return Err(SolverError::DeckNotFound(deck_path.display().to_string()));
        }
        if self.diverge {
            return Err(SolverError::NonConvergence(
                "residual norm increased for 10 iterations".to_string(),
            ));
        }

        let result_file = deck_path.with_extension("frd");
        let data_file = deck_path.with_extension("dat");
        let status_file = deck_path.with_extension("sta");

        tokio::fs::write(&result_file, b"    1PSTEP 1\n 100CL  101 displacement\n")
            .await
            .map_err(|e| SolverError::ExecutionFailed(e.to_string()))?;
        tokio::fs::write(&data_file, b" displacements (vx,vy,vz) for set NALL\n")
            .await
            .map_err(|e| SolverError::ExecutionFailed(e.to_string()))?;
        tokio::fs::write(&status_file, b"STEP 1 CONVERGED\n")
            .await
            .map_err(|e| SolverError::ExecutionFailed(e.to_string()))?;

        Ok(SolverOutput {
            result_file,
            data_file,
            status_file,
            log: "job finished, no errors\n".to_string(),
            iterations: 4,
        })
    }
}
