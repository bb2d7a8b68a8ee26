// =============================================================================
// Pipeline contracts: typed phase outputs, quality tracking, validation gates
// =============================================================================

pub mod gates;
pub mod quality;
pub mod schemas;
pub mod validation;

pub use gates::{GateResult, ValidationGates};
pub use quality::{DataQuality, IssueCategory, IssueSeverity, ValidationIssue};
pub use schemas::{
    AggregateOutput, AggregatedExposure, DecomposeOutput, EtfDecomposition, Holding, LoadOutput,
    Position,
};
