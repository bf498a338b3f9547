pub mod blast_radius;
pub mod change_sets;
pub mod correlation;

pub use blast_radius::{BlastRadiusAnalyzer, BlastRadiusPrediction, RiskLevel};
pub use change_sets::{ChangeSet, ChangeSetGrouper, RankedChangeSet, ReadinessDelta};
pub use correlation::{ChangeCorrelation, ChangeCorrelator, IncidentQuery};
