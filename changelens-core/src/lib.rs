// ChangeLens Core - change intelligence for incident response
//
// This library answers three questions about a running environment: what
// changed recently, which change most likely caused an incident, and what
// will break if a service changes. It owns the event store, the service
// dependency graph, and the analytical engine; transports live elsewhere.

pub mod analyzer;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod model;
pub mod provenance;
pub mod store;
pub mod triage;

pub use analyzer::blast_radius::{BlastRadiusAnalyzer, BlastRadiusPrediction, RiskLevel};
pub use analyzer::change_sets::{
    ChangeSet, ChangeSetGrouper, RankedChangeSet, ReadinessDelta, ReadinessState,
};
pub use analyzer::correlation::{
    ChangeCorrelation, ChangeCorrelator, CorrelationConfidence, IncidentQuery,
};
pub use error::{CoreError, CoreResult};
pub use graph::{
    Criticality, DependencyEdge, EdgeSourceTag, GraphConfig, GraphExport, GraphStats, ImpactPath,
    ServiceGraph, ServiceNode,
};
pub use ingest::{IngestOutcome, IngestPipeline};
pub use model::{
    AuthorType, ChangeEvent, ChangeEventUpdate, ChangeType, EventSource, EventStatus,
    EvidenceKind, EvidenceLink, Initiator, NewChangeEvent, StoreStats, VelocityMetric,
};
pub use provenance::{extract_event_evidence, infer_event_canonical_url};
pub use store::{EventQuery, EventStore, StoreTransaction};
pub use triage::{run_triage, TriageRequest, TriageResponse};
