use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::analyzer::blast_radius::BlastRadiusPrediction;
use crate::error::CoreError;

/// Kind of mutation a change event describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Deployment,
    ConfigChange,
    InfraModification,
    FeatureFlag,
    DbMigration,
    CodeChange,
    Rollback,
    Scaling,
    SecurityPatch,
}

impl ChangeType {
    pub const ALL: [ChangeType; 9] = [
        ChangeType::Deployment,
        ChangeType::ConfigChange,
        ChangeType::InfraModification,
        ChangeType::FeatureFlag,
        ChangeType::DbMigration,
        ChangeType::CodeChange,
        ChangeType::Rollback,
        ChangeType::Scaling,
        ChangeType::SecurityPatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Deployment => "deployment",
            ChangeType::ConfigChange => "config_change",
            ChangeType::InfraModification => "infra_modification",
            ChangeType::FeatureFlag => "feature_flag",
            ChangeType::DbMigration => "db_migration",
            ChangeType::CodeChange => "code_change",
            ChangeType::Rollback => "rollback",
            ChangeType::Scaling => "scaling",
            ChangeType::SecurityPatch => "security_patch",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| CoreError::validation(format!("unknown change type: {}", s)))
    }
}

/// Origin system that observed the change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Github,
    Gitlab,
    AwsCodepipeline,
    AwsEcs,
    AwsLambda,
    Kubernetes,
    ClaudeHook,
    AgentHook,
    Manual,
    Terraform,
}

impl EventSource {
    pub const ALL: [EventSource; 10] = [
        EventSource::Github,
        EventSource::Gitlab,
        EventSource::AwsCodepipeline,
        EventSource::AwsEcs,
        EventSource::AwsLambda,
        EventSource::Kubernetes,
        EventSource::ClaudeHook,
        EventSource::AgentHook,
        EventSource::Manual,
        EventSource::Terraform,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Github => "github",
            EventSource::Gitlab => "gitlab",
            EventSource::AwsCodepipeline => "aws_codepipeline",
            EventSource::AwsEcs => "aws_ecs",
            EventSource::AwsLambda => "aws_lambda",
            EventSource::Kubernetes => "kubernetes",
            EventSource::ClaudeHook => "claude_hook",
            EventSource::AgentHook => "agent_hook",
            EventSource::Manual => "manual",
            EventSource::Terraform => "terraform",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| CoreError::validation(format!("unknown event source: {}", s)))
    }
}

/// Who initiated the change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    Human,
    Agent,
    Automation,
    Unknown,
}

impl Initiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Initiator::Human => "human",
            Initiator::Agent => "agent",
            Initiator::Automation => "automation",
            Initiator::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Initiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Initiator {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Initiator::Human),
            "agent" => Ok(Initiator::Agent),
            "automation" => Ok(Initiator::Automation),
            "unknown" => Ok(Initiator::Unknown),
            _ => Err(CoreError::validation(format!("unknown initiator: {}", s))),
        }
    }
}

/// How the change was authored, distinct from who initiated it: an agent may
/// push a human-authored commit and vice versa.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AuthorType {
    Human,
    AiAssisted,
    AutonomousAgent,
}

impl AuthorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorType::Human => "human",
            AuthorType::AiAssisted => "ai_assisted",
            AuthorType::AutonomousAgent => "autonomous_agent",
        }
    }
}

impl fmt::Display for AuthorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthorType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(AuthorType::Human),
            "ai_assisted" => Ok(AuthorType::AiAssisted),
            "autonomous_agent" => Ok(AuthorType::AutonomousAgent),
            _ => Err(CoreError::validation(format!("unknown author type: {}", s))),
        }
    }
}

/// Lifecycle state of the change itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::InProgress => "in_progress",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(EventStatus::InProgress),
            "completed" => Ok(EventStatus::Completed),
            "failed" => Ok(EventStatus::Failed),
            "rolled_back" => Ok(EventStatus::RolledBack),
            _ => Err(CoreError::validation(format!("unknown status: {}", s))),
        }
    }
}

/// A single logical mutation observed in the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    #[serde(default)]
    pub additional_services: Vec<String>,
    pub change_type: ChangeType,
    pub source: EventSource,
    pub initiator: Initiator,
    #[serde(default)]
    pub initiator_identity: Option<String>,
    #[serde(default)]
    pub author_type: Option<AuthorType>,
    pub status: EventStatus,
    pub environment: String,
    pub summary: String,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub pr_number: Option<i64>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub config_keys: Vec<String>,
    #[serde(default)]
    pub previous_version: Option<String>,
    #[serde(default)]
    pub new_version: Option<String>,
    #[serde(default)]
    pub blast_radius: Option<BlastRadiusPrediction>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub change_set_id: Option<String>,
    #[serde(default)]
    pub canonical_url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// The primary service plus every co-affected service, in order,
    /// primary first, without duplicates.
    pub fn all_services(&self) -> Vec<String> {
        let mut services = vec![self.service.clone()];
        for s in &self.additional_services {
            if !services.contains(s) {
                services.push(s.clone());
            }
        }
        services
    }

    /// String-valued metadata lookup.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Insert partial: everything the ingest path may omit is optional and
/// server-filled. Validation happens in the store, not here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NewChangeEvent {
    pub timestamp: Option<DateTime<Utc>>,
    pub service: Option<String>,
    pub additional_services: Vec<String>,
    pub change_type: Option<ChangeType>,
    pub source: Option<EventSource>,
    pub initiator: Option<Initiator>,
    pub initiator_identity: Option<String>,
    pub author_type: Option<AuthorType>,
    pub status: Option<EventStatus>,
    pub environment: Option<String>,
    pub summary: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub diff: Option<String>,
    pub files_changed: Vec<String>,
    pub config_keys: Vec<String>,
    pub previous_version: Option<String>,
    pub new_version: Option<String>,
    pub idempotency_key: Option<String>,
    pub change_set_id: Option<String>,
    pub canonical_url: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl NewChangeEvent {
    /// Materialize the canonical event, filling server defaults.
    /// The caller is responsible for validating required fields first.
    pub(crate) fn into_event(self, now: DateTime<Utc>) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4().to_string(),
            timestamp: self.timestamp.unwrap_or(now),
            service: self.service.unwrap_or_default(),
            additional_services: self.additional_services,
            change_type: self.change_type.unwrap_or(ChangeType::Deployment),
            source: self.source.unwrap_or(EventSource::Manual),
            initiator: self.initiator.unwrap_or(Initiator::Unknown),
            initiator_identity: self.initiator_identity,
            author_type: self.author_type,
            status: self.status.unwrap_or(EventStatus::Completed),
            environment: self
                .environment
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "production".to_string()),
            summary: self.summary.unwrap_or_default(),
            commit_sha: self.commit_sha,
            pr_number: self.pr_number,
            pr_url: self.pr_url,
            repository: self.repository,
            branch: self.branch,
            diff: self.diff,
            files_changed: self.files_changed,
            config_keys: self.config_keys,
            previous_version: self.previous_version,
            new_version: self.new_version,
            blast_radius: None,
            idempotency_key: self.idempotency_key,
            change_set_id: self.change_set_id,
            canonical_url: self.canonical_url,
            tags: self.tags,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Update partial. Only present fields are touched; an update carrying no
/// recognized field is a no-op that returns the current event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeEventUpdate {
    pub status: Option<EventStatus>,
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Map<String, Value>>,
    pub blast_radius: Option<BlastRadiusPrediction>,
    pub change_set_id: Option<String>,
}

impl ChangeEventUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.summary.is_none()
            && self.tags.is_none()
            && self.metadata.is_none()
            && self.blast_radius.is_none()
            && self.change_set_id.is_none()
    }
}

/// Typed URL justifying correlation and triage output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceLink {
    #[serde(rename = "type")]
    pub kind: EvidenceKind,
    pub label: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Event,
    PullRequest,
    Commit,
    PipelineRun,
    DeploymentRun,
    TerraformRun,
    K8sRollout,
    GraphPath,
    Other,
}

/// Deduplicate by (kind, label, url), preserving first occurrence order,
/// then cap the list.
pub fn dedupe_evidence(links: Vec<EvidenceLink>, cap: usize) -> Vec<EvidenceLink> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for link in links {
        let key = (link.kind, link.label.clone(), link.url.clone());
        if seen.insert(key) {
            out.push(link);
            if out.len() == cap {
                break;
            }
        }
    }
    out
}

/// Change-rate aggregate for one service over one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VelocityMetric {
    pub service: String,
    pub window_minutes: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub change_count: i64,
    pub change_types: BTreeMap<ChangeType, i64>,
    pub average_interval_minutes: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: i64,
    pub by_type: BTreeMap<String, i64>,
    pub by_source: BTreeMap<String, i64>,
    pub by_environment: BTreeMap<String, i64>,
}

/// Round to three decimal places. Scores and factors are rounded before
/// storage or transmission; internal math runs at full precision.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
