use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::analyzer::blast_radius::BlastRadiusAnalyzer;
use crate::error::CoreResult;
use crate::graph::{Criticality, DependencyEdge, EdgeSourceTag, ServiceGraph};
use crate::model::{ChangeEvent, ChangeEventUpdate, ChangeType, EventStatus, NewChangeEvent};
use crate::store::EventStore;

const NOTIFY_CHANNEL_CAPACITY: usize = 256;
const INFERRED_EDGE_CONFIDENCE: f64 = 0.5;

/// Result of a single ingest: the canonical stored event and whether this
/// call created it (false on an idempotent replay).
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub event: ChangeEvent,
    pub created: bool,
}

/// Write path of the service. Persists events, attaches blast-radius
/// predictions when a graph is present, and notifies subscribers strictly
/// after commit.
pub struct IngestPipeline {
    store: EventStore,
    graph: Arc<RwLock<ServiceGraph>>,
    analyzer: BlastRadiusAnalyzer,
    notifier: broadcast::Sender<ChangeEvent>,
    infer_edges: bool,
}

impl IngestPipeline {
    pub fn new(store: EventStore, graph: ServiceGraph) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        Self {
            store,
            graph: Arc::new(RwLock::new(graph)),
            analyzer: BlastRadiusAnalyzer::new(),
            notifier,
            infer_edges: false,
        }
    }

    /// Enables contributing `inferred` edges from deployment-shaped events.
    pub fn with_edge_inference(mut self, enabled: bool) -> Self {
        self.infer_edges = enabled;
        self
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn graph(&self) -> &Arc<RwLock<ServiceGraph>> {
        &self.graph
    }

    pub fn analyzer(&self) -> &BlastRadiusAnalyzer {
        &self.analyzer
    }

    /// Post-commit observer hook. Lagging subscribers drop messages; they
    /// never block ingest.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.notifier.subscribe()
    }

    /// Idempotent single-event ingest: a previously-seen idempotency key
    /// returns the stored event untouched by the retry payload.
    pub async fn create_event(&self, partial: NewChangeEvent) -> CoreResult<IngestOutcome> {
        if let Some(key) = partial.idempotency_key.as_deref() {
            if let Some(existing) = self.store.get_by_idempotency_key(key).await? {
                debug!(event_id = %existing.id, key, "idempotent replay");
                return Ok(IngestOutcome {
                    event: existing,
                    created: false,
                });
            }
        }

        let event = self.store.insert(partial).await?;
        let event = self.enrich(event).await?;
        let _ = self.notifier.send(event.clone());
        Ok(IngestOutcome {
            event,
            created: true,
        })
    }

    /// Batch ingest: persistence for the whole batch happens inside one
    /// transaction; enrichment and notification run per event after commit.
    /// A validation failure on any event aborts before commit.
    pub async fn batch_create(
        &self,
        partials: Vec<NewChangeEvent>,
    ) -> CoreResult<Vec<ChangeEvent>> {
        // Idempotent replays are resolved up front so the transaction only
        // carries fresh inserts.
        let mut replayed: Vec<(usize, ChangeEvent)> = Vec::new();
        let mut fresh: Vec<(usize, NewChangeEvent)> = Vec::new();
        for (index, partial) in partials.into_iter().enumerate() {
            match partial.idempotency_key.as_deref() {
                Some(key) => match self.store.get_by_idempotency_key(key).await? {
                    Some(existing) => replayed.push((index, existing)),
                    None => fresh.push((index, partial)),
                },
                None => fresh.push((index, partial)),
            }
        }

        let mut tx = self.store.begin().await?;
        let mut inserted: Vec<(usize, ChangeEvent)> = Vec::with_capacity(fresh.len());
        for (index, partial) in fresh {
            match tx.insert(partial).await {
                Ok(event) => inserted.push((index, event)),
                Err(err) => {
                    tx.rollback().await?;
                    return Err(err);
                }
            }
        }
        tx.commit().await?;
        info!(created = inserted.len(), replayed = replayed.len(), "batch ingest committed");

        let mut enriched: Vec<(usize, ChangeEvent)> = Vec::with_capacity(inserted.len());
        for (index, event) in inserted {
            let event = self.enrich(event).await?;
            let _ = self.notifier.send(event.clone());
            enriched.push((index, event));
        }

        enriched.extend(replayed);
        enriched.sort_by_key(|(index, _)| *index);
        Ok(enriched.into_iter().map(|(_, event)| event).collect())
    }

    /// Attaches a blast-radius prediction when a graph is configured and
    /// optionally contributes inferred edges back into it.
    async fn enrich(&self, event: ChangeEvent) -> CoreResult<ChangeEvent> {
        if self.infer_edges {
            self.infer_edges_from(&event).await;
        }

        let prediction = {
            let graph = self.graph.read().await;
            if graph.is_empty() {
                None
            } else {
                Some(self.analyzer.predict(
                    &graph,
                    &event.all_services(),
                    Some(event.change_type),
                ))
            }
        };

        match prediction {
            Some(prediction) => {
                self.store
                    .update(
                        &event.id,
                        ChangeEventUpdate {
                            blast_radius: Some(prediction),
                            ..Default::default()
                        },
                    )
                    .await
            }
            None => Ok(event),
        }
    }

    /// A completed deployment-shaped event touching several services hints
    /// that the primary service depends on its co-affected ones. Existing
    /// edges always win over inference.
    async fn infer_edges_from(&self, event: &ChangeEvent) {
        if event.status != EventStatus::Completed
            || event.additional_services.is_empty()
            || !matches!(
                event.change_type,
                ChangeType::Deployment
                    | ChangeType::Rollback
                    | ChangeType::Scaling
                    | ChangeType::DbMigration
            )
        {
            return;
        }
        let mut graph = self.graph.write().await;
        for target in &event.additional_services {
            if target == &event.service || graph.get_edge(&event.service, target).is_some() {
                continue;
            }
            let mut edge = DependencyEdge::new(event.service.clone(), target.clone());
            edge.edge_source = Some(EdgeSourceTag::Inferred);
            edge.confidence = INFERRED_EDGE_CONFIDENCE;
            edge.criticality = Criticality::Degraded;
            edge.description = Some(format!("inferred from change event {}", event.id));
            graph.add_dependency(edge);
            warn!(
                source = %event.service,
                target = %target,
                "added inferred dependency edge"
            );
        }
    }
}
