use chrono::{Duration, Utc};

use changelens_core::{
    BlastRadiusAnalyzer, ChangeCorrelator, ChangeSetGrouper, ChangeType, DependencyEdge,
    EventStore, IncidentQuery, IngestPipeline, NewChangeEvent, ServiceGraph, ServiceNode,
    TriageRequest,
};

fn partial(service: &str, summary: &str, change_type: ChangeType) -> NewChangeEvent {
    NewChangeEvent {
        service: Some(service.to_string()),
        summary: Some(summary.to_string()),
        change_type: Some(change_type),
        ..Default::default()
    }
}

#[tokio::test]
async fn closer_events_rank_first() {
    let store = EventStore::open_in_memory().await.unwrap();
    let mut graph = ServiceGraph::new();
    graph.add_service(ServiceNode::new("api"));

    let incident_time = Utc::now();
    let mut near = partial("api", "deploy close to incident", ChangeType::Deployment);
    near.timestamp = Some(incident_time - Duration::minutes(5));
    let near = store.insert(near).await.unwrap();
    let mut far = partial("api", "deploy long before incident", ChangeType::Deployment);
    far.timestamp = Some(incident_time - Duration::minutes(90));
    let far = store.insert(far).await.unwrap();

    let correlations = ChangeCorrelator::new()
        .correlate(
            &store,
            &graph,
            &IncidentQuery {
                affected_services: vec!["api".into()],
                incident_time: Some(incident_time),
                window_minutes: Some(120),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(correlations.len(), 2);
    assert_eq!(correlations[0].change_event.id, near.id);
    assert_eq!(correlations[1].change_event.id, far.id);
    assert!(correlations[0].correlation_score > correlations[1].correlation_score);
    assert!(correlations[0]
        .why_relevant
        .contains(&"Very recent (<15m)".to_string()));
}

#[tokio::test]
async fn graph_expansion_reaches_two_hop_events() {
    let store = EventStore::open_in_memory().await.unwrap();
    let mut graph = ServiceGraph::new();
    graph.add_dependency(DependencyEdge::new("A", "B"));
    graph.add_dependency(DependencyEdge::new("B", "C"));

    let incident_time = Utc::now();
    let mut event = partial("C", "deployed C", ChangeType::Deployment);
    event.timestamp = Some(incident_time - Duration::minutes(5));
    let event = store.insert(event).await.unwrap();

    let correlations = ChangeCorrelator::new()
        .correlate(
            &store,
            &graph,
            &IncidentQuery {
                affected_services: vec!["A".into()],
                incident_time: Some(incident_time),
                window_minutes: Some(60),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(correlations.len(), 1);
    assert_eq!(correlations[0].change_event.id, event.id);
    assert_eq!(correlations[0].service_overlap, vec!["C"]);
    assert!(correlations[0]
        .why_relevant
        .iter()
        .any(|reason| reason.contains("2-hop graph neighbor")));
    assert_eq!(correlations[0].confidence.factors.service_adjacency, 0.4);
}

#[tokio::test]
async fn min_score_filters_and_max_results_truncates() {
    let store = EventStore::open_in_memory().await.unwrap();
    let graph = ServiceGraph::new();
    let incident_time = Utc::now();

    for i in 0..5 {
        let mut event = partial("api", "deploy", ChangeType::Deployment);
        event.timestamp = Some(incident_time - Duration::minutes(i * 5));
        store.insert(event).await.unwrap();
    }
    // An unrelated service far outside adjacency scores low but not zero
    // (time and type still contribute), so use a high min_score to cut.
    let correlations = ChangeCorrelator::new()
        .correlate(
            &store,
            &graph,
            &IncidentQuery {
                affected_services: vec!["api".into()],
                incident_time: Some(incident_time),
                window_minutes: Some(60),
                max_results: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(correlations.len(), 3);

    let strict = ChangeCorrelator::new()
        .correlate(
            &store,
            &graph,
            &IncidentQuery {
                affected_services: vec!["api".into()],
                incident_time: Some(incident_time),
                window_minutes: Some(60),
                min_score: Some(0.99),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(strict.is_empty());
}

#[tokio::test]
async fn attached_blast_radius_feeds_correlation_risk() {
    let store = EventStore::open_in_memory().await.unwrap();
    let mut graph = ServiceGraph::new();
    graph.add_dependency(DependencyEdge::new("web", "api"));
    let pipeline = IngestPipeline::new(store, graph);

    let outcome = pipeline
        .create_event(partial("api", "risky deploy", ChangeType::Deployment))
        .await
        .unwrap();
    assert!(outcome.event.blast_radius.is_some());

    let graph = pipeline.graph().read().await;
    let correlations = ChangeCorrelator::new()
        .correlate(
            pipeline.store(),
            &graph,
            &IncidentQuery {
                affected_services: vec!["api".into()],
                window_minutes: Some(60),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(correlations.len(), 1);
    // critical single-hop path means the stored risk level is critical
    assert_eq!(correlations[0].confidence.factors.change_risk, 1.0);
}

#[tokio::test]
async fn triage_derives_suspects_and_ranks_change_sets() {
    let store = EventStore::open_in_memory().await.unwrap();
    let mut graph = ServiceGraph::new();
    graph.add_dependency(DependencyEdge::new("web", "api"));
    let pipeline = IngestPipeline::new(store, graph);

    for i in 0..3 {
        let mut event = partial("api", "rollout step", ChangeType::Deployment);
        event
            .metadata
            .insert("pipeline_id".into(), serde_json::Value::String("p-7".into()));
        event.timestamp = Some(Utc::now() - Duration::minutes(i + 1));
        pipeline.create_event(event).await.unwrap();
    }
    pipeline
        .create_event(partial("web", "css tweak", ChangeType::CodeChange))
        .await
        .unwrap();

    let graph = pipeline.graph().read().await;
    let response = changelens_core::run_triage(
        pipeline.store(),
        &graph,
        TriageRequest {
            window_minutes: Some(60),
            symptom_tags: vec!["latency".into()],
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(response.suspects_derived);
    assert!(response.suspected_services.contains(&"api".to_string()));
    assert_eq!(response.symptom_tags, vec!["latency"]);
    assert!(!response.correlations.is_empty());
    assert!(!response.change_sets.is_empty());
    assert!(response.change_sets.len() <= 3);
    // pipeline-grouped set should be the strongest candidate
    assert_eq!(response.change_sets[0].change_set.key, "run:manual:p-7");
}

#[tokio::test]
async fn ranked_change_sets_carry_suggested_blast_radius() {
    let store = EventStore::open_in_memory().await.unwrap();
    let mut graph_init = ServiceGraph::new();
    graph_init.add_dependency(DependencyEdge::new("web", "api"));
    let pipeline = IngestPipeline::new(store, graph_init);

    pipeline
        .create_event(partial("api", "deploy api", ChangeType::Deployment))
        .await
        .unwrap();

    let graph = pipeline.graph().read().await;
    let correlations = ChangeCorrelator::new()
        .correlate(
            pipeline.store(),
            &graph,
            &IncidentQuery {
                affected_services: vec!["api".into()],
                window_minutes: Some(60),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let ranked = ChangeSetGrouper::new().rank_for_incident(
        &correlations,
        &graph,
        &BlastRadiusAnalyzer::new(),
        None,
    );
    assert_eq!(ranked.len(), 1);
    let suggested = &ranked[0].suggested_blast_radius;
    assert_eq!(suggested.direct_services, vec!["web"]);
    assert!(ranked[0].score > 0.0);
}
