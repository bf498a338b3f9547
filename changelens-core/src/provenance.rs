use crate::model::{dedupe_evidence, ChangeEvent, EventSource, EvidenceKind, EvidenceLink};

const EVIDENCE_CAP: usize = 25;

/// Metadata URL keys recognized for typed evidence, in lookup order.
const METADATA_URL_KEYS: [&str; 7] = [
    "run_url",
    "pipeline_url",
    "deployment_url",
    "workflow_url",
    "mr_url",
    "pr_url",
    "compare_url",
];

/// Derives canonical evidence links from an event's attributes: the local
/// event resource, VCS provenance, the caller-supplied canonical URL, and
/// recognized metadata URLs.
pub fn extract_event_evidence(event: &ChangeEvent) -> Vec<EvidenceLink> {
    let mut links = Vec::new();

    links.push(EvidenceLink {
        kind: EvidenceKind::Event,
        label: format!("Change event {}", event.id),
        url: Some(format!("/api/events/{}", event.id)),
        details: None,
    });

    if let Some(pr_url) = &event.pr_url {
        let label = match event.pr_number {
            Some(n) => format!("PR #{}", n),
            None => "Pull request".to_string(),
        };
        links.push(EvidenceLink {
            kind: EvidenceKind::PullRequest,
            label,
            url: Some(pr_url.clone()),
            details: None,
        });
    }

    if let Some(sha) = &event.commit_sha {
        let short = &sha[..sha.len().min(7)];
        links.push(EvidenceLink {
            kind: EvidenceKind::Commit,
            label: format!("Commit {}", short),
            url: commit_url(event),
            details: None,
        });
    }

    if let Some(canonical) = &event.canonical_url {
        links.push(EvidenceLink {
            kind: EvidenceKind::Other,
            label: "Canonical link".to_string(),
            url: Some(canonical.clone()),
            details: None,
        });
    }

    for key in METADATA_URL_KEYS {
        if let Some(url) = event.metadata_str(key) {
            let (kind, label) = classify_metadata_key(key, event.source);
            links.push(EvidenceLink {
                kind,
                label: label.to_string(),
                url: Some(url.to_string()),
                details: None,
            });
        }
    }

    dedupe_evidence(links, EVIDENCE_CAP)
}

/// First available canonical URL: the explicit one, the PR, the synthesized
/// commit URL, then the first recognized metadata URL.
pub fn infer_event_canonical_url(event: &ChangeEvent) -> Option<String> {
    if let Some(url) = &event.canonical_url {
        return Some(url.clone());
    }
    if let Some(url) = &event.pr_url {
        return Some(url.clone());
    }
    if event.commit_sha.is_some() {
        if let Some(url) = commit_url(event) {
            return Some(url);
        }
    }
    METADATA_URL_KEYS
        .iter()
        .find_map(|key| event.metadata_str(key).map(str::to_string))
}

/// Synthesizes a browsable commit URL. `repository` may be a full URL or an
/// `org/repo` shorthand; GitLab uses the `/-/commit/` path form.
fn commit_url(event: &ChangeEvent) -> Option<String> {
    let sha = event.commit_sha.as_ref()?;
    let repository = event.repository.as_ref()?;
    let is_gitlab = event.source == EventSource::Gitlab;

    let base = if repository.starts_with("http://") || repository.starts_with("https://") {
        repository.trim_end_matches('/').to_string()
    } else if is_gitlab {
        format!("https://gitlab.com/{}", repository.trim_matches('/'))
    } else {
        format!("https://github.com/{}", repository.trim_matches('/'))
    };

    if is_gitlab {
        Some(format!("{}/-/commit/{}", base, sha))
    } else {
        Some(format!("{}/commit/{}", base, sha))
    }
}

fn classify_metadata_key(key: &str, source: EventSource) -> (EvidenceKind, &'static str) {
    match key {
        "run_url" => {
            if source == EventSource::Terraform {
                (EvidenceKind::TerraformRun, "Terraform run")
            } else {
                (EvidenceKind::DeploymentRun, "Deployment run")
            }
        }
        "pipeline_url" => (EvidenceKind::PipelineRun, "Pipeline run"),
        "deployment_url" => (EvidenceKind::DeploymentRun, "Deployment"),
        "workflow_url" => (EvidenceKind::DeploymentRun, "Workflow run"),
        "mr_url" => (EvidenceKind::PullRequest, "Merge request"),
        "pr_url" => (EvidenceKind::PullRequest, "Pull request"),
        _ => (EvidenceKind::Other, "Related link"),
    }
}
