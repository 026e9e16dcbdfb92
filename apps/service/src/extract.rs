//! Scans accumulated assistant text for tagged change proposals.
//!
//! The model is instructed to emit `PROPOSAL_<KIND>_<ENTITY>:` tags, each
//! followed by a single JSON object. A tag whose JSON does not parse is
//! dropped on its own; it never aborts extraction of the other blocks.

use once_cell::sync::Lazy;
use regex::Regex;

use taskpilot_proto::{Proposal, ProposalEntity, ProposalKind};

/// Extraction runs once per streamed response, and only after this much
/// content has accumulated, so half-streamed tag fragments are not acted
/// on.
pub const MIN_DETECT_CONTENT_LEN: usize = 100;

const TAG_TABLE: [(&str, ProposalKind, ProposalEntity); 6] = [
    ("PROPOSAL_CREATE_TASK", ProposalKind::Create, ProposalEntity::Task),
    ("PROPOSAL_UPDATE_TASK", ProposalKind::Update, ProposalEntity::Task),
    ("PROPOSAL_DELETE_TASK", ProposalKind::Delete, ProposalEntity::Task),
    ("PROPOSAL_CREATE_SUBTASK", ProposalKind::Create, ProposalEntity::Subtask),
    ("PROPOSAL_UPDATE_SUBTASK", ProposalKind::Update, ProposalEntity::Subtask),
    ("PROPOSAL_DELETE_SUBTASK", ProposalKind::Delete, ProposalEntity::Subtask),
];

static TAG_PATTERNS: Lazy<Vec<(Regex, ProposalKind, ProposalEntity)>> = Lazy::new(|| {
    TAG_TABLE
        .iter()
        .filter_map(|(tag, kind, entity)| {
            let pattern = format!(r"(?s){tag}:\s*(\{{.*?\}})");
            let regex = Regex::new(&pattern).ok()?;
            Some((regex, *kind, *entity))
        })
        .collect()
});

/// Scan `content` for every recognized tag occurrence and parse each
/// into a proposal candidate. Candidates get a fresh id and a derived
/// human-readable description.
#[must_use]
pub fn extract_proposals(content: &str) -> Vec<Proposal> {
    let mut proposals = Vec::new();
    for (pattern, kind, entity) in TAG_PATTERNS.iter() {
        for capture in pattern.captures_iter(content) {
            let Some(body) = capture.get(1) else {
                continue;
            };
            match serde_json::from_str::<serde_json::Value>(body.as_str()) {
                Ok(payload) if payload.is_object() => {
                    proposals.push(Proposal {
                        id: fresh_proposal_id(),
                        kind: *kind,
                        entity: *entity,
                        payload,
                        description: format!(
                            "Proposal to {} {}",
                            kind.as_str(),
                            entity.as_str()
                        ),
                    });
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::debug!(
                        kind = kind.as_str(),
                        entity = entity.as_str(),
                        reason = %error,
                        "dropping proposal block with malformed JSON"
                    );
                }
            }
        }
    }
    proposals
}

/// Collision resistance comes from pairing a microsecond timestamp with
/// 64 random bits; ids never leave the session that minted them before
/// being persisted.
fn fresh_proposal_id() -> String {
    format!(
        "proposal_{}_{:016x}",
        chrono::Utc::now().timestamp_micros(),
        rand::random::<u64>()
    )
}
