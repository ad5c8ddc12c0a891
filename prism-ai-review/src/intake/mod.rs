//! Idempotent intake of source-control events.
//!
//! The same webhook may be delivered twice, or to two running instances. Before
//! any work starts, each event is reduced to a [fingerprint](InboundEvent::fingerprint)
//! and claimed through the [`IntakeGuard`]. Only the instance whose claim is
//! accepted processes the event.

use serde::Serialize;
use serde_json::Value;

pub mod guard;

pub use guard::{ClaimOutcome, IntakeConfig, IntakeGuard};

/// Errors surfaced by the intake guard. A duplicate delivery is an outcome,
/// not an error; see [`ClaimOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    /// The event kind is not one the guard knows how to fingerprint
    #[error("Unrecognized event kind '{kind}', refusing to claim")]
    UnrecognizedEvent { kind: String },

    /// The claim store could not be reached or rejected the statement
    #[error("Claim store unavailable: {source}")]
    ClaimStoreUnavailable {
        #[from]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, IntakeError>;

/// A webhook event, reduced to the fields that identify it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    MergeRequest {
        resource_id: String,
        request_id: String,
        action: String,
        last_revision: String,
    },
    Push {
        resource_id: String,
        revision: String,
        git_ref: String,
    },
    Note {
        resource_id: String,
        note_id: String,
        updated_at: String,
    },
    Reaction {
        resource_id: String,
        reaction_id: String,
        updated_at: String,
    },
    /// Anything the guard cannot fingerprint. Never claimed.
    Unrecognized { kind: String },
}

impl InboundEvent {
    /// Builds an event from a loosely-typed webhook body.
    ///
    /// Each field is looked up under a plain name first (`resource_id`,
    /// `request_id`, ...) and then under the nested names common webhook
    /// payloads use (`project.id`, `object_attributes.iid`, ...). Numbers are
    /// accepted wherever strings are. An unknown kind, or a known kind missing a
    /// required field, yields [`InboundEvent::Unrecognized`].
    pub fn from_payload(kind: &str, payload: &Value) -> Self {
        let kind = kind.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        let event = match kind.as_str() {
            "merge_request" | "pull_request" => merge_request_from(payload),
            "push" => push_from(payload),
            "note" | "comment" => note_from(payload),
            "reaction" | "emoji" | "award_emoji" => reaction_from(payload),
            _ => None,
        };

        event.unwrap_or(InboundEvent::Unrecognized { kind })
    }

    /// Kind label stored with the claim.
    pub fn kind(&self) -> &str {
        match self {
            InboundEvent::MergeRequest { .. } => "merge_request",
            InboundEvent::Push { .. } => "push",
            InboundEvent::Note { .. } => "note",
            InboundEvent::Reaction { .. } => "reaction",
            InboundEvent::Unrecognized { kind } => kind,
        }
    }

    pub fn resource_id(&self) -> Option<&str> {
        match self {
            InboundEvent::MergeRequest { resource_id, .. }
            | InboundEvent::Push { resource_id, .. }
            | InboundEvent::Note { resource_id, .. }
            | InboundEvent::Reaction { resource_id, .. } => Some(resource_id),
            InboundEvent::Unrecognized { .. } => None,
        }
    }

    /// The part of the fingerprint that tells deliveries of the same kind apart.
    fn discriminator(&self) -> Option<String> {
        match self {
            InboundEvent::MergeRequest {
                request_id,
                action,
                last_revision,
                ..
            } => Some(format!("{request_id}:{last_revision}:{action}")),
            InboundEvent::Push {
                revision, git_ref, ..
            } => Some(format!("{revision}:{git_ref}")),
            InboundEvent::Note {
                note_id,
                updated_at,
                ..
            } => Some(format!("{note_id}:{updated_at}")),
            InboundEvent::Reaction {
                reaction_id,
                updated_at,
                ..
            } => Some(format!("{reaction_id}:{updated_at}")),
            InboundEvent::Unrecognized { .. } => None,
        }
    }

    /// Hex blake3 digest of `kind|resource|discriminator`, 64 characters.
    ///
    /// `None` for unrecognized events, which must not be claimed.
    pub fn fingerprint(&self) -> Option<String> {
        let resource_id = self.resource_id()?;
        let discriminator = self.discriminator()?;
        let material = format!("{}|{}|{}", self.kind(), resource_id, discriminator);
        Some(hex::encode(blake3::hash(material.as_bytes()).as_bytes()))
    }
}

fn resource_from(payload: &Value) -> Option<String> {
    lookup(payload, &["resource_id", "project.id", "project_id"])
}

fn merge_request_from(payload: &Value) -> Option<InboundEvent> {
    Some(InboundEvent::MergeRequest {
        resource_id: resource_from(payload)?,
        request_id: lookup(payload, &["request_id", "object_attributes.iid", "number"])?,
        action: lookup(payload, &["action", "object_attributes.action"])
            .unwrap_or_else(|| "open".to_string()),
        last_revision: lookup(
            payload,
            &[
                "last_revision",
                "object_attributes.last_commit.id",
                "pull_request.head.sha",
            ],
        )?,
    })
}

fn push_from(payload: &Value) -> Option<InboundEvent> {
    Some(InboundEvent::Push {
        resource_id: resource_from(payload)?,
        revision: lookup(payload, &["revision", "after", "checkout_sha"])?,
        git_ref: lookup(payload, &["git_ref", "ref"])?,
    })
}

fn note_from(payload: &Value) -> Option<InboundEvent> {
    Some(InboundEvent::Note {
        resource_id: resource_from(payload)?,
        note_id: lookup(payload, &["note_id", "object_attributes.id", "comment.id"])?,
        updated_at: lookup(
            payload,
            &["updated_at", "object_attributes.updated_at", "comment.updated_at"],
        )?,
    })
}

fn reaction_from(payload: &Value) -> Option<InboundEvent> {
    Some(InboundEvent::Reaction {
        resource_id: resource_from(payload)?,
        reaction_id: lookup(payload, &["reaction_id", "object_attributes.id", "reaction.id"])?,
        updated_at: lookup(
            payload,
            &["updated_at", "object_attributes.updated_at", "reaction.updated_at"],
        )?,
    })
}

/// First non-empty value among dotted `paths`, rendered as a string.
fn lookup(payload: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| {
        let value = path
            .split('.')
            .try_fold(payload, |value, key| value.get(key))?;
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    })
}
