//! Persona validation: the review step a persona passes before the executor
//! may battle with it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arena_state::{
    ParseEnumError, Persona, PersonaStore, PersonaValidationStatus, PersonaValidationUpdate,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{conflict_as_miss, ArenaError, Result};
use crate::obs;

/// Reviewer decision on a persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationDecision {
    Approve,
    Reject,
    /// Approve despite an earlier rejection.
    Override,
}

impl fmt::Display for ValidationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Override => "override",
        })
    }
}

impl FromStr for ValidationDecision {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "override" => Ok(Self::Override),
            other => Err(ParseEnumError {
                kind: "validation decision",
                value: other.to_string(),
            }),
        }
    }
}

/// Status a decision leads to from `current`, if allowed.
pub fn next_validation_status(
    current: PersonaValidationStatus,
    decision: ValidationDecision,
) -> Option<PersonaValidationStatus> {
    use PersonaValidationStatus::*;
    match (current, decision) {
        (PendingValidation, ValidationDecision::Approve) => Some(Approved),
        (PendingValidation, ValidationDecision::Reject) => Some(Rejected),
        (PendingValidation | Rejected, ValidationDecision::Override) => Some(ApprovedOverride),
        _ => None,
    }
}

pub struct PersonaService {
    personas: Arc<dyn PersonaStore>,
}

impl PersonaService {
    pub fn new(personas: Arc<dyn PersonaStore>) -> Self {
        Self { personas }
    }

    /// Register a persona awaiting validation.
    pub async fn register(&self, name: &str, profile: serde_json::Value) -> Result<Persona> {
        if name.trim().is_empty() {
            return Err(ArenaError::Validation("persona name must not be empty".to_string()));
        }
        Ok(self.personas.insert(Persona::new(name, profile)).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Persona> {
        self.personas
            .get(id)
            .await?
            .ok_or_else(|| ArenaError::persona_not_found(id))
    }

    /// Apply a reviewer decision.
    #[instrument(skip(self, note), fields(persona_id = %id, decision = %decision))]
    pub async fn validate(
        &self,
        id: Uuid,
        decision: ValidationDecision,
        note: Option<String>,
    ) -> Result<Persona> {
        let persona = self.get(id).await?;
        let Some(next) = next_validation_status(persona.validation_status, decision) else {
            return Err(ArenaError::invalid_status(
                persona.validation_status,
                format!("cannot {decision} persona {}", persona.name),
            ));
        };

        let update = PersonaValidationUpdate {
            status: next,
            note,
            validated_at: Utc::now(),
        };
        let updated = conflict_as_miss(
            self.personas
                .conditional_set_validation(id, persona.validation_status, update)
                .await,
        )?
        .ok_or_else(|| ArenaError::ConcurrentModification {
            entity: "persona",
            id,
            expected: Some(persona.validation_status.to_string()),
        })?;

        obs::emit_persona_validated(&updated.id.to_string(), updated.validation_status.as_str());
        Ok(updated)
    }
}
