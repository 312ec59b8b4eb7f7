//! Domain validation hook for pushed mutations.

use std::collections::HashMap;

use classmark_core::{MutationAction, PushItem, ValidationError, RECORD_ID_FIELD};
use serde_json::Value;

/// Validates a mutation before it is applied.
///
/// A rejection is terminal for the mutation. The domain layer plugs its own
/// rules in here; the sync core stays schema-agnostic.
pub trait MutationValidator: Send + Sync {
    fn validate(&self, item: &PushItem) -> Result<(), ValidationError>;
}

/// Accepts everything except an UPDATE without a target id.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl MutationValidator for AcceptAll {
    fn validate(&self, item: &PushItem) -> Result<(), ValidationError> {
        require_update_target(item)
    }
}

/// Requires named fields to be present and non-null per entity type.
#[derive(Debug, Clone, Default)]
pub struct RequiredFields {
    rules: HashMap<String, Vec<String>>,
    reject_unknown: bool,
}

impl RequiredFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require<I, S>(mut self, entity_type: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .entry(entity_type.into())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }

    /// Reject entity types that have no rules.
    pub fn reject_unknown_entities(mut self) -> Self {
        self.reject_unknown = true;
        self
    }
}

impl MutationValidator for RequiredFields {
    fn validate(&self, item: &PushItem) -> Result<(), ValidationError> {
        require_update_target(item)?;

        let Some(fields) = self.rules.get(&item.entity) else {
            if self.reject_unknown {
                return Err(ValidationError::UnknownEntityType {
                    entity_type: item.entity.clone(),
                });
            }
            return Ok(());
        };

        // UPDATEs are partial; only CREATEs must carry every field.
        if item.action == MutationAction::Update {
            return Ok(());
        }
        for field in fields {
            match item.data.get(field) {
                None | Some(Value::Null) => {
                    return Err(ValidationError::RequiredFieldMissing {
                        field: field.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

fn require_update_target(item: &PushItem) -> Result<(), ValidationError> {
    if item.action != MutationAction::Update {
        return Ok(());
    }
    match item.data.get(RECORD_ID_FIELD).and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(()),
        _ => Err(ValidationError::RequiredFieldMissing {
            field: RECORD_ID_FIELD.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classmark_core::{Payload, TempId};
    use serde_json::json;

    fn item(entity: &str, action: MutationAction, data: Value) -> PushItem {
        PushItem {
            temp_id: TempId::generate(),
            entity: entity.to_string(),
            action,
            data: data.as_object().cloned().unwrap_or_else(Payload::new),
        }
    }

    #[test]
    fn test_update_requires_target_id() {
        let err = AcceptAll
            .validate(&item("student", MutationAction::Update, json!({ "name": "x" })))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::RequiredFieldMissing { field: "id".to_string() }
        );
        assert!(AcceptAll
            .validate(&item("student", MutationAction::Update, json!({ "id": "s-1" })))
            .is_ok());
    }

    #[test]
    fn test_required_fields_on_create() {
        let validator = RequiredFields::new().require("attendance-record", ["student_id", "status"]);

        let missing = item(
            "attendance-record",
            MutationAction::Create,
            json!({ "student_id": "42", "status": null }),
        );
        assert!(matches!(
            validator.validate(&missing),
            Err(ValidationError::RequiredFieldMissing { ref field }) if field == "status"
        ));

        let ok = item(
            "attendance-record",
            MutationAction::Create,
            json!({ "student_id": "42", "status": "present" }),
        );
        assert!(validator.validate(&ok).is_ok());
    }

    #[test]
    fn test_unknown_entities() {
        let lenient = RequiredFields::new();
        let strict = RequiredFields::new().reject_unknown_entities();
        let it = item("library-loan", MutationAction::Create, json!({}));

        assert!(lenient.validate(&it).is_ok());
        assert!(matches!(
            strict.validate(&it),
            Err(ValidationError::UnknownEntityType { .. })
        ));
    }
}
