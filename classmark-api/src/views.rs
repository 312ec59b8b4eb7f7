//! Aggregated views served through the view cache.
//!
//! A view kind names a [`ViewComputer`] and the subject kind it is keyed by.
//! The default registry tallies attendance and fee records per student and
//! per section straight from the record repository.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use classmark_core::{ClassmarkResult, Payload, SubjectKind, ViewKey};
use classmark_storage::{RecordRepository, ViewComputer};
use serde_json::{json, Value};

pub const STUDENT_ATTENDANCE: &str = "student-attendance";
pub const SECTION_ATTENDANCE: &str = "section-attendance";
pub const STUDENT_FEES: &str = "student-fees";

// ============================================================================
// REGISTRY
// ============================================================================

#[derive(Clone)]
pub struct ViewDefinition {
    pub subject_kind: SubjectKind,
    pub computer: Arc<dyn ViewComputer>,
}

/// View kinds known to the API.
#[derive(Clone, Default)]
pub struct ViewRegistry {
    views: HashMap<String, ViewDefinition>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        view_kind: impl Into<String>,
        subject_kind: SubjectKind,
        computer: Arc<dyn ViewComputer>,
    ) -> Self {
        self.views.insert(
            view_kind.into(),
            ViewDefinition {
                subject_kind,
                computer,
            },
        );
        self
    }

    pub fn get(&self, view_kind: &str) -> Option<&ViewDefinition> {
        self.views.get(view_kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.views.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Attendance and fee summaries for students and sections.
    pub fn school_defaults(repository: Arc<dyn RecordRepository>) -> Self {
        let student_attendance =
            RecordTallyComputer::new(Arc::clone(&repository), "attendance", "student_id")
                .group_by("status");
        let section_attendance =
            RecordTallyComputer::new(Arc::clone(&repository), "attendance", "section_id")
                .group_by("status");
        let student_fees = RecordTallyComputer::new(repository, "fee_payment", "student_id")
            .group_by("status")
            .sum_of("amount");

        Self::new()
            .register(STUDENT_ATTENDANCE, SubjectKind::student(), Arc::new(student_attendance))
            .register(SECTION_ATTENDANCE, SubjectKind::section(), Arc::new(section_attendance))
            .register(STUDENT_FEES, SubjectKind::student(), Arc::new(student_fees))
    }
}

impl std::fmt::Debug for ViewRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// ============================================================================
// TALLY COMPUTER
// ============================================================================

/// Counts the records of one entity type that reference the view subject.
///
/// Records match when `reference_field` equals the subject id, or is an
/// array containing it. A scoped key additionally requires `scope_field`
/// to equal the scope.
pub struct RecordTallyComputer {
    repository: Arc<dyn RecordRepository>,
    entity_type: String,
    reference_field: String,
    scope_field: String,
    group_field: Option<String>,
    sum_field: Option<String>,
}

impl RecordTallyComputer {
    pub fn new(
        repository: Arc<dyn RecordRepository>,
        entity_type: impl Into<String>,
        reference_field: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            entity_type: entity_type.into(),
            reference_field: reference_field.into(),
            scope_field: "date".to_string(),
            group_field: None,
            sum_field: None,
        }
    }

    pub fn with_scope_field(mut self, field: impl Into<String>) -> Self {
        self.scope_field = field.into();
        self
    }

    /// Break the total down by the values of `field`.
    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_field = Some(field.into());
        self
    }

    /// Also add up the numeric values of `field`.
    pub fn sum_of(mut self, field: impl Into<String>) -> Self {
        self.sum_field = Some(field.into());
        self
    }

    fn references(&self, record: &Payload, subject_id: &str) -> bool {
        match record.get(&self.reference_field) {
            Some(Value::String(id)) => id == subject_id,
            Some(Value::Array(ids)) => ids.iter().any(|id| id.as_str() == Some(subject_id)),
            _ => false,
        }
    }

    fn in_scope(&self, record: &Payload, key: &ViewKey) -> bool {
        match &key.scope {
            Some(scope) => {
                record.get(&self.scope_field).and_then(Value::as_str) == Some(scope.as_str())
            }
            None => true,
        }
    }
}

#[async_trait]
impl ViewComputer for RecordTallyComputer {
    async fn compute(&self, key: &ViewKey) -> ClassmarkResult<Value> {
        let records = self.repository.list(key.tenant_id, &self.entity_type).await?;

        let mut total = 0u64;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut sum = 0f64;
        for record in records
            .iter()
            .filter(|r| self.references(r, &key.subject.id) && self.in_scope(r, key))
        {
            total += 1;
            if let Some(field) = &self.group_field {
                let group = record
                    .get(field)
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                *counts.entry(group.to_string()).or_default() += 1;
            }
            if let Some(field) = &self.sum_field {
                sum += record.get(field).and_then(Value::as_f64).unwrap_or(0.0);
            }
        }

        let mut view = json!({
            "view_kind": key.view_kind,
            "subject_kind": key.subject.kind,
            "subject_id": key.subject.id,
            "scope": key.scope.as_ref().map(|s| s.as_str()),
            "entity": self.entity_type,
            "total": total,
        });
        if self.group_field.is_some() {
            view["counts"] = json!(counts);
        }
        if self.sum_field.is_some() {
            view["sum"] = json!(sum);
        }
        Ok(view)
    }
}
