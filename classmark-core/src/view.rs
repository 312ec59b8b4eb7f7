//! Cache keys and invalidation events for aggregated views.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::identity::TenantId;
use crate::wire::InvalidateCacheRequest;

/// Kind of domain subject a view is computed for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectKind(String);

impl SubjectKind {
    pub const STUDENT: &'static str = "student";
    pub const SECTION: &'static str = "section";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn student() -> Self {
        Self::new(Self::STUDENT)
    }

    pub fn section() -> Self {
        Self::new(Self::SECTION)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectRef {
    pub kind: SubjectKind,
    pub id: String,
}

impl SubjectRef {
    pub fn new(kind: SubjectKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }

    pub fn student(id: impl Into<String>) -> Self {
        Self::new(SubjectKind::student(), id)
    }

    pub fn section(id: impl Into<String>) -> Self {
        Self::new(SubjectKind::section(), id)
    }
}

/// Narrowing scope of a view, typically a date or term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cache key of an aggregated view.
///
/// The tenant is always part of the key. Entries never leak across schools.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewKey {
    pub tenant_id: TenantId,
    pub view_kind: String,
    pub subject: SubjectRef,
    pub scope: Option<ScopeKey>,
    /// Canonical `k=v&k=v` rendering of extra view parameters.
    pub params: Option<String>,
}

impl ViewKey {
    pub fn new(tenant_id: TenantId, view_kind: impl Into<String>, subject: SubjectRef) -> Self {
        Self {
            tenant_id,
            view_kind: view_kind.into(),
            subject,
            scope: None,
            params: None,
        }
    }

    pub fn with_scope(mut self, scope: ScopeKey) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Attach parameters. Ordering is canonicalised so equal parameter sets
    /// produce equal keys.
    pub fn with_params(mut self, params: &BTreeMap<String, String>) -> Self {
        if params.is_empty() {
            self.params = None;
            return self;
        }
        let rendered = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        self.params = Some(rendered);
        self
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.tenant_id, self.view_kind, self.subject.kind, self.subject.id
        )?;
        if let Some(scope) = &self.scope {
            write!(f, "@{}", scope.as_str())?;
        }
        if let Some(params) = &self.params {
            write!(f, "?{params}")?;
        }
        Ok(())
    }
}

/// Domain change notification that should drop derived views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub subject_kind: SubjectKind,
    pub subject_ids: Vec<String>,
    /// When set, only entries with this scope (or no scope) are affected.
    pub scope_key: Option<ScopeKey>,
}

impl InvalidationEvent {
    pub fn new(subject_kind: SubjectKind, subject_ids: Vec<String>) -> Self {
        Self {
            subject_kind,
            subject_ids,
            scope_key: None,
        }
    }

    pub fn students<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(SubjectKind::student(), ids.into_iter().map(Into::into).collect())
    }

    pub fn section(id: impl Into<String>) -> Self {
        Self::new(SubjectKind::section(), vec![id.into()])
    }

    pub fn with_scope(mut self, scope: ScopeKey) -> Self {
        self.scope_key = Some(scope);
        self
    }

    /// Whether a cached entry under `key` is derived from this event's subjects.
    pub fn matches(&self, key: &ViewKey) -> bool {
        if key.subject.kind != self.subject_kind {
            return false;
        }
        if !self.subject_ids.iter().any(|id| *id == key.subject.id) {
            return false;
        }
        match (&self.scope_key, &key.scope) {
            (Some(event_scope), Some(entry_scope)) => event_scope == entry_scope,
            _ => true,
        }
    }
}

impl InvalidateCacheRequest {
    /// Translate the HTTP body into domain events.
    ///
    /// Student ids become one student event. A section id becomes a section
    /// event. `date`, when present, scopes both.
    pub fn to_events(&self) -> Vec<InvalidationEvent> {
        let scope = self.date.as_ref().map(ScopeKey::new);
        let mut students: Vec<String> = Vec::new();
        if let Some(id) = &self.student_id {
            students.push(id.clone());
        }
        if let Some(ids) = &self.student_ids {
            for id in ids {
                if !students.contains(id) {
                    students.push(id.clone());
                }
            }
        }

        let mut events = Vec::new();
        if !students.is_empty() {
            events.push(InvalidationEvent::students(students));
        }
        if let Some(section) = &self.section_id {
            events.push(InvalidationEvent::section(section.clone()));
        }
        match scope {
            Some(scope) => events
                .into_iter()
                .map(|e| e.with_scope(scope.clone()))
                .collect(),
            None => events,
        }
    }
}
