//! Audit queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vibe_core::TenantId;

use crate::entry::{AuditEntry, AuditOutcome};

/// Filter for querying audit entries. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub outcome: Option<AuditOutcome>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl AuditFilter {
    pub fn for_tenant(tenant: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant),
            ..Default::default()
        }
    }

    /// Whether `entry` passes every set criterion (limit/offset ignored).
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if self.tenant_id.is_some_and(|t| t != entry.tenant_id) {
            return false;
        }
        if self
            .database
            .as_deref()
            .is_some_and(|db| db != entry.database)
        {
            return false;
        }
        if self
            .operation
            .as_deref()
            .is_some_and(|op| op != entry.operation)
        {
            return false;
        }
        if self.outcome.is_some_and(|o| o != entry.outcome) {
            return false;
        }
        if self.start_time.is_some_and(|start| entry.occurred_at < start) {
            return false;
        }
        if self.end_time.is_some_and(|end| entry.occurred_at > end) {
            return false;
        }
        true
    }

    /// Filter, sort newest first, then apply offset and limit.
    pub fn apply<I>(&self, entries: I) -> Vec<AuditEntry>
    where
        I: IntoIterator<Item = AuditEntry>,
    {
        let mut results: Vec<AuditEntry> = entries.into_iter().filter(|e| self.matches(e)).collect();
        results.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        results
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(tenant: TenantId, db: &str, outcome: AuditOutcome, age_secs: i64) -> AuditEntry {
        let mut e = AuditEntry::builder(tenant, "select", db)
            .outcome(outcome)
            .build();
        e.occurred_at = Utc::now() - Duration::seconds(age_secs);
        e
    }

    #[test]
    fn filters_and_orders_newest_first() {
        let a = TenantId::new();
        let b = TenantId::new();
        let entries = vec![
            entry(a, "db1", AuditOutcome::Success, 30),
            entry(a, "db1", AuditOutcome::Failure, 20),
            entry(a, "db2", AuditOutcome::Success, 10),
            entry(b, "db1", AuditOutcome::Success, 5),
        ];

        let filter = AuditFilter {
            tenant_id: Some(a),
            database: Some("db1".into()),
            ..Default::default()
        };
        let results = filter.apply(entries.clone());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome, AuditOutcome::Failure);

        let page = AuditFilter {
            tenant_id: Some(a),
            offset: Some(1),
            limit: Some(1),
            ..Default::default()
        }
        .apply(entries.clone());
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].outcome, AuditOutcome::Failure);

        let recent = AuditFilter {
            start_time: Some(Utc::now() - Duration::seconds(15)),
            ..Default::default()
        }
        .apply(entries);
        assert_eq!(recent.len(), 2);
    }
}
