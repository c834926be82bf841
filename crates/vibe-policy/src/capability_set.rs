//! The effective capabilities of a tenant on one schema or table.

use serde::Serialize;
use std::collections::BTreeSet;

use vibe_core::{
    Capability, ColumnMask, PermissionLevel, PolicyCommand, PolicyKind, RowPolicy, TenantId,
};

use crate::error::PolicyError;

/// Where a capability set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "level")]
pub enum CapabilitySource {
    /// No permission row applies.
    None,
    Schema(PermissionLevel),
    Table,
    /// Implicit read access to `information_schema`.
    InformationSchema,
}

/// A row policy as attached to a capability set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyClause {
    pub name: String,
    pub command: PolicyCommand,
    pub kind: PolicyKind,
    pub using: Option<String>,
    pub with_check: Option<String>,
}

impl From<&RowPolicy> for PolicyClause {
    fn from(policy: &RowPolicy) -> Self {
        Self {
            name: policy.policy_name.clone(),
            command: policy.command,
            kind: policy.kind,
            using: policy.using_expression.clone(),
            with_check: policy.with_check_expression.clone(),
        }
    }
}

/// Combined row filter for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    /// No policy applies.
    Unrestricted,
    /// Policies apply but none is permissive: no row qualifies.
    DenyAll,
    /// Boolean SQL expression; may still contain `:tenant`.
    Expression(String),
}

/// Resolved, effective capabilities for (tenant, database, schema, table?).
#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySet {
    pub tenant: TenantId,
    pub database: String,
    pub schema: String,
    pub table: Option<String>,
    pub source: CapabilitySource,
    capabilities: BTreeSet<Capability>,
    columns: Option<ColumnMask>,
    policies: Vec<PolicyClause>,
}

impl CapabilitySet {
    /// The deny-by-default set.
    pub fn empty(tenant: TenantId, database: &str, schema: &str, table: Option<&str>) -> Self {
        Self {
            tenant,
            database: database.to_string(),
            schema: schema.to_string(),
            table: table.map(str::to_string),
            source: CapabilitySource::None,
            capabilities: BTreeSet::new(),
            columns: None,
            policies: Vec::new(),
        }
    }

    pub fn with_grants(
        mut self,
        source: CapabilitySource,
        capabilities: BTreeSet<Capability>,
        columns: Option<ColumnMask>,
    ) -> Self {
        self.source = source;
        self.capabilities = capabilities;
        self.columns = columns.filter(|m| !m.is_empty());
        self
    }

    pub fn with_policies(mut self, mut policies: Vec<PolicyClause>) -> Self {
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        self.policies = policies;
        self
    }

    /// `schema.table` or `schema`, for messages.
    pub fn object_name(&self) -> String {
        match &self.table {
            Some(table) => format!("{}.{}", self.schema, table),
            None => self.schema.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Fail with `InsufficientPermission` naming `capability` if absent.
    pub fn require(&self, capability: Capability) -> Result<(), PolicyError> {
        if self.allows(capability) {
            Ok(())
        } else {
            Err(PolicyError::InsufficientPermission {
                capability,
                object: self.object_name(),
            })
        }
    }

    pub fn column_mask(&self) -> Option<&ColumnMask> {
        self.columns.as_ref()
    }

    pub fn policies(&self) -> &[PolicyClause] {
        &self.policies
    }

    pub fn has_policies(&self) -> bool {
        !self.policies.is_empty()
    }

    /// Keep only the requested columns readable under the column mask.
    /// Without a mask every requested column is kept.
    pub fn readable_columns<'a>(&self, requested: &'a [String]) -> Vec<&'a str> {
        requested
            .iter()
            .map(String::as_str)
            .filter(|c| self.column_allowed(c, Capability::Select))
            .collect()
    }

    /// Columns readable under the mask, if there is one.
    pub fn masked_select_columns(&self) -> Option<Vec<&str>> {
        self.columns
            .as_ref()
            .map(|m| m.columns_with(Capability::Select))
    }

    /// Every column of a write payload must be allowed for `capability`.
    pub fn check_write_columns<'a, I>(
        &self,
        columns: I,
        capability: Capability,
    ) -> Result<(), PolicyError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for column in columns {
            if !self.column_allowed(column, capability) {
                return Err(PolicyError::ColumnPermissionDenied {
                    column: column.to_string(),
                    object: self.object_name(),
                });
            }
        }
        Ok(())
    }

    fn column_allowed(&self, column: &str, capability: Capability) -> bool {
        match &self.columns {
            Some(mask) => mask.allows(column, capability),
            None => true,
        }
    }

    fn applicable(&self, command: PolicyCommand) -> impl Iterator<Item = &PolicyClause> {
        self.policies.iter().filter(move |p| p.command.covers(command))
    }

    /// Filter on existing rows (USING side) for reads, updates and deletes.
    pub fn row_filter(&self, command: PolicyCommand) -> RowFilter {
        combine(self.applicable(command), |p| p.using.as_deref())
    }

    /// Filter that written rows must satisfy (WITH CHECK side). Falls back
    /// to USING for UPDATE and ALL policies without a WITH CHECK.
    pub fn check_filter(&self, command: PolicyCommand) -> RowFilter {
        combine(self.applicable(command), |p| {
            p.with_check.as_deref().or(match p.command {
                PolicyCommand::Update | PolicyCommand::All => p.using.as_deref(),
                _ => None,
            })
        })
    }
}

/// PERMISSIVE expressions are OR-combined; the result is AND-combined with
/// every RESTRICTIVE expression. A policy without an expression for the
/// requested side contributes `TRUE`.
fn combine<'a, I, F>(clauses: I, side: F) -> RowFilter
where
    I: Iterator<Item = &'a PolicyClause>,
    F: Fn(&'a PolicyClause) -> Option<&'a str>,
{
    let mut any = false;
    let mut permissive = Vec::new();
    let mut restrictive = Vec::new();
    for clause in clauses {
        any = true;
        let expr = side(clause).map(str::trim).filter(|e| !e.is_empty());
        match clause.kind {
            PolicyKind::Permissive => permissive.push(expr),
            PolicyKind::Restrictive => {
                if let Some(expr) = expr {
                    restrictive.push(expr);
                }
            }
        }
    }

    if !any {
        return RowFilter::Unrestricted;
    }
    if permissive.is_empty() {
        return RowFilter::DenyAll;
    }

    let mut parts = Vec::new();
    // A permissive policy with no expression admits every row.
    if permissive.iter().all(Option::is_some) {
        let ors: Vec<String> = permissive
            .iter()
            .flatten()
            .map(|e| format!("({e})"))
            .collect();
        if ors.len() == 1 {
            parts.push(ors[0].clone());
        } else {
            parts.push(format!("({})", ors.join(" OR ")));
        }
    }
    parts.extend(restrictive.iter().map(|e| format!("({e})")));

    if parts.is_empty() {
        RowFilter::Unrestricted
    } else {
        RowFilter::Expression(parts.join(" AND "))
    }
}
