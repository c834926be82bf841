//! The statement guard: validates an operation against a tenant's
//! capabilities and produces the exact SQL the engine will run.

use tracing::{debug, warn};

use vibe_core::params::convert_params;
use vibe_core::{Capability, Identifier, PolicyCommand, SqlParam, TenantId};
use vibe_policy::{CapabilitySet, PermissionResolver, PolicyError, RowFilter};

use crate::analyzer::{AnalyzedStatement, RelationRef, SqlAnalyzer, strip_comments};
use crate::builder::{self, ParamList, column_list, table_ref, where_clause};
use crate::deny;
use crate::error::GuardError;
use crate::operation::{
    AlterAction, AlterTableOp, ColumnSpec, CreateSchemaOp, CreateTableOp, DeleteOp, DropTableOp,
    Filter, InsertOp, Operation, RawSql, SelectOp, UpdateOp,
};
use crate::validated::{OutputShape, RowCheck, StatementKind, ValidatedOperation};
use crate::weave;

/// Validates operations. Cheap to clone; holds no per-request state.
#[derive(Clone)]
pub struct StatementGuard {
    resolver: PermissionResolver,
    analyzer: SqlAnalyzer,
}

/// Fields shared by every validated statement of one request.
struct Draft<'a> {
    tenant: TenantId,
    database: &'a str,
    kind: StatementKind,
}

impl Draft<'_> {
    fn finish(
        &self,
        sql: String,
        params: Vec<SqlParam>,
        output: OutputShape,
        row_check: Option<RowCheck>,
        objects: Vec<String>,
        policies_applied: usize,
    ) -> ValidatedOperation {
        ValidatedOperation {
            tenant: self.tenant,
            database: self.database.to_string(),
            kind: self.kind,
            sql,
            params,
            output,
            row_check,
            objects,
            dangerous: self.kind.is_dangerous(),
            policies_applied,
        }
    }
}

impl StatementGuard {
    pub fn new(resolver: PermissionResolver) -> Self {
        Self {
            resolver,
            analyzer: SqlAnalyzer::new(),
        }
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    /// Validate `operation` for `tenant` against `database`.
    pub async fn validate(
        &self,
        tenant: TenantId,
        database: &str,
        operation: &Operation,
    ) -> Result<ValidatedOperation, GuardError> {
        let result = match self.resolver.check_database(database) {
            Ok(()) => self.validate_inner(tenant, database, operation).await,
            Err(e) => Err(e.into()),
        };
        match &result {
            Ok(validated) => debug!(
                tenant = %tenant,
                database = %database,
                operation = operation.name(),
                kind = validated.kind.as_str(),
                policies = validated.policies_applied,
                "operation validated"
            ),
            Err(e) => warn!(
                tenant = %tenant,
                database = %database,
                operation = operation.name(),
                error = %e,
                "operation rejected"
            ),
        }
        result
    }

    async fn validate_inner(
        &self,
        tenant: TenantId,
        database: &str,
        operation: &Operation,
    ) -> Result<ValidatedOperation, GuardError> {
        match operation {
            Operation::RawSql(raw) => self.validate_raw(tenant, database, raw).await,
            Operation::Select(op) => self.validate_select(tenant, database, op).await,
            Operation::Insert(op) => self.validate_insert(tenant, database, op).await,
            Operation::Update(op) => self.validate_update(tenant, database, op).await,
            Operation::Delete(op) => self.validate_delete(tenant, database, op).await,
            Operation::CreateTable(op) => self.validate_create_table(tenant, database, op).await,
            Operation::AlterTable(op) => self.validate_alter_table(tenant, database, op).await,
            Operation::DropTable(op) => self.validate_drop_table(tenant, database, op).await,
            Operation::CreateSchema(op) => self.validate_create_schema(tenant, database, op).await,
        }
    }

    async fn table_capabilities(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<CapabilitySet, GuardError> {
        Ok(self
            .resolver
            .resolve_capabilities(tenant, database, schema, Some(table))
            .await?)
    }

    // ----- raw SQL ---------------------------------------------------------

    async fn validate_raw(
        &self,
        tenant: TenantId,
        database: &str,
        raw: &RawSql,
    ) -> Result<ValidatedOperation, GuardError> {
        // The deny-list sees the text before parsing, so a forbidden keyword
        // wins over any parse or classification error.
        let tokens = self.analyzer.tokenize(&raw.sql)?;
        deny::check_deny_list(&strip_comments(&tokens))?;
        let mut analyzed = self.analyzer.analyze(&raw.sql)?;
        deny::check_reserved_references(&analyzed.tokens, self.resolver.reserved())?;
        if raw.read_only {
            deny::check_read_only(&analyzed.tokens)?;
            if analyzed.kind != StatementKind::Select {
                return Err(GuardError::forbidden(format!(
                    "{} is not allowed in a read-only request",
                    analyzed.kind.as_str()
                )));
            }
        }

        let params = convert_params(&raw.params)?;
        if analyzed.max_placeholder > params.len() {
            return Err(GuardError::invalid(format!(
                "statement uses ${} but {} parameter(s) were supplied",
                analyzed.max_placeholder,
                params.len()
            )));
        }
        for relation in analyzed.distinct_relations() {
            check_same_database(relation, database)?;
        }

        let draft = Draft {
            tenant,
            database,
            kind: analyzed.kind,
        };

        if analyzed.kind == StatementKind::CreateSchema {
            let schema = analyzed
                .schema
                .clone()
                .ok_or_else(|| GuardError::invalid("CREATE SCHEMA without a name"))?;
            let schema = self.require_create_schema(tenant, database, &schema).await?;
            return Ok(draft.finish(
                raw.sql.clone(),
                params,
                OutputShape::RowCount,
                None,
                vec![schema.to_string()],
                0,
            ));
        }

        let mut params = ParamList::with_params(params);
        let mut objects = Vec::new();
        let mut checked: Vec<(RelationRef, CapabilitySet)> = Vec::new();
        for (relation, capability) in requirements(&analyzed) {
            let caps = self
                .table_capabilities(tenant, database, &relation.schema, &relation.table)
                .await?;
            caps.require(capability)?;
            if caps.column_mask().is_some() {
                return Err(GuardError::forbidden(format!(
                    "{} has column-level permissions; use a structured operation",
                    caps.object_name()
                )));
            }
            if !objects.contains(&caps.object_name()) {
                objects.push(caps.object_name());
            }
            if caps.has_policies() && !checked.iter().any(|(r, _)| *r == relation) {
                checked.push((relation, caps));
            }
        }

        let mut target_filters = Vec::new();
        for (relation, caps) in checked.iter().filter(|(r, _)| analyzed.targets.contains(r)) {
            let Some(command) = self.raw_target_command(&analyzed, caps)? else {
                continue;
            };
            if let Some(expr) =
                weave::filter_expression(&self.analyzer, &caps.row_filter(command), tenant, &mut params)?
            {
                target_filters.push((relation.clone(), expr));
            }
        }

        let reads_rows = source_capability(analyzed.kind, analyzed.create_as) == Capability::Select;
        let sources = analyzed.sources();
        let mut read_filters = Vec::new();
        for (relation, caps) in checked.iter().filter(|(r, _)| reads_rows && sources.contains(&r)) {
            if let Some(expr) = weave::filter_expression(
                &self.analyzer,
                &caps.row_filter(PolicyCommand::Select),
                tenant,
                &mut params,
            )? {
                read_filters.push((relation.clone(), expr));
            }
        }

        let policies_applied = target_filters.len() + read_filters.len();
        let sql = if policies_applied == 0 {
            raw.sql.clone()
        } else {
            let rewritten =
                weave::rewrite_reads(&self.analyzer, &mut analyzed.statement, &read_filters)?;
            for (_, expr) in target_filters {
                weave::weave_into_target(&mut analyzed.statement, expr)?;
            }
            debug!(
                tenant = %tenant,
                database = %database,
                reads = rewritten,
                "row policies applied to raw statement"
            );
            analyzed.statement.to_string()
        };

        let output = if analyzed.returns_rows {
            OutputShape::Rows
        } else {
            OutputShape::RowCount
        };
        Ok(draft.finish(
            sql,
            params.into_inner(),
            output,
            None,
            objects,
            policies_applied,
        ))
    }

    /// Policy command whose USING side applies to a raw statement's target.
    /// Writes whose new rows would need a WITH CHECK are refused: raw SQL
    /// cannot be rewritten to verify them.
    fn raw_target_command(
        &self,
        analyzed: &AnalyzedStatement,
        caps: &CapabilitySet,
    ) -> Result<Option<PolicyCommand>, GuardError> {
        let refuse = |what: &str| {
            Err(GuardError::forbidden(format!(
                "{what} on {} cannot enforce its row policies; use a structured operation",
                caps.object_name()
            )))
        };
        match analyzed.kind {
            StatementKind::Insert => {
                if caps.check_filter(PolicyCommand::Insert) != RowFilter::Unrestricted
                    || (analyzed.upsert
                        && caps.check_filter(PolicyCommand::Update) != RowFilter::Unrestricted)
                {
                    return refuse("raw INSERT");
                }
                Ok(None)
            }
            StatementKind::Update => {
                if caps.check_filter(PolicyCommand::Update) != RowFilter::Unrestricted {
                    return refuse("raw UPDATE");
                }
                Ok(Some(PolicyCommand::Update))
            }
            StatementKind::Delete => Ok(Some(PolicyCommand::Delete)),
            StatementKind::Truncate => refuse("TRUNCATE"),
            _ => Ok(None),
        }
    }

    async fn require_create_schema(
        &self,
        tenant: TenantId,
        database: &str,
        schema: &str,
    ) -> Result<Identifier, GuardError> {
        let schema = self.resolver.identifier(schema)?;
        let lowered = schema.as_str().to_ascii_lowercase();
        if lowered.starts_with("pg_") || lowered == vibe_policy::INFORMATION_SCHEMA {
            return Err(GuardError::forbidden(format!(
                "schema name '{schema}' is reserved"
            )));
        }
        let ddl = self
            .resolver
            .database_ddl_capabilities(tenant, database)
            .await?;
        if !ddl.contains(&Capability::CreateSchema) {
            return Err(PolicyError::InsufficientPermission {
                capability: Capability::CreateSchema,
                object: database.to_string(),
            }
            .into());
        }
        Ok(schema)
    }

    // ----- structured DML --------------------------------------------------

    async fn validate_select(
        &self,
        tenant: TenantId,
        database: &str,
        op: &SelectOp,
    ) -> Result<ValidatedOperation, GuardError> {
        let schema = self.resolver.identifier(&op.schema)?;
        let table = self.resolver.identifier(&op.table)?;
        let caps = self
            .table_capabilities(tenant, database, schema.as_str(), table.as_str())
            .await?;
        caps.require(Capability::Select)?;

        let projection = self.projection(&caps, op.columns.as_deref())?;
        let mut params = ParamList::new();
        let mut predicates = self.render_filters(&caps, &op.filters, &mut params)?;
        let mut policies_applied = 0;
        if let Some(expr) = weave::filter_expression(
            &self.analyzer,
            &caps.row_filter(PolicyCommand::Select),
            tenant,
            &mut params,
        )? {
            predicates.push(expr.to_string());
            policies_applied += 1;
        }

        let distinct = if op.distinct { "DISTINCT " } else { "" };
        let mut sql = format!("SELECT {distinct}{projection} FROM {}", table_ref(&schema, &table));
        if let Some(clause) = where_clause(&predicates) {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }

        let mut order = Vec::new();
        for o in &op.order_by {
            let column = self.resolver.identifier(&o.column)?;
            require_readable(&caps, &column)?;
            order.push((column, o));
        }
        if let Some(clause) = builder::order_by_clause(&order) {
            sql.push_str(" ORDER BY ");
            sql.push_str(&clause);
        }
        if let Some(limit) = op.limit {
            let placeholder = params.push(SqlParam::Int(to_i64(limit, "limit")?));
            sql.push_str(&format!(" LIMIT {placeholder}"));
        }
        if let Some(offset) = op.offset {
            let placeholder = params.push(SqlParam::Int(to_i64(offset, "offset")?));
            sql.push_str(&format!(" OFFSET {placeholder}"));
        }

        let draft = Draft {
            tenant,
            database,
            kind: StatementKind::Select,
        };
        Ok(draft.finish(
            sql,
            params.into_inner(),
            OutputShape::Rows,
            None,
            vec![caps.object_name()],
            policies_applied,
        ))
    }

    async fn validate_insert(
        &self,
        tenant: TenantId,
        database: &str,
        op: &InsertOp,
    ) -> Result<ValidatedOperation, GuardError> {
        let schema = self.resolver.identifier(&op.schema)?;
        let table = self.resolver.identifier(&op.table)?;
        let caps = self
            .table_capabilities(tenant, database, schema.as_str(), table.as_str())
            .await?;
        caps.require(Capability::Insert)?;

        if op.rows.is_empty() {
            return Err(GuardError::invalid("insert needs at least one row"));
        }
        let mut columns: Vec<Identifier> = Vec::new();
        for row in &op.rows {
            for key in row.keys() {
                let column = self.resolver.identifier(key)?;
                if !columns.contains(&column) {
                    columns.push(column);
                }
            }
        }
        if columns.is_empty() {
            return Err(GuardError::invalid("insert rows have no columns"));
        }
        caps.check_write_columns(columns.iter().map(Identifier::as_str), Capability::Insert)?;

        let mut params = ParamList::new();
        let mut tuples = Vec::with_capacity(op.rows.len());
        for row in &op.rows {
            let mut values = Vec::with_capacity(columns.len());
            for column in &columns {
                values.push(match row.get(column.as_str()) {
                    Some(value) => params.push(SqlParam::from_json(value)),
                    None => "DEFAULT".to_string(),
                });
            }
            tuples.push(format!("({})", values.join(", ")));
        }
        let write = format!(
            "INSERT INTO {} ({}) VALUES {}",
            table_ref(&schema, &table),
            column_list(&columns),
            tuples.join(", ")
        );
        let returning = self.returning(&caps, op.returning.as_deref())?;
        let draft = Draft {
            tenant,
            database,
            kind: StatementKind::Insert,
        };
        self.finish_write(
            &draft,
            &caps,
            write,
            returning,
            &caps.check_filter(PolicyCommand::Insert),
            params,
            0,
        )
    }

    async fn validate_update(
        &self,
        tenant: TenantId,
        database: &str,
        op: &UpdateOp,
    ) -> Result<ValidatedOperation, GuardError> {
        let schema = self.resolver.identifier(&op.schema)?;
        let table = self.resolver.identifier(&op.table)?;
        let caps = self
            .table_capabilities(tenant, database, schema.as_str(), table.as_str())
            .await?;
        caps.require(Capability::Update)?;

        if op.set.is_empty() {
            return Err(GuardError::invalid("update needs at least one column to set"));
        }
        if op.filters.is_empty() {
            return Err(GuardError::invalid("update requires at least one filter"));
        }
        let mut params = ParamList::new();
        let mut assignments = Vec::with_capacity(op.set.len());
        let mut written = Vec::with_capacity(op.set.len());
        for (key, value) in &op.set {
            let column = self.resolver.identifier(key)?;
            assignments.push(format!(
                "{} = {}",
                column.quoted(),
                params.push(SqlParam::from_json(value))
            ));
            written.push(column);
        }
        caps.check_write_columns(written.iter().map(Identifier::as_str), Capability::Update)?;

        let mut predicates = self.render_filters(&caps, &op.filters, &mut params)?;
        let mut policies_applied = 0;
        if let Some(expr) = weave::filter_expression(
            &self.analyzer,
            &caps.row_filter(PolicyCommand::Update),
            tenant,
            &mut params,
        )? {
            predicates.push(expr.to_string());
            policies_applied += 1;
        }
        let mut write = format!(
            "UPDATE {} SET {}",
            table_ref(&schema, &table),
            assignments.join(", ")
        );
        if let Some(clause) = where_clause(&predicates) {
            write.push_str(" WHERE ");
            write.push_str(&clause);
        }
        let returning = self.returning(&caps, op.returning.as_deref())?;
        let draft = Draft {
            tenant,
            database,
            kind: StatementKind::Update,
        };
        self.finish_write(
            &draft,
            &caps,
            write,
            returning,
            &caps.check_filter(PolicyCommand::Update),
            params,
            policies_applied,
        )
    }

    async fn validate_delete(
        &self,
        tenant: TenantId,
        database: &str,
        op: &DeleteOp,
    ) -> Result<ValidatedOperation, GuardError> {
        let schema = self.resolver.identifier(&op.schema)?;
        let table = self.resolver.identifier(&op.table)?;
        let caps = self
            .table_capabilities(tenant, database, schema.as_str(), table.as_str())
            .await?;
        caps.require(Capability::Delete)?;

        if op.filters.is_empty() {
            return Err(GuardError::invalid("delete requires at least one filter"));
        }
        let mut params = ParamList::new();
        let mut predicates = self.render_filters(&caps, &op.filters, &mut params)?;
        let mut policies_applied = 0;
        if let Some(expr) = weave::filter_expression(
            &self.analyzer,
            &caps.row_filter(PolicyCommand::Delete),
            tenant,
            &mut params,
        )? {
            predicates.push(expr.to_string());
            policies_applied += 1;
        }
        let mut write = format!("DELETE FROM {}", table_ref(&schema, &table));
        if let Some(clause) = where_clause(&predicates) {
            write.push_str(" WHERE ");
            write.push_str(&clause);
        }
        let returning = self.returning(&caps, op.returning.as_deref())?;
        let draft = Draft {
            tenant,
            database,
            kind: StatementKind::Delete,
        };
        self.finish_write(
            &draft,
            &caps,
            write,
            returning,
            &RowFilter::Unrestricted,
            params,
            policies_applied,
        )
    }

    /// Attach RETURNING and, when the table has a WITH CHECK side, wrap the
    /// write so the engine can verify every produced row.
    #[allow(clippy::too_many_arguments)]
    fn finish_write(
        &self,
        draft: &Draft<'_>,
        caps: &CapabilitySet,
        write: String,
        returning: Option<String>,
        check: &RowFilter,
        mut params: ParamList,
        mut policies_applied: usize,
    ) -> Result<ValidatedOperation, GuardError> {
        let check = weave::filter_expression(&self.analyzer, check, draft.tenant, &mut params)?;
        let (sql, output, row_check) = match (check, returning) {
            (Some(expr), returning) => {
                policies_applied += 1;
                let output = if returning.is_some() {
                    OutputShape::Rows
                } else {
                    OutputShape::RowCount
                };
                (
                    weave::wrap_with_check(&write, returning.as_deref(), &expr),
                    output,
                    Some(RowCheck {
                        object: caps.object_name(),
                    }),
                )
            }
            (None, Some(columns)) => (
                format!("{write} RETURNING {columns}"),
                OutputShape::Rows,
                None,
            ),
            (None, None) => (write, OutputShape::RowCount, None),
        };
        Ok(draft.finish(
            sql,
            params.into_inner(),
            output,
            row_check,
            vec![caps.object_name()],
            policies_applied,
        ))
    }

    /// SELECT list honouring the column mask. Masked columns are dropped
    /// silently; a request left with nothing readable is denied.
    fn projection(
        &self,
        caps: &CapabilitySet,
        columns: Option<&[String]>,
    ) -> Result<String, GuardError> {
        let denied = |column: &str| {
            GuardError::from(PolicyError::ColumnPermissionDenied {
                column: column.to_string(),
                object: caps.object_name(),
            })
        };
        let requested =
            columns.filter(|cols| !(cols.is_empty() || (cols.len() == 1 && cols[0] == "*")));
        match requested {
            None => match caps.masked_select_columns() {
                None => Ok("*".to_string()),
                Some(readable) if readable.is_empty() => Err(denied("*")),
                Some(readable) => {
                    let idents = readable
                        .into_iter()
                        .map(|c| self.resolver.identifier(c))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(column_list(&idents))
                }
            },
            Some(cols) => {
                let mut idents = Vec::with_capacity(cols.len());
                for col in cols {
                    idents.push(self.resolver.identifier(col)?);
                }
                let readable = caps.readable_columns(cols);
                if readable.is_empty() {
                    return Err(denied(&cols[0]));
                }
                let kept: Vec<&Identifier> = idents
                    .iter()
                    .filter(|i| readable.contains(&i.as_str()))
                    .collect();
                Ok(column_list(kept))
            }
        }
    }

    fn returning(
        &self,
        caps: &CapabilitySet,
        columns: Option<&[String]>,
    ) -> Result<Option<String>, GuardError> {
        match columns {
            None => Ok(None),
            Some(cols) => {
                caps.require(Capability::Select)?;
                self.projection(caps, Some(cols)).map(Some)
            }
        }
    }

    fn render_filters(
        &self,
        caps: &CapabilitySet,
        filters: &[Filter],
        params: &mut ParamList,
    ) -> Result<Vec<String>, GuardError> {
        filters
            .iter()
            .map(|filter| {
                let column = self.resolver.identifier(&filter.column)?;
                require_readable(caps, &column)?;
                builder::render_filter(&column, filter, params)
            })
            .collect()
    }

    // ----- structured DDL --------------------------------------------------

    async fn validate_create_table(
        &self,
        tenant: TenantId,
        database: &str,
        op: &CreateTableOp,
    ) -> Result<ValidatedOperation, GuardError> {
        let schema = self.resolver.identifier(&op.schema)?;
        let table = self.resolver.identifier(&op.table)?;
        let caps = self
            .table_capabilities(tenant, database, schema.as_str(), table.as_str())
            .await?;
        caps.require(Capability::CreateTable)?;

        if op.columns.is_empty() {
            return Err(GuardError::invalid("a table needs at least one column"));
        }
        let primary: Vec<&ColumnSpec> = op.columns.iter().filter(|c| c.primary_key).collect();
        let composite = primary.len() > 1;
        let mut names = Vec::with_capacity(op.columns.len());
        let mut definitions = Vec::with_capacity(op.columns.len() + 1);
        for column in &op.columns {
            let (name, definition) = self.column_definition(column, !composite)?;
            if names.contains(&name) {
                return Err(GuardError::invalid(format!("duplicate column '{name}'")));
            }
            names.push(name);
            definitions.push(definition);
        }
        if composite {
            let keys = primary
                .iter()
                .map(|c| self.resolver.identifier(&c.name))
                .collect::<Result<Vec<_>, _>>()?;
            definitions.push(format!("PRIMARY KEY ({})", column_list(&keys)));
        }

        let sql = format!(
            "CREATE TABLE {}{} ({})",
            if op.if_not_exists { "IF NOT EXISTS " } else { "" },
            table_ref(&schema, &table),
            definitions.join(", ")
        );
        Ok(self.ddl(tenant, database, StatementKind::CreateTable, sql, caps.object_name()))
    }

    fn column_definition(
        &self,
        column: &ColumnSpec,
        inline_primary_key: bool,
    ) -> Result<(Identifier, String), GuardError> {
        let name = self.resolver.identifier(&column.name)?;
        let mut parts = vec![name.quoted(), builder::column_type(&column.data_type)?];
        if column.primary_key && inline_primary_key {
            parts.push("PRIMARY KEY".to_string());
        } else if !column.nullable {
            parts.push("NOT NULL".to_string());
        }
        if column.unique {
            parts.push("UNIQUE".to_string());
        }
        if let Some(default) = &column.default {
            parts.push(format!("DEFAULT {}", builder::default_literal(default)?));
        }
        Ok((name, parts.join(" ")))
    }

    async fn validate_alter_table(
        &self,
        tenant: TenantId,
        database: &str,
        op: &AlterTableOp,
    ) -> Result<ValidatedOperation, GuardError> {
        let schema = self.resolver.identifier(&op.schema)?;
        let table = self.resolver.identifier(&op.table)?;
        let caps = self
            .table_capabilities(tenant, database, schema.as_str(), table.as_str())
            .await?;
        caps.require(Capability::AlterTable)?;

        let action = match &op.action {
            AlterAction::AddColumn { column } => {
                let (_, definition) = self.column_definition(column, true)?;
                format!("ADD COLUMN {definition}")
            }
            AlterAction::DropColumn { name, if_exists } => format!(
                "DROP COLUMN {}{}",
                if *if_exists { "IF EXISTS " } else { "" },
                self.resolver.identifier(name)?.quoted()
            ),
            AlterAction::RenameColumn { from, to } => format!(
                "RENAME COLUMN {} TO {}",
                self.resolver.identifier(from)?.quoted(),
                self.resolver.identifier(to)?.quoted()
            ),
        };
        let sql = format!("ALTER TABLE {} {action}", table_ref(&schema, &table));
        Ok(self.ddl(tenant, database, StatementKind::AlterTable, sql, caps.object_name()))
    }

    async fn validate_drop_table(
        &self,
        tenant: TenantId,
        database: &str,
        op: &DropTableOp,
    ) -> Result<ValidatedOperation, GuardError> {
        let schema = self.resolver.identifier(&op.schema)?;
        let table = self.resolver.identifier(&op.table)?;
        let caps = self
            .table_capabilities(tenant, database, schema.as_str(), table.as_str())
            .await?;
        caps.require(Capability::DropTable)?;

        let sql = format!(
            "DROP TABLE {}{}{}",
            if op.if_exists { "IF EXISTS " } else { "" },
            table_ref(&schema, &table),
            if op.cascade { " CASCADE" } else { "" }
        );
        Ok(self.ddl(tenant, database, StatementKind::DropTable, sql, caps.object_name()))
    }

    async fn validate_create_schema(
        &self,
        tenant: TenantId,
        database: &str,
        op: &CreateSchemaOp,
    ) -> Result<ValidatedOperation, GuardError> {
        let schema = self.require_create_schema(tenant, database, &op.schema).await?;
        let sql = format!(
            "CREATE SCHEMA {}{}",
            if op.if_not_exists { "IF NOT EXISTS " } else { "" },
            schema.quoted()
        );
        Ok(self.ddl(tenant, database, StatementKind::CreateSchema, sql, schema.to_string()))
    }

    fn ddl(
        &self,
        tenant: TenantId,
        database: &str,
        kind: StatementKind,
        sql: String,
        object: String,
    ) -> ValidatedOperation {
        Draft {
            tenant,
            database,
            kind,
        }
        .finish(sql, Vec::new(), OutputShape::RowCount, None, vec![object], 0)
    }
}

/// Capability each referenced table needs, deduplicated.
fn requirements(analyzed: &AnalyzedStatement) -> Vec<(RelationRef, Capability)> {
    let mut out: Vec<(RelationRef, Capability)> = Vec::new();
    let mut add = |relation: &RelationRef, capability: Capability| {
        if !out.iter().any(|(r, c)| r == relation && *c == capability) {
            out.push((relation.clone(), capability));
        }
    };
    let target_capability = analyzed.kind.required_capability();
    for target in &analyzed.targets {
        add(target, target_capability);
        if analyzed.upsert {
            add(target, Capability::Update);
        }
    }
    let source_capability = source_capability(analyzed.kind, analyzed.create_as);
    for source in analyzed.sources() {
        add(source, source_capability);
    }
    out
}

/// What a raw statement does with the tables it names but does not target.
fn source_capability(kind: StatementKind, create_as: bool) -> Capability {
    match kind {
        StatementKind::AlterTable => Capability::References,
        StatementKind::CreateTable if !create_as => Capability::References,
        _ => Capability::Select,
    }
}

fn check_same_database(relation: &RelationRef, database: &str) -> Result<(), GuardError> {
    match &relation.database {
        Some(db) if !db.eq_ignore_ascii_case(database) => Err(GuardError::forbidden(format!(
            "cross-database reference to '{db}'"
        ))),
        _ => Ok(()),
    }
}

fn require_readable(caps: &CapabilitySet, column: &Identifier) -> Result<(), GuardError> {
    let name = [column.as_str().to_string()];
    if caps.readable_columns(&name).is_empty() {
        return Err(PolicyError::ColumnPermissionDenied {
            column: column.to_string(),
            object: caps.object_name(),
        }
        .into());
    }
    Ok(())
}

fn to_i64(value: u64, what: &str) -> Result<i64, GuardError> {
    i64::try_from(value).map_err(|_| GuardError::invalid(format!("{what} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;
    use vibe_core::{
        AccessError, ColumnMask, ControlStore, DdlFlags, MemoryControlStore, PermissionLevel,
        PolicyKind, RowPolicy, SchemaPermission, TablePermission, TypedParam,
    };
    use vibe_policy::ReservedDatabases;

    use crate::operation::FilterOp;

    struct Fixture {
        store: Arc<MemoryControlStore>,
        guard: StatementGuard,
        tenant: TenantId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryControlStore::new());
        let resolver = PermissionResolver::new(
            store.clone(),
            ReservedDatabases::new(["vibe_control", "postgres"]),
        );
        Fixture {
            store,
            guard: StatementGuard::new(resolver),
            tenant: TenantId::new(),
        }
    }

    impl Fixture {
        async fn grant_schema(&self, level: PermissionLevel, ddl: DdlFlags) {
            self.store
                .upsert_schema_permission(SchemaPermission {
                    tenant_id: self.tenant,
                    database_name: "db1".into(),
                    schema_name: "public".into(),
                    level,
                    ddl,
                    apply_to_existing: true,
                    apply_to_future: true,
                })
                .await
                .unwrap();
        }

        async fn grant_table(&self, perm: TablePermission) {
            self.store
                .upsert_table_permission(TablePermission {
                    tenant_id: self.tenant,
                    database_name: "db1".into(),
                    schema_name: "public".into(),
                    ..perm
                })
                .await
                .unwrap();
        }

        async fn policy(
            &self,
            table: &str,
            command: PolicyCommand,
            using: Option<&str>,
            check: Option<&str>,
        ) {
            self.store
                .upsert_row_policy(RowPolicy {
                    id: Uuid::new_v4(),
                    tenant_id: self.tenant,
                    database_name: "db1".into(),
                    schema_name: "public".into(),
                    table_name: table.into(),
                    policy_name: format!("{table}_{}", command.as_str()),
                    command,
                    kind: PolicyKind::Permissive,
                    using_expression: using.map(str::to_string),
                    with_check_expression: check.map(str::to_string),
                    is_active: true,
                })
                .await
                .unwrap();
        }

        async fn validate(&self, op: Operation) -> Result<ValidatedOperation, GuardError> {
            self.guard.validate(self.tenant, "db1", &op).await
        }
    }

    fn code(err: GuardError) -> &'static str {
        AccessError::from(err).code()
    }

    #[tokio::test]
    async fn drop_database_is_always_forbidden() {
        let f = fixture();
        f.grant_schema(
            PermissionLevel::ReadWrite,
            DdlFlags {
                create_table: true,
                alter_table: true,
                drop_table: true,
                create_schema: true,
            },
        )
        .await;
        let err = f.validate(Operation::raw("DROP DATABASE x", false)).await.unwrap_err();
        assert_eq!(code(err), "FORBIDDEN_OPERATION");

        let err = f
            .validate(Operation::raw("select 1; -- hi\n CREATE ROLE r", false))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Forbidden { .. }));

        let err = f
            .validate(Operation::raw("SELECT 1; SELECT 2", false))
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::InvalidStatement(_)));
    }

    #[tokio::test]
    async fn read_only_request_rejects_insert_despite_read_write() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadWrite, DdlFlags::default()).await;
        let err = f
            .validate(Operation::raw("INSERT INTO t (id) VALUES (1)", true))
            .await
            .unwrap_err();
        assert_eq!(code(err), "FORBIDDEN_OPERATION");

        let ok = f
            .validate(Operation::raw("INSERT INTO t (id) VALUES (1)", false))
            .await
            .unwrap();
        assert_eq!(ok.kind, StatementKind::Insert);
        assert_eq!(ok.output, OutputShape::RowCount);
    }

    #[tokio::test]
    async fn update_on_read_only_schema_names_the_capability() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadOnly, DdlFlags::default()).await;
        let err = f
            .validate(Operation::raw("UPDATE public.t SET a = 1 WHERE id = 2", false))
            .await
            .unwrap_err();
        let access = AccessError::from(err);
        assert_eq!(
            access,
            AccessError::InsufficientPermission {
                capability: Capability::Update,
                object: "public.t".into()
            }
        );

        let err = f
            .validate(Operation::Update(UpdateOp {
                schema: "public".into(),
                table: "t".into(),
                set: json!({"a": 1}).as_object().cloned().unwrap(),
                filters: vec![Filter::eq("id", json!(2))],
                returning: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(code(err), "INSUFFICIENT_PERMISSION");
    }

    #[tokio::test]
    async fn reserved_database_is_forbidden() {
        let f = fixture();
        let err = f
            .guard
            .validate(f.tenant, "VIBE_CONTROL", &Operation::raw("SELECT 1", true))
            .await
            .unwrap_err();
        assert_eq!(code(err), "FORBIDDEN_OPERATION");

        f.grant_schema(PermissionLevel::ReadOnly, DdlFlags::default()).await;
        let err = f
            .validate(Operation::raw("SELECT * FROM vibe_control.public.tenants", true))
            .await
            .unwrap_err();
        assert_eq!(code(err), "FORBIDDEN_OPERATION");

        let err = f
            .validate(Operation::raw("SELECT * FROM other.public.t", true))
            .await
            .unwrap_err();
        assert_eq!(code(err), "FORBIDDEN_OPERATION");
    }

    #[tokio::test]
    async fn raw_select_gets_row_policy_woven() {
        let f = fixture();
        f.grant_table(TablePermission {
            table_name: "orders".into(),
            can_select: true,
            ..Default::default()
        })
        .await;
        f.policy("orders", PolicyCommand::Select, Some("owner_id = :tenant"), None)
            .await;

        let op = Operation::RawSql(RawSql {
            sql: "SELECT id, total FROM orders WHERE total > $1".into(),
            params: vec![TypedParam::new(json!(10), "int")],
            read_only: true,
        });
        let validated = f.validate(op).await.unwrap();
        assert_eq!(
            validated.sql,
            "SELECT id, total FROM (SELECT * FROM orders WHERE (owner_id = $2)) AS orders WHERE total > $1"
        );
        assert_eq!(
            validated.params,
            vec![SqlParam::Int(10), SqlParam::Text(f.tenant.to_string())]
        );
        assert_eq!(validated.policies_applied, 1);
    }

    #[tokio::test]
    async fn raw_statements_that_cannot_carry_policies_are_refused() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadWrite, DdlFlags::default()).await;
        f.policy("orders", PolicyCommand::All, Some("owner_id = :tenant"), None)
            .await;

        for sql in [
            "INSERT INTO orders (id) VALUES (1)",
            "UPDATE orders SET total = 0 WHERE id = 1",
            "TRUNCATE orders",
        ] {
            let err = f.validate(Operation::raw(sql, false)).await.unwrap_err();
            assert_eq!(code(err), "FORBIDDEN_OPERATION", "{sql}");
        }

        let deleted = f
            .validate(Operation::raw("DELETE FROM orders WHERE id = 1", false))
            .await
            .unwrap();
        assert_eq!(
            deleted.sql,
            "DELETE FROM orders WHERE (id = 1) AND ((owner_id = $1))"
        );
        assert!(deleted.dangerous);
    }

    #[tokio::test]
    async fn policy_follows_the_table_into_subqueries_and_derived_tables() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadOnly, DdlFlags::default()).await;
        f.policy("orders", PolicyCommand::Select, Some("owner_id = :tenant"), None)
            .await;
        let filtered = "(SELECT * FROM orders WHERE (owner_id = $1)) AS orders";

        let scalar = f
            .validate(Operation::raw(
                "SELECT id, (SELECT max(amount) FROM orders) AS leak FROM orders",
                true,
            ))
            .await
            .unwrap();
        assert_eq!(
            scalar.sql,
            format!("SELECT id, (SELECT max(amount) FROM {filtered}) AS leak FROM {filtered}")
        );
        assert_eq!(scalar.params, vec![SqlParam::Text(f.tenant.to_string())]);
        assert_eq!(scalar.policies_applied, 1);

        // A forged owner column in a derived table cannot satisfy the policy:
        // the real table is filtered underneath it.
        let forged = format!("SELECT * FROM (SELECT amount, '{}' AS owner_id FROM orders) AS o", f.tenant);
        let derived = f.validate(Operation::raw(&forged, true)).await.unwrap();
        assert_eq!(
            derived.sql,
            format!("SELECT * FROM (SELECT amount, '{}' AS owner_id FROM {filtered}) AS o", f.tenant)
        );

        let joined = f
            .validate(Operation::raw(
                "SELECT o.id FROM orders o JOIN items i ON i.order_id = o.id",
                true,
            ))
            .await
            .unwrap();
        assert_eq!(
            joined.sql,
            "SELECT o.id FROM (SELECT * FROM orders WHERE (owner_id = $1)) o JOIN items i ON i.order_id = o.id"
        );

        let with_cte = f
            .validate(Operation::raw(
                "WITH mine AS (SELECT * FROM orders) SELECT count(*) FROM mine",
                true,
            ))
            .await
            .unwrap();
        assert_eq!(
            with_cte.sql,
            format!("WITH mine AS (SELECT * FROM {filtered}) SELECT count(*) FROM mine")
        );

        let union = f
            .validate(Operation::raw(
                "SELECT id FROM items UNION SELECT id FROM orders",
                true,
            ))
            .await
            .unwrap();
        assert_eq!(union.sql, format!("SELECT id FROM items UNION SELECT id FROM {filtered}"));
    }

    #[tokio::test]
    async fn shadowing_cte_does_not_hide_the_table() {
        let f = fixture();
        f.grant_table(TablePermission {
            table_name: "orders".into(),
            can_select: true,
            ..Default::default()
        })
        .await;
        let err = f
            .validate(Operation::raw(
                "WITH secrets AS (SELECT * FROM secrets) SELECT * FROM secrets",
                true,
            ))
            .await
            .unwrap_err();
        assert_eq!(code(err), "INSUFFICIENT_PERMISSION");
    }

    #[tokio::test]
    async fn delete_filters_its_target_and_its_subqueries() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadWrite, DdlFlags::default()).await;
        f.policy("orders", PolicyCommand::All, Some("owner_id = :tenant"), None)
            .await;

        let deleted = f
            .validate(Operation::raw(
                "DELETE FROM orders WHERE total < (SELECT avg(total) FROM orders)",
                false,
            ))
            .await
            .unwrap();
        assert_eq!(
            deleted.sql,
            "DELETE FROM orders WHERE (total < (SELECT avg(total) FROM (SELECT * FROM orders WHERE (owner_id = $1)) AS orders)) AND ((owner_id = $1))"
        );
        assert_eq!(deleted.policies_applied, 2);

        let copied = f
            .validate(Operation::raw(
                "INSERT INTO archive (id) SELECT id FROM orders",
                false,
            ))
            .await
            .unwrap();
        assert_eq!(
            copied.sql,
            "INSERT INTO archive (id) SELECT id FROM (SELECT * FROM orders WHERE (owner_id = $1)) AS orders"
        );
    }

    #[tokio::test]
    async fn system_catalogs_need_their_own_permission() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadOnly, DdlFlags::default()).await;
        for sql in [
            "SELECT rolname, rolsuper FROM pg_roles",
            "SELECT query FROM pg_stat_activity",
            "SELECT * FROM orders o JOIN PG_AUTHID a ON a.oid = o.owner",
            "SELECT * FROM pg_catalog.pg_shadow",
        ] {
            let err = f.validate(Operation::raw(sql, true)).await.unwrap_err();
            assert_eq!(code(err), "INSUFFICIENT_PERMISSION", "{sql}");
        }

        let ok = f
            .validate(Operation::raw("SELECT * FROM public.pg_notes", true))
            .await
            .unwrap();
        assert_eq!(ok.objects, vec!["public.pg_notes".to_string()]);
    }

    #[tokio::test]
    async fn raw_placeholders_must_be_supplied() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadOnly, DdlFlags::default()).await;
        let err = f
            .validate(Operation::raw("SELECT * FROM t WHERE id = $2", true))
            .await
            .unwrap_err();
        assert_eq!(code(err), "INVALID_STATEMENT");
    }

    #[tokio::test]
    async fn information_schema_is_readable() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadOnly, DdlFlags::default()).await;
        let validated = f
            .validate(Operation::raw(
                "SELECT table_name FROM information_schema.tables",
                true,
            ))
            .await
            .unwrap();
        assert_eq!(validated.objects, vec!["information_schema.tables".to_string()]);
    }

    #[tokio::test]
    async fn structured_select_with_mask_and_policy() {
        let f = fixture();
        f.grant_table(TablePermission {
            table_name: "users".into(),
            can_select: true,
            column_permissions: Some(
                ColumnMask::from_names([("id", vec!["select"]), ("name", vec!["select"])]).unwrap(),
            ),
            ..Default::default()
        })
        .await;
        f.policy("users", PolicyCommand::Select, Some("org = :tenant"), None)
            .await;

        let mut op = SelectOp::new("public", "users");
        op.filters = vec![Filter::new("name", FilterOp::ILike, json!("a%"))];
        op.limit = Some(10);
        let validated = f.validate(Operation::Select(op.clone())).await.unwrap();
        assert_eq!(
            validated.sql,
            r#"SELECT "id", "name" FROM "public"."users" WHERE ("name" ILIKE $1) AND ((org = $2)) LIMIT $3"#
        );
        assert_eq!(validated.params.len(), 3);

        op.columns = Some(vec!["id".into(), "salary".into()]);
        op.filters.clear();
        op.limit = None;
        let validated = f.validate(Operation::Select(op.clone())).await.unwrap();
        assert!(validated.sql.starts_with(r#"SELECT "id" FROM"#));

        op.filters = vec![Filter::eq("salary", json!(1))];
        let err = f.validate(Operation::Select(op)).await.unwrap_err();
        assert_eq!(code(err), "COLUMN_PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn structured_insert_checks_columns_and_policies() {
        let f = fixture();
        f.grant_table(TablePermission {
            table_name: "notes".into(),
            can_select: true,
            can_insert: true,
            column_permissions: Some(
                ColumnMask::from_names([
                    ("id", vec!["select"]),
                    ("body", vec!["select", "insert"]),
                    ("owner_id", vec!["select", "insert"]),
                ])
                .unwrap(),
            ),
            ..Default::default()
        })
        .await;
        f.policy("notes", PolicyCommand::Insert, None, Some("owner_id = :tenant"))
            .await;

        let insert = |rows: serde_json::Value, returning: Option<Vec<String>>| InsertOp {
            schema: "public".into(),
            table: "notes".into(),
            rows: rows
                .as_array()
                .unwrap()
                .iter()
                .map(|r| r.as_object().cloned().unwrap())
                .collect(),
            returning,
        };

        let err = f
            .validate(Operation::Insert(insert(json!([{"id": 1, "body": "x"}]), None)))
            .await
            .unwrap_err();
        assert_eq!(code(err), "COLUMN_PERMISSION_DENIED");

        let validated = f
            .validate(Operation::Insert(insert(
                json!([{"body": "a", "owner_id": "t"}, {"body": "b"}]),
                Some(vec!["id".into()]),
            )))
            .await
            .unwrap();
        assert_eq!(
            validated.sql,
            r#"WITH __vibe_written AS (INSERT INTO "public"."notes" ("body", "owner_id") VALUES ($1, $2), ($3, DEFAULT) RETURNING *) SELECT "id", ((owner_id = $4)) AS "__vibe_check" FROM __vibe_written"#
        );
        assert_eq!(validated.output, OutputShape::Rows);
        assert_eq!(
            validated.row_check,
            Some(RowCheck {
                object: "public.notes".into()
            })
        );
    }

    #[tokio::test]
    async fn update_and_delete_require_filters() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadWrite, DdlFlags::default()).await;
        let err = f
            .validate(Operation::Delete(DeleteOp {
                schema: "public".into(),
                table: "t".into(),
                filters: vec![],
                returning: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(code(err), "INVALID_STATEMENT");

        let validated = f
            .validate(Operation::Update(UpdateOp {
                schema: "public".into(),
                table: "t".into(),
                set: json!({"status": "done"}).as_object().cloned().unwrap(),
                filters: vec![Filter::new("id", FilterOp::In, json!([1, 2]))],
                returning: Some(vec!["*".into()]),
            }))
            .await
            .unwrap();
        assert_eq!(
            validated.sql,
            r#"UPDATE "public"."t" SET "status" = $1 WHERE ("id" IN ($2, $3)) RETURNING *"#
        );
    }

    #[tokio::test]
    async fn ddl_needs_its_flag() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadWrite, DdlFlags::default()).await;
        let mut id = ColumnSpec::new("id", "bigserial");
        id.primary_key = true;
        let mut body = ColumnSpec::new("body", "text");
        body.nullable = false;
        body.default = Some(json!(""));
        let create = Operation::CreateTable(CreateTableOp {
            schema: "public".into(),
            table: "notes".into(),
            columns: vec![id, body],
            if_not_exists: true,
        });
        let err = f.validate(create.clone()).await.unwrap_err();
        assert_eq!(code(err), "INSUFFICIENT_PERMISSION");

        f.grant_schema(
            PermissionLevel::ReadWrite,
            DdlFlags {
                create_table: true,
                ..Default::default()
            },
        )
        .await;
        let validated = f.validate(create).await.unwrap();
        assert_eq!(
            validated.sql,
            r#"CREATE TABLE IF NOT EXISTS "public"."notes" ("id" bigserial PRIMARY KEY, "body" text NOT NULL DEFAULT '')"#
        );

        let mut bad = ColumnSpec::new("x", "text); DROP TABLE notes; --");
        bad.nullable = true;
        let err = f
            .validate(Operation::CreateTable(CreateTableOp {
                schema: "public".into(),
                table: "evil".into(),
                columns: vec![bad],
                if_not_exists: false,
            }))
            .await
            .unwrap_err();
        assert_eq!(code(err), "INVALID_STATEMENT");

        let err = f
            .validate(Operation::DropTable(DropTableOp {
                schema: "public".into(),
                table: "notes".into(),
                if_exists: false,
                cascade: false,
            }))
            .await
            .unwrap_err();
        assert_eq!(code(err), "INSUFFICIENT_PERMISSION");
    }

    #[tokio::test]
    async fn create_schema_requires_the_database_flag() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadWrite, DdlFlags::default()).await;
        let op = Operation::CreateSchema(CreateSchemaOp {
            schema: "reporting".into(),
            if_not_exists: false,
        });
        assert_eq!(code(f.validate(op.clone()).await.unwrap_err()), "INSUFFICIENT_PERMISSION");

        f.grant_schema(
            PermissionLevel::ReadWrite,
            DdlFlags {
                create_schema: true,
                ..Default::default()
            },
        )
        .await;
        assert_eq!(f.validate(op).await.unwrap().sql, r#"CREATE SCHEMA "reporting""#);

        let err = f
            .validate(Operation::raw("CREATE SCHEMA pg_evil", false))
            .await
            .unwrap_err();
        assert_eq!(code(err), "FORBIDDEN_OPERATION");
    }

    #[tokio::test]
    async fn bad_identifiers_are_rejected() {
        let f = fixture();
        f.grant_schema(PermissionLevel::ReadWrite, DdlFlags::default()).await;
        let err = f
            .validate(Operation::Select(SelectOp::new("public", "t\"; DROP TABLE x; --")))
            .await
            .unwrap_err();
        assert_eq!(code(err), "INVALID_IDENTIFIER");
    }
}
