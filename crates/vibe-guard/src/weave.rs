//! Row-policy weaving.
//!
//! Policy expressions come from the control store and may reference the
//! requesting tenant as `:tenant`. That marker is replaced by a bound
//! parameter, then the expression is parsed back to make sure it is one
//! boolean expression before it is combined with the statement.
//!
//! Every read of a policy-bearing table, wherever it sits (joins, scalar
//! subqueries, derived tables, CTE bodies, set operations), is replaced by
//! a filtered derived table. The row target of an UPDATE or DELETE keeps
//! its own name and gets the policy ANDed into the statement's WHERE.

use regex::Regex;
use sqlparser::ast::{
    BinaryOperator, Expr, FromTable, SetExpr, Statement, TableFactor, VisitMut, VisitorMut,
};
use std::ops::ControlFlow;
use std::sync::LazyLock;

use vibe_core::TenantId;
use vibe_policy::RowFilter;

use crate::analyzer::{RelationRef, SqlAnalyzer};
use crate::builder::ParamList;
use crate::error::GuardError;

/// Boolean column carrying the WITH CHECK result of each written row.
pub const CHECK_COLUMN: &str = "__vibe_check";

/// Name of the CTE holding rows produced by a checked write.
pub const WRITTEN_CTE: &str = "__vibe_written";

static TENANT_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^:]):tenant\b").expect("valid tenant marker pattern"));

/// Replace every `:tenant` (but not `::tenant` casts) with `placeholder`.
pub fn substitute_tenant(expression: &str, placeholder: &str) -> String {
    let replacement = format!("${{1}}{}", placeholder.replace('$', "$$"));
    TENANT_MARKER_RE
        .replace_all(expression, replacement.as_str())
        .into_owned()
}

pub fn mentions_tenant(expression: &str) -> bool {
    TENANT_MARKER_RE.is_match(expression)
}

/// Parse `expression` as exactly one SQL expression.
pub fn parse_expression(analyzer: &SqlAnalyzer, expression: &str) -> Result<Expr, GuardError> {
    let reject = || GuardError::invalid("row policy expression is not a single boolean expression");
    let wrapped = format!("SELECT 1 WHERE {expression}");
    let mut statements = analyzer.parse(&wrapped).map_err(|_| reject())?;
    if statements.len() != 1 {
        return Err(reject());
    }
    let statement = statements.remove(0);
    let selection = match &statement {
        Statement::Query(query) => query
            .body
            .as_select()
            .and_then(|select| select.selection.clone()),
        _ => None,
    }
    .ok_or_else(reject)?;
    // Anything the parser attached outside the WHERE clause (UNION, ORDER
    // BY, LIMIT ...) shows up as a difference here.
    if statement.to_string() != format!("SELECT 1 WHERE {selection}") {
        return Err(reject());
    }
    Ok(selection)
}

/// Resolve a combined row filter into a validated expression with the
/// tenant bound. `None` when unrestricted.
pub fn filter_expression(
    analyzer: &SqlAnalyzer,
    filter: &RowFilter,
    tenant: TenantId,
    params: &mut ParamList,
) -> Result<Option<Expr>, GuardError> {
    let text = match filter {
        RowFilter::Unrestricted => return Ok(None),
        RowFilter::DenyAll => "FALSE".to_string(),
        RowFilter::Expression(expr) if mentions_tenant(expr) => {
            let placeholder = params.tenant(tenant);
            substitute_tenant(expr, &placeholder)
        }
        RowFilter::Expression(expr) => expr.clone(),
    };
    parse_expression(analyzer, &text).map(Some)
}

/// AND `expr` into the WHERE clause of an UPDATE or DELETE, filtering the
/// rows it may touch.
pub fn weave_into_target(statement: &mut Statement, expr: Expr) -> Result<(), GuardError> {
    let slot = match statement {
        Statement::Update(update) => &mut update.selection,
        Statement::Delete(delete) => &mut delete.selection,
        _ => {
            return Err(GuardError::forbidden(
                "row policies can only filter the target of an UPDATE or DELETE",
            ));
        }
    };
    and_into(slot, expr);
    Ok(())
}

/// Replace every read of a table in `filters` with
/// `(SELECT * FROM <table> WHERE <filter>) AS <alias>`. The alias defaults
/// to the table's own name so column references keep resolving. The target
/// of an UPDATE or DELETE is left alone. Returns how many occurrences were
/// rewritten.
pub fn rewrite_reads(
    analyzer: &SqlAnalyzer,
    statement: &mut Statement,
    filters: &[(RelationRef, Expr)],
) -> Result<usize, GuardError> {
    if filters.is_empty() {
        return Ok(0);
    }
    let mut rewriter = ReadRewriter {
        analyzer,
        filters,
        rewritten: 0,
        error: None,
    };
    if visit_reads(statement, &mut rewriter).is_break() {
        return Err(rewriter
            .error
            .unwrap_or_else(|| GuardError::invalid("cannot apply row policies")));
    }
    Ok(rewriter.rewritten)
}

fn visit_reads(statement: &mut Statement, rewriter: &mut ReadRewriter<'_>) -> ControlFlow<()> {
    match statement {
        Statement::Update(update) => {
            update.table.joins.visit(rewriter)?;
            update.assignments.visit(rewriter)?;
            update.from.visit(rewriter)?;
            update.selection.visit(rewriter)?;
            update.returning.visit(rewriter)
        }
        Statement::Delete(delete) => {
            let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) =
                &mut delete.from;
            for (i, table) in tables.iter_mut().enumerate() {
                if i == 0 {
                    table.joins.visit(rewriter)?;
                } else {
                    table.visit(rewriter)?;
                }
            }
            delete.using.visit(rewriter)?;
            delete.selection.visit(rewriter)?;
            delete.returning.visit(rewriter)
        }
        other => other.visit(rewriter),
    }
}

struct ReadRewriter<'a> {
    analyzer: &'a SqlAnalyzer,
    filters: &'a [(RelationRef, Expr)],
    rewritten: usize,
    error: Option<GuardError>,
}

impl ReadRewriter<'_> {
    fn replacement(&self, factor: &TableFactor) -> Result<Option<TableFactor>, GuardError> {
        let TableFactor::Table {
            name,
            alias,
            args: None,
            sample,
            ..
        } = factor
        else {
            return Ok(None);
        };
        let relation = RelationRef::of_object(name)?;
        let Some((_, filter)) = self.filters.iter().find(|(r, _)| r.same_table(&relation)) else {
            return Ok(None);
        };
        if sample.is_some() {
            return Err(GuardError::forbidden(format!(
                "TABLESAMPLE cannot be used on {relation}, which has row policies"
            )));
        }
        let alias = match (alias, name.0.last()) {
            (Some(alias), _) => alias.to_string(),
            (None, Some(last)) => format!("AS {last}"),
            (None, None) => return Err(GuardError::invalid("empty relation name")),
        };
        let sql = format!("SELECT * FROM (SELECT * FROM {name} WHERE {filter}) {alias}");
        derived_factor(self.analyzer, &sql).map(Some)
    }
}

impl VisitorMut for ReadRewriter<'_> {
    type Break = ();

    // Post-visit: the replacement's own inner read is never visited again.
    fn post_visit_table_factor(&mut self, factor: &mut TableFactor) -> ControlFlow<()> {
        match self.replacement(factor) {
            Ok(Some(derived)) => {
                *factor = derived;
                self.rewritten += 1;
                ControlFlow::Continue(())
            }
            Ok(None) => ControlFlow::Continue(()),
            Err(e) => {
                self.error = Some(e);
                ControlFlow::Break(())
            }
        }
    }
}

/// Parse `SELECT * FROM <factor>` and hand back the factor.
fn derived_factor(analyzer: &SqlAnalyzer, sql: &str) -> Result<TableFactor, GuardError> {
    let reject = || GuardError::invalid("cannot rewrite a relation for its row policy");
    let mut statements = analyzer.parse(sql).map_err(|_| reject())?;
    let factor = match statements.pop() {
        Some(Statement::Query(query)) => match *query.body {
            SetExpr::Select(select) => select.from.into_iter().next().map(|t| t.relation),
            _ => None,
        },
        _ => None,
    };
    factor.ok_or_else(reject)
}

fn and_into(slot: &mut Option<Expr>, expr: Expr) {
    *slot = Some(match slot.take() {
        Some(existing) => Expr::BinaryOp {
            left: Box::new(Expr::Nested(Box::new(existing))),
            op: BinaryOperator::And,
            right: Box::new(Expr::Nested(Box::new(expr))),
        },
        None => expr,
    });
}

/// Wrap a write so every produced row is returned together with the result
/// of `check`.
pub fn wrap_with_check(write_sql: &str, projection: Option<&str>, check: &Expr) -> String {
    let projection = match projection {
        Some(cols) => format!("{cols}, "),
        None => String::new(),
    };
    format!(
        "WITH {WRITTEN_CTE} AS ({write_sql} RETURNING *) SELECT {projection}({check}) AS \"{CHECK_COLUMN}\" FROM {WRITTEN_CTE}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vibe_core::SqlParam;

    #[test]
    fn tenant_marker_substitution() {
        assert_eq!(substitute_tenant("owner_id = :tenant", "$3"), "owner_id = $3");
        assert_eq!(
            substitute_tenant(":tenant = owner_id::text OR x::tenant", "$1"),
            "$1 = owner_id::text OR x::tenant"
        );
        assert!(!mentions_tenant("owner_id::tenant_id"));
    }

    #[test]
    fn policy_expression_must_be_a_single_expression() {
        let analyzer = SqlAnalyzer::new();
        assert!(parse_expression(&analyzer, "owner_id = $1 AND NOT archived").is_ok());
        for bad in [
            "true; DROP TABLE orders",
            "true UNION SELECT 1",
            "true ORDER BY 1",
            "",
        ] {
            assert!(parse_expression(&analyzer, bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn filter_binds_tenant_once() {
        let analyzer = SqlAnalyzer::new();
        let tenant = TenantId::new();
        let mut params = ParamList::with_params(vec![SqlParam::Int(7)]);
        let expr = filter_expression(
            &analyzer,
            &RowFilter::Expression("(owner_id = :tenant) OR (shared_with = :tenant)".into()),
            tenant,
            &mut params,
        )
        .unwrap()
        .unwrap();
        assert_eq!(expr.to_string(), "(owner_id = $2) OR (shared_with = $2)");
        assert_eq!(
            params.into_inner(),
            vec![SqlParam::Int(7), SqlParam::Text(tenant.to_string())]
        );
    }

    #[test]
    fn deny_all_becomes_false() {
        let analyzer = SqlAnalyzer::new();
        let mut params = ParamList::new();
        let expr = filter_expression(&analyzer, &RowFilter::DenyAll, TenantId::new(), &mut params)
            .unwrap()
            .unwrap();
        assert_eq!(expr.to_string(), "false");
        assert!(params.is_empty());
    }

    #[test]
    fn target_weaving_ands_into_existing_where() {
        let analyzer = SqlAnalyzer::new();
        let mut stmt = analyzer
            .parse("UPDATE orders SET total = 0 WHERE status = 'open' OR total > 5")
            .unwrap()
            .remove(0);
        let expr = parse_expression(&analyzer, "owner_id = $1").unwrap();
        weave_into_target(&mut stmt, expr).unwrap();
        assert_eq!(
            stmt.to_string(),
            "UPDATE orders SET total = 0 WHERE (status = 'open' OR total > 5) AND (owner_id = $1)"
        );

        let mut stmt = analyzer.parse("DELETE FROM orders").unwrap().remove(0);
        let expr = parse_expression(&analyzer, "owner_id = $1").unwrap();
        weave_into_target(&mut stmt, expr).unwrap();
        assert_eq!(stmt.to_string(), "DELETE FROM orders WHERE owner_id = $1");

        let mut stmt = analyzer.parse("SELECT * FROM orders").unwrap().remove(0);
        let expr = parse_expression(&analyzer, "owner_id = $1").unwrap();
        assert!(weave_into_target(&mut stmt, expr).is_err());
    }

    fn orders_filter(analyzer: &SqlAnalyzer) -> Vec<(RelationRef, Expr)> {
        vec![(
            RelationRef::new("public", "orders"),
            parse_expression(analyzer, "owner_id = $1").unwrap(),
        )]
    }

    fn rewrite(sql: &str) -> (String, usize) {
        let analyzer = SqlAnalyzer::new();
        let mut stmt = analyzer.parse(sql).unwrap().remove(0);
        let n = rewrite_reads(&analyzer, &mut stmt, &orders_filter(&analyzer)).unwrap();
        (stmt.to_string(), n)
    }

    #[test]
    fn every_read_is_filtered() {
        assert_eq!(
            rewrite("SELECT id, (SELECT max(amount) FROM orders) AS top FROM orders"),
            (
                "SELECT id, (SELECT max(amount) FROM (SELECT * FROM orders WHERE owner_id = $1) AS orders) AS top \
                 FROM (SELECT * FROM orders WHERE owner_id = $1) AS orders"
                    .to_string(),
                2
            )
        );
        assert_eq!(
            rewrite("SELECT * FROM (SELECT amount, 'x' AS owner_id FROM public.orders) AS o"),
            (
                "SELECT * FROM (SELECT amount, 'x' AS owner_id FROM (SELECT * FROM public.orders WHERE owner_id = $1) AS orders) AS o"
                    .to_string(),
                1
            )
        );
        assert_eq!(
            rewrite("SELECT o.id FROM orders o JOIN items i ON i.order_id = o.id"),
            (
                "SELECT o.id FROM (SELECT * FROM orders WHERE owner_id = $1) o JOIN items i ON i.order_id = o.id"
                    .to_string(),
                1
            )
        );
    }

    #[test]
    fn write_targets_are_not_rewritten() {
        assert_eq!(
            rewrite("DELETE FROM orders WHERE id IN (SELECT id FROM orders WHERE total = 0)"),
            (
                "DELETE FROM orders WHERE id IN (SELECT id FROM (SELECT * FROM orders WHERE owner_id = $1) AS orders WHERE total = 0)"
                    .to_string(),
                1
            )
        );
        assert_eq!(
            rewrite("UPDATE items SET total = 0 FROM orders WHERE items.order_id = orders.id").1,
            1
        );
        assert_eq!(rewrite("UPDATE orders SET total = 0").1, 0);
    }

    #[test]
    fn sampled_policy_table_is_refused() {
        let analyzer = SqlAnalyzer::new();
        let mut stmt = analyzer
            .parse("SELECT * FROM orders TABLESAMPLE BERNOULLI (10)")
            .unwrap()
            .remove(0);
        let err = rewrite_reads(&analyzer, &mut stmt, &orders_filter(&analyzer)).unwrap_err();
        assert!(matches!(err, GuardError::Forbidden { .. }));
    }

    #[test]
    fn check_wrapper_shape() {
        let analyzer = SqlAnalyzer::new();
        let check = parse_expression(&analyzer, "owner_id = $3").unwrap();
        assert_eq!(
            wrap_with_check(r#"INSERT INTO "public"."t" ("a") VALUES ($1)"#, Some(r#""a""#), &check),
            r#"WITH __vibe_written AS (INSERT INTO "public"."t" ("a") VALUES ($1) RETURNING *) SELECT "a", (owner_id = $3) AS "__vibe_check" FROM __vibe_written"#
        );
    }
}
