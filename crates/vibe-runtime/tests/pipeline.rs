mod common;

use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

use common::Harness;
use vibe_audit::{AuditFilter, AuditOutcome};
use vibe_core::{
    AccessError, Capability, ControlStore, PermissionLevel, PolicyCommand, SqlParam, TenantId,
};
use vibe_guard::{Filter, InsertOp, Operation, SelectOp, UpdateOp};
use vibe_runtime::ExecutionOptions;

fn select_all(table: &str) -> Operation {
    Operation::raw(format!("SELECT id FROM {table}"), true)
}

#[tokio::test]
async fn select_is_truncated_at_max_rows() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;
    h.backend.with(|s| {
        s.columns = vec!["id".into()];
        s.rows = (0..50_000).map(|i| vec![json!(i)]).collect();
    });

    let result = h
        .service
        .execute(
            h.tenant,
            "db1",
            &select_all("orders"),
            &ExecutionOptions::default().with_max_rows(10_000),
        )
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 10_000);
    assert_eq!(result.row_count, 10_000);
    assert!(result.truncated);

    let calls = h.backend.calls();
    assert_eq!(calls.first().map(String::as_str), Some("begin"));
    assert_eq!(calls.get(1).map(String::as_str), Some("timeout 30000"));
    assert_eq!(calls.last().map(String::as_str), Some("commit"));

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Success);
    assert_eq!(entries[0].row_count, Some(10_000));
    assert!(entries[0].truncated);
    assert_eq!(entries[0].target(), "db1.public.orders");
}

#[tokio::test]
async fn row_policy_is_woven_even_with_full_select() {
    let h = Harness::new().await;
    h.grant_table("db1", "orders", &["select", "insert", "update", "delete"])
        .await;
    h.policy(
        "db1",
        "orders",
        PolicyCommand::Select,
        Some("owner_id = :tenant"),
        None,
    )
    .await;
    h.backend.with(|s| s.columns = vec!["id".into(), "total".into()]);

    let result = h
        .service
        .execute(
            h.tenant,
            "db1",
            &Operation::raw("SELECT id, total FROM orders", true),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.policies_applied, 1);

    let fetch = h
        .backend
        .calls()
        .into_iter()
        .find(|c| c.starts_with("fetch "))
        .unwrap();
    assert!(fetch.contains("WHERE (owner_id = $1)"), "{fetch}");
    assert_eq!(
        h.backend.last_params(),
        vec![SqlParam::Text(h.tenant.to_string())]
    );
}

#[tokio::test]
async fn row_policy_reaches_every_read_of_the_table() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;
    h.policy(
        "db1",
        "orders",
        PolicyCommand::Select,
        Some("owner_id = :tenant"),
        None,
    )
    .await;
    h.backend.with(|s| s.columns = vec!["amount".into()]);

    let forged = format!(
        "SELECT * FROM (SELECT amount, '{}' AS owner_id FROM orders) AS o",
        h.tenant
    );
    for sql in [
        "SELECT id, (SELECT max(amount) FROM orders) AS leak FROM orders".to_string(),
        forged,
    ] {
        h.service
            .execute(
                h.tenant,
                "db1",
                &Operation::raw(sql.as_str(), true),
                &ExecutionOptions::default(),
            )
            .await
            .unwrap();
    }

    let fetches: Vec<String> = h
        .backend
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("fetch "))
        .collect();
    assert_eq!(fetches.len(), 2);
    for fetch in &fetches {
        assert_eq!(
            fetch.matches("FROM orders").count(),
            fetch.matches("FROM orders WHERE (owner_id = $1)").count(),
            "{fetch}"
        );
    }
    assert_eq!(
        fetches[0].matches("(SELECT * FROM orders WHERE (owner_id = $1)) AS orders").count(),
        2
    );
    assert_eq!(
        fetches[1].matches("(SELECT * FROM orders WHERE (owner_id = $1)) AS orders").count(),
        1
    );
}

#[tokio::test]
async fn catalog_views_are_refused_under_a_public_grant() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;

    for sql in [
        "SELECT rolname, rolsuper FROM pg_roles",
        "SELECT query FROM pg_stat_activity",
    ] {
        let err = h
            .service
            .execute(
                h.tenant,
                "db1",
                &Operation::raw(sql, true),
                &ExecutionOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_PERMISSION", "{sql}");
    }
    assert!(h.backend.calls().is_empty());

    h.settle().await;
    let entries = h.audit.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.outcome == AuditOutcome::Rejected));
}

#[tokio::test]
async fn identical_selects_return_identical_results() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;
    h.backend.with(|s| {
        s.columns = vec!["id".into(), "name".into()];
        s.rows = vec![vec![json!(1), json!("a")], vec![json!(2), json!("b")]];
    });

    let mut op = SelectOp::new("public", "users");
    op.columns = Some(vec!["id".into(), "name".into()]);
    let op = Operation::Select(op);
    let first = h
        .service
        .execute(h.tenant, "db1", &op, &ExecutionOptions::default())
        .await
        .unwrap();
    let second = h
        .service
        .execute(h.tenant, "db1", &op, &ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first.records()[1]["name"], "b");
}

#[tokio::test]
async fn control_database_is_refused_even_with_permissions() {
    let h = Harness::new().await;
    h.add_grant(h.tenant, "vibe_control").await;
    h.grant_schema("vibe_control", "public", PermissionLevel::ReadWrite)
        .await;

    let err = h
        .service
        .execute(
            h.tenant,
            "vibe_control",
            &select_all("tenants"),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN_OPERATION");

    let err = h
        .service
        .resolve_capabilities(h.tenant, "VIBE_CONTROL", "public", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN_OPERATION");

    assert!(h.backend.calls().is_empty());
    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Rejected);
}

#[tokio::test]
async fn read_only_request_cannot_insert() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadWrite).await;

    let err = h
        .service
        .execute(
            h.tenant,
            "db1",
            &Operation::raw("INSERT INTO t (a) VALUES (1)", true),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN_OPERATION");
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn drop_database_is_refused_for_any_tenant() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadWrite).await;

    let err = h
        .service
        .execute(
            h.tenant,
            "db1",
            &Operation::raw("DROP DATABASE db1", false),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FORBIDDEN_OPERATION");

    let entry = &h.audit.entries()[0];
    assert_eq!(entry.operation, "raw_sql");
    assert_eq!(entry.sql.as_deref(), Some("DROP DATABASE db1"));
}

#[tokio::test]
async fn update_on_read_only_schema_names_update() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;

    let op = Operation::Update(UpdateOp {
        schema: "public".into(),
        table: "t".into(),
        set: json!({"a": 1}).as_object().cloned().unwrap(),
        filters: vec![Filter::eq("id", json!(2))],
        returning: None,
    });
    let err = h
        .service
        .execute(h.tenant, "db1", &op, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AccessError::InsufficientPermission {
            capability: Capability::Update,
            object: "public.t".into()
        }
    );
    assert_eq!(h.audit.entries()[0].target(), "db1.public.t");
}

#[tokio::test]
async fn tenant_and_grant_are_checked_first() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;
    let options = ExecutionOptions::default();

    let err = h
        .service
        .execute(TenantId::new(), "db1", &select_all("t"), &options)
        .await
        .unwrap_err();
    assert_eq!(err, AccessError::TenantNotFound);

    let err = h
        .service
        .execute(h.tenant, "db2", &select_all("t"), &options)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "GRANT_NOT_FOUND");

    h.store.set_tenant_active(h.tenant, false).await.unwrap();
    let err = h
        .service
        .execute(h.tenant, "db1", &select_all("t"), &options)
        .await
        .unwrap_err();
    assert_eq!(err, AccessError::TenantInactive);

    assert!(h.backend.calls().is_empty());
    assert_eq!(h.audit.entries().len(), 3);
}

#[tokio::test]
async fn client_timeout_closes_the_connection() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;
    h.backend.with(|s| s.delay = Some(Duration::from_secs(5)));

    let timeout = Duration::from_millis(100);
    let err = h
        .service
        .execute(
            h.tenant,
            "db1",
            &select_all("t"),
            &ExecutionOptions::default().with_timeout(timeout),
        )
        .await
        .unwrap_err();
    assert_eq!(err, AccessError::ExecutionTimeout { timeout });
    assert!(err.is_retryable());

    let calls = h.backend.calls();
    assert!(calls.contains(&"discard".to_string()));
    assert!(!calls.contains(&"commit".to_string()));

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Failure);
    assert_eq!(entries[0].error_code.as_deref(), Some("EXECUTION_TIMEOUT"));
}

#[tokio::test]
async fn server_side_statement_timeout_is_a_timeout() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;
    h.backend.with(|s| {
        s.fail_with = Some((
            "canceling statement due to statement timeout".into(),
            Some("57014".into()),
        ))
    });

    let err = h
        .service
        .execute(h.tenant, "db1", &select_all("t"), &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "EXECUTION_TIMEOUT");
}

#[tokio::test]
async fn backend_errors_are_wrapped_and_rolled_back() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadWrite).await;
    h.backend.with(|s| {
        s.fail_with = Some((
            "duplicate key value violates unique constraint \"t_pkey\"".into(),
            Some("23505".into()),
        ))
    });

    let op = Operation::Insert(InsertOp {
        schema: "public".into(),
        table: "t".into(),
        rows: vec![json!({"id": 1}).as_object().cloned().unwrap()],
        returning: None,
    });
    let err = h
        .service
        .execute(h.tenant, "db1", &op, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "BACKEND_EXECUTION_ERROR");
    assert_eq!(err.details()["sqlstate"], "23505");
    assert!(!err.is_retryable());

    let calls = h.backend.calls();
    assert_eq!(calls.last().map(String::as_str), Some("rollback"));
    assert_eq!(h.audit.entries()[0].outcome, AuditOutcome::Failure);
}

#[tokio::test]
async fn written_rows_must_pass_the_row_check() {
    let h = Harness::new().await;
    h.grant_table("db1", "notes", &["select", "insert"]).await;
    h.policy(
        "db1",
        "notes",
        PolicyCommand::Insert,
        None,
        Some("owner_id = :tenant"),
    )
    .await;

    let op = Operation::Insert(InsertOp {
        schema: "public".into(),
        table: "notes".into(),
        rows: vec![
            json!({"body": "a", "owner_id": "x"}).as_object().cloned().unwrap(),
            json!({"body": "b", "owner_id": "y"}).as_object().cloned().unwrap(),
        ],
        returning: None,
    });

    h.backend.with(|s| {
        s.columns = vec![vibe_guard::CHECK_COLUMN.into()];
        s.rows = vec![vec![json!(true)], vec![json!(false)]];
    });
    let err = h
        .service
        .execute(h.tenant, "db1", &op, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        AccessError::RowPolicyViolation {
            object: "public.notes".into()
        }
    );
    let calls = h.backend.calls();
    assert_eq!(calls.last().map(String::as_str), Some("rollback"));
    assert!(!calls.contains(&"commit".to_string()));

    h.backend.with(|s| {
        s.calls.clear();
        s.rows = vec![vec![json!(true)], vec![json!(true)]];
    });
    let result = h
        .service
        .execute(h.tenant, "db1", &op, &ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(result.row_count, 2);
    assert!(result.columns.is_empty());
    assert_eq!(h.backend.calls().last().map(String::as_str), Some("commit"));
}

#[tokio::test]
async fn unavailable_connection_is_a_retryable_failure() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;
    h.backend.with(|s| s.refuse_connect = true);

    let err = h
        .service
        .execute(h.tenant, "db1", &select_all("t"), &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONNECTION_UNAVAILABLE");
    assert!(err.is_retryable());
    assert_eq!(h.audit.entries()[0].outcome, AuditOutcome::Failure);
}

#[tokio::test]
async fn cancelled_request_is_never_audited_as_success() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;
    h.backend.with(|s| s.delay = Some(Duration::from_secs(5)));

    let op = select_all("t");
    let options = ExecutionOptions::default();
    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        h.service.execute(h.tenant, "db1", &op, &options),
    )
    .await;
    assert!(outcome.is_err());
    h.settle().await;

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Cancelled);
}

#[tokio::test]
async fn one_audit_entry_per_attempt() {
    let h = Harness::new().await;
    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;
    let options = ExecutionOptions::default();

    h.service
        .execute(h.tenant, "db1", &select_all("t"), &options)
        .await
        .unwrap();
    h.service
        .execute(h.tenant, "db1", &Operation::raw("DELETE FROM t WHERE id = 1", false), &options)
        .await
        .unwrap_err();
    h.backend.with(|s| s.fail_with = Some(("boom".into(), None)));
    h.service
        .execute(h.tenant, "db1", &select_all("t"), &options)
        .await
        .unwrap_err();

    let outcomes: Vec<AuditOutcome> = h
        .service
        .engine()
        .audit()
        .query(AuditFilter::for_tenant(h.tenant))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.outcome)
        .collect();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.contains(&AuditOutcome::Success));
    assert!(outcomes.contains(&AuditOutcome::Rejected));
    assert!(outcomes.contains(&AuditOutcome::Failure));
}

#[tokio::test]
async fn capabilities_are_denied_by_default() {
    let h = Harness::new().await;
    let caps = h
        .service
        .resolve_capabilities(h.tenant, "db1", "public", Some("t"))
        .await
        .unwrap();
    assert!(caps.is_empty());

    h.grant_schema("db1", "public", PermissionLevel::ReadOnly).await;
    let caps = h
        .service
        .resolve_capabilities(h.tenant, "db1", "public", Some("t"))
        .await
        .unwrap();
    assert!(caps.allows(Capability::Select));
    assert!(!caps.allows(Capability::Insert));
}
