//! SQL parsing and analysis.

use std::fmt;
use std::ops::ControlFlow;

use sqlparser::ast::{ObjectName, Statement, Visit, visit_relations};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace, Word};

use crate::error::GuardError;
use crate::validated::StatementKind;

/// Schema assumed for unqualified table names.
pub const DEFAULT_SCHEMA: &str = "public";

/// Postgres searches the system catalog before any other schema, and every
/// relation in it is named `pg_*`.
pub const CATALOG_SCHEMA: &str = "pg_catalog";

fn implicit_schema(table: &str) -> &'static str {
    if table.starts_with("pg_") {
        CATALOG_SCHEMA
    } else {
        DEFAULT_SCHEMA
    }
}

/// A table referenced by a statement, with Postgres case folding applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationRef {
    /// Set only for three-part names.
    pub database: Option<String>,
    pub schema: String,
    pub table: String,
}

impl RelationRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: None,
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Resolve a parsed object name the way Postgres would.
    pub fn of_object(name: &ObjectName) -> Result<Self, GuardError> {
        Self::from_parts(split_object_name(&name.to_string()))
    }

    /// Same schema and table, whatever the database qualifier.
    pub fn same_table(&self, other: &RelationRef) -> bool {
        self.schema == other.schema && self.table == other.table
    }

    fn from_parts(mut parts: Vec<String>) -> Result<Self, GuardError> {
        let display = parts.join(".");
        let table = parts.pop();
        let schema = parts.pop();
        let database = parts.pop();
        match (database, schema, table) {
            (db, schema, Some(table)) if parts.is_empty() && !table.is_empty() => Ok(Self {
                database: db,
                schema: schema.unwrap_or_else(|| implicit_schema(&table).to_string()),
                table,
            }),
            _ => Err(GuardError::invalid(format!(
                "cannot resolve relation '{display}'"
            ))),
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for RelationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Everything the guard needs to know about one raw SQL statement.
#[derive(Debug, Clone)]
pub struct AnalyzedStatement {
    pub statement: Statement,
    pub kind: StatementKind,
    /// Tokens without whitespace or comments.
    pub tokens: Vec<Token>,
    /// The input with every comment replaced by a single space.
    pub normalized: String,
    /// Tables the statement writes to, drops, truncates, creates or alters.
    pub targets: Vec<RelationRef>,
    /// Every referenced table in visit order, CTE names excluded.
    pub relations: Vec<RelationRef>,
    /// Schema named by `CREATE SCHEMA`.
    pub schema: Option<String>,
    pub has_ctes: bool,
    pub returns_rows: bool,
    /// `INSERT ... ON CONFLICT ... DO UPDATE`.
    pub upsert: bool,
    /// `CREATE TABLE ... AS <query>`.
    pub create_as: bool,
    /// Highest `$n` placeholder used.
    pub max_placeholder: usize,
}

impl AnalyzedStatement {
    /// Referenced tables that are not targets. One occurrence of each target
    /// is removed, so a target read again in a subquery still shows up.
    pub fn sources(&self) -> Vec<&RelationRef> {
        let mut pending: Vec<&RelationRef> = self.targets.iter().collect();
        let mut sources = Vec::new();
        for relation in &self.relations {
            if let Some(i) = pending.iter().position(|t| *t == relation) {
                pending.swap_remove(i);
            } else {
                sources.push(relation);
            }
        }
        sources
    }

    /// Distinct tables touched in any way.
    pub fn distinct_relations(&self) -> Vec<&RelationRef> {
        let mut out: Vec<&RelationRef> = Vec::new();
        for relation in self.targets.iter().chain(&self.relations) {
            if !out.contains(&relation) {
                out.push(relation);
            }
        }
        out
    }
}

/// Parses and inspects raw SQL with the Postgres dialect.
pub struct SqlAnalyzer {
    dialect: PostgreSqlDialect,
}

impl Clone for SqlAnalyzer {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl Default for SqlAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SqlAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SqlAnalyzer(postgres)")
    }
}

impl SqlAnalyzer {
    pub fn new() -> Self {
        Self {
            dialect: PostgreSqlDialect {},
        }
    }

    /// Parse a SQL string into statements.
    pub fn parse(&self, sql: &str) -> Result<Vec<Statement>, GuardError> {
        Parser::parse_sql(&self.dialect, sql).map_err(|e| GuardError::ParseError(e.to_string()))
    }

    /// Tokenize, keeping whitespace and comments.
    pub fn tokenize(&self, sql: &str) -> Result<Vec<Token>, GuardError> {
        Tokenizer::new(&self.dialect, sql)
            .tokenize()
            .map_err(|e| GuardError::ParseError(e.to_string()))
    }

    /// Analyze exactly one statement.
    pub fn analyze(&self, sql: &str) -> Result<AnalyzedStatement, GuardError> {
        let raw_tokens = self.tokenize(sql)?;
        let normalized = strip_comments(&raw_tokens);
        let tokens: Vec<Token> = raw_tokens
            .into_iter()
            .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
            .collect();

        let mut statements = self.parse(sql)?;
        if statements.len() != 1 {
            return Err(GuardError::invalid(format!(
                "expected exactly one statement, found {}",
                statements.len()
            )));
        }
        let statement = statements.remove(0);
        let kind = classify(&statement, &tokens)?;
        if kind == StatementKind::Select {
            check_plain_query(&tokens)?;
        }

        let ctes = cte_names(&statement);
        let relations = collect_relations(&statement)?;

        let mut cursor = Cursor::new(&tokens);
        let (targets, schema) = match kind {
            StatementKind::CreateSchema => (Vec::new(), Some(cursor.create_schema_name()?)),
            _ => (cursor.targets(kind)?, None),
        };

        let returns_rows = kind == StatementKind::Select
            || tokens.iter().any(|t| is_keyword(t, "RETURNING"));
        let upsert = kind == StatementKind::Insert && contains_sequence(&tokens, &["DO", "UPDATE"]);
        let create_as = kind == StatementKind::CreateTable && has_top_level_keyword(&tokens, "AS");
        let max_placeholder = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Placeholder(p) => p.strip_prefix('$').and_then(|n| n.parse().ok()),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        Ok(AnalyzedStatement {
            statement,
            kind,
            tokens,
            normalized,
            targets,
            relations,
            schema,
            has_ctes: !ctes.is_empty(),
            returns_rows,
            upsert,
            create_as,
            max_placeholder,
        })
    }
}

fn classify(statement: &Statement, tokens: &[Token]) -> Result<StatementKind, GuardError> {
    let kind = match statement {
        Statement::Query(_) => StatementKind::Select,
        Statement::Insert { .. } => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete { .. } => StatementKind::Delete,
        Statement::Truncate { .. } => StatementKind::Truncate,
        Statement::CreateTable { .. } => StatementKind::CreateTable,
        Statement::AlterTable { .. } => StatementKind::AlterTable,
        Statement::Drop { .. } if starts_with(tokens, &["DROP", "TABLE"]) => {
            StatementKind::DropTable
        }
        Statement::CreateSchema { .. } => StatementKind::CreateSchema,
        _ => {
            let verb: Vec<String> = tokens
                .iter()
                .take(2)
                .filter_map(|t| match t {
                    Token::Word(w) => Some(w.value.to_ascii_uppercase()),
                    _ => None,
                })
                .collect();
            return Err(GuardError::forbidden(format!(
                "{} statements are not permitted",
                verb.join(" ")
            )));
        }
    };
    Ok(kind)
}

/// Queries may not write: no data-modifying CTEs and no `SELECT INTO`.
fn check_plain_query(tokens: &[Token]) -> Result<(), GuardError> {
    for (i, token) in tokens.iter().enumerate() {
        let row_lock = i > 0 && (is_keyword(&tokens[i - 1], "FOR") || is_keyword(&tokens[i - 1], "KEY"));
        if ["INSERT", "DELETE", "MERGE"].iter().any(|k| is_keyword(token, k))
            || (is_keyword(token, "UPDATE") && !row_lock)
        {
            return Err(GuardError::forbidden(
                "data-modifying statements inside a query are not supported",
            ));
        }
        if is_keyword(token, "INTO") {
            return Err(GuardError::forbidden("SELECT INTO is not permitted"));
        }
    }
    Ok(())
}

fn cte_names(statement: &Statement) -> Vec<String> {
    match statement {
        Statement::Query(query) => query
            .with
            .as_ref()
            .map(|with| {
                with.cte_tables
                    .iter()
                    .map(|cte| fold(&cte.alias.name.value, cte.alias.name.quote_style))
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Referenced tables, leaving out names that resolve to a CTE. A plain
/// `WITH` only makes a CTE visible to the CTEs after it and to the main
/// query, so `WITH t AS (SELECT * FROM t)` still reads the real table `t`.
fn collect_relations(statement: &Statement) -> Result<Vec<RelationRef>, GuardError> {
    let mut names = Vec::new();
    match statement {
        Statement::Query(query) if query.with.is_some() => {
            let mut main = query.clone();
            if let Some(with) = main.with.take() {
                let ctes: Vec<String> = with
                    .cte_tables
                    .iter()
                    .map(|cte| fold(&cte.alias.name.value, cte.alias.name.quote_style))
                    .collect();
                for (i, cte) in with.cte_tables.iter().enumerate() {
                    let visible = if with.recursive { &ctes[..] } else { &ctes[..i] };
                    push_relations(&cte.query, visible, &mut names);
                }
                push_relations(&main, &ctes, &mut names);
            }
        }
        other => push_relations(other, &[], &mut names),
    }
    names.into_iter().map(RelationRef::from_parts).collect()
}

fn push_relations<V: Visit>(node: &V, ctes: &[String], out: &mut Vec<Vec<String>>) {
    let _ = visit_relations(node, |name: &ObjectName| {
        let parts = split_object_name(&name.to_string());
        if !(parts.len() == 1 && ctes.contains(&parts[0])) {
            out.push(parts);
        }
        ControlFlow::<()>::Continue(())
    });
}

/// Split a rendered object name on dots outside double quotes. Unquoted
/// parts fold to lower case like Postgres does.
pub fn split_object_name(name: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut chars = name.trim().chars().peekable();
    let mut current = String::new();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        match c {
            '"' if current.is_empty() && !quoted => {
                quoted = true;
                while let Some(q) = chars.next() {
                    if q == '"' {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            current.push('"');
                        } else {
                            break;
                        }
                    } else {
                        current.push(q);
                    }
                }
            }
            '.' => {
                parts.push(finish_part(&mut current, quoted));
                quoted = false;
            }
            c if c.is_whitespace() => {}
            c => current.push(c),
        }
    }
    parts.push(finish_part(&mut current, quoted));
    parts
}

fn finish_part(current: &mut String, quoted: bool) -> String {
    let part = std::mem::take(current);
    if quoted { part } else { part.to_ascii_lowercase() }
}

fn fold(value: &str, quote_style: Option<char>) -> String {
    match quote_style {
        Some(_) => value.to_string(),
        None => value.to_ascii_lowercase(),
    }
}

fn fold_word(word: &Word) -> String {
    fold(&word.value, word.quote_style)
}

/// Whether `token` is the unquoted keyword `keyword`.
pub(crate) fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
}

fn starts_with(tokens: &[Token], keywords: &[&str]) -> bool {
    tokens.len() >= keywords.len() && keywords.iter().zip(tokens).all(|(k, t)| is_keyword(t, k))
}

fn contains_sequence(tokens: &[Token], keywords: &[&str]) -> bool {
    (0..tokens.len()).any(|i| starts_with(&tokens[i..], keywords))
}

fn has_top_level_keyword(tokens: &[Token], keyword: &str) -> bool {
    let mut depth = 0usize;
    for token in tokens {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            t if depth == 0 && is_keyword(t, keyword) => return true,
            _ => {}
        }
    }
    false
}

pub(crate) fn strip_comments(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Whitespace(Whitespace::SingleLineComment { .. })
            | Token::Whitespace(Whitespace::MultiLineComment(_)) => out.push(' '),
            Token::EOF => {}
            other => out.push_str(&other.to_string()),
        }
    }
    out
}

/// Walks the leading keywords of DDL and DML statements to find the
/// object names they act on.
struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.tokens.get(self.pos).is_some_and(|t| is_keyword(t, keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let found = self.peek_keyword(keyword);
        if found {
            self.pos += 1;
        }
        found
    }

    fn eat_sequence(&mut self, keywords: &[&str]) -> bool {
        let found = starts_with(&self.tokens[self.pos.min(self.tokens.len())..], keywords);
        if found {
            self.pos += keywords.len();
        }
        found
    }

    fn expect_sequence(&mut self, keywords: &[&str]) -> Result<(), GuardError> {
        if self.eat_sequence(keywords) {
            Ok(())
        } else {
            Err(GuardError::invalid(format!("expected {}", keywords.join(" "))))
        }
    }

    fn eat_token(&mut self, expected: &Token) -> bool {
        let found = self.tokens.get(self.pos) == Some(expected);
        if found {
            self.pos += 1;
        }
        found
    }

    fn object_name(&mut self) -> Result<Vec<String>, GuardError> {
        let mut parts = Vec::new();
        loop {
            match self.tokens.get(self.pos) {
                Some(Token::Word(w)) => {
                    parts.push(fold_word(w));
                    self.pos += 1;
                }
                _ => return Err(GuardError::invalid("expected an object name")),
            }
            if !self.eat_token(&Token::Period) {
                return Ok(parts);
            }
        }
    }

    fn relation(&mut self) -> Result<RelationRef, GuardError> {
        RelationRef::from_parts(self.object_name()?)
    }

    fn relation_list(&mut self) -> Result<Vec<RelationRef>, GuardError> {
        let mut out = Vec::new();
        loop {
            self.eat_keyword("ONLY");
            out.push(self.relation()?);
            self.eat_token(&Token::Mul);
            if !self.eat_token(&Token::Comma) {
                return Ok(out);
            }
        }
    }

    fn targets(&mut self, kind: StatementKind) -> Result<Vec<RelationRef>, GuardError> {
        match kind {
            StatementKind::Select => Ok(Vec::new()),
            StatementKind::Insert => {
                self.expect_sequence(&["INSERT", "INTO"])?;
                Ok(vec![self.relation()?])
            }
            StatementKind::Update => {
                self.expect_sequence(&["UPDATE"])?;
                self.eat_keyword("ONLY");
                Ok(vec![self.relation()?])
            }
            StatementKind::Delete => {
                self.expect_sequence(&["DELETE", "FROM"])?;
                self.eat_keyword("ONLY");
                Ok(vec![self.relation()?])
            }
            StatementKind::Truncate => {
                self.expect_sequence(&["TRUNCATE"])?;
                self.eat_keyword("TABLE");
                self.relation_list()
            }
            StatementKind::CreateTable => {
                self.expect_sequence(&["CREATE"])?;
                while !self.eat_keyword("TABLE") {
                    if self.peek_keyword("TEMP") || self.peek_keyword("TEMPORARY") {
                        return Err(GuardError::forbidden("temporary tables are not supported"));
                    }
                    if self.pos >= self.tokens.len() {
                        return Err(GuardError::invalid("expected TABLE"));
                    }
                    self.pos += 1;
                }
                self.eat_sequence(&["IF", "NOT", "EXISTS"]);
                Ok(vec![self.relation()?])
            }
            StatementKind::AlterTable => {
                self.expect_sequence(&["ALTER", "TABLE"])?;
                self.eat_sequence(&["IF", "EXISTS"]);
                self.eat_keyword("ONLY");
                Ok(vec![self.relation()?])
            }
            StatementKind::DropTable => {
                self.expect_sequence(&["DROP", "TABLE"])?;
                self.eat_sequence(&["IF", "EXISTS"]);
                self.relation_list()
            }
            StatementKind::CreateSchema => Ok(Vec::new()),
        }
    }

    fn create_schema_name(&mut self) -> Result<String, GuardError> {
        self.expect_sequence(&["CREATE", "SCHEMA"])?;
        self.eat_sequence(&["IF", "NOT", "EXISTS"]);
        if self.peek_keyword("AUTHORIZATION") {
            return Err(GuardError::forbidden("CREATE SCHEMA AUTHORIZATION is not permitted"));
        }
        let mut parts = self.object_name()?;
        if parts.len() != 1 {
            return Err(GuardError::invalid("schema names cannot be qualified"));
        }
        if self.peek_keyword("AUTHORIZATION") {
            return Err(GuardError::forbidden("CREATE SCHEMA AUTHORIZATION is not permitted"));
        }
        Ok(parts.remove(0))
    }
}
