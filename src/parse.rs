//! SQL text to [`Statement`].
//!
//! CREATE TABLE, DROP TABLE, SHOW TABLES and SHOW COLUMNS go through
//! `sqlparser`; the index statements are recognized from tokens first because
//! the MySQL dialect does not cover all of their forms.

use crate::error::SqlExecError;
use crate::model::Identifier;
use sqlparser::ast::{self, ObjectName, ObjectNamePart};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclaredType {
    Int,
    Text,
    /// Anything else the parser accepted; rejected when the table is created.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: Identifier,
    pub data_type: DeclaredType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTableStatement {
    pub table_name: Identifier,
    pub columns: Vec<ColumnDefinition>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    BTree,
    Hash,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::BTree => "BTREE",
            IndexKind::Hash => "HASH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIndexStatement {
    pub index_name: Identifier,
    pub table_name: Identifier,
    pub columns: Vec<Identifier>,
    pub index_kind: IndexKind,
    pub unique: bool,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropKind {
    Table,
    Index,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropStatement {
    pub kind: DropKind,
    /// The dropped table, or the table owning the dropped index.
    pub name: Identifier,
    pub index_name: Option<Identifier>,
    pub if_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowKind {
    Tables,
    Columns,
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowStatement {
    pub kind: ShowKind,
    pub table_name: Option<Identifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    CreateTable(CreateTableStatement),
    CreateIndex(CreateIndexStatement),
    Drop(DropStatement),
    Show(ShowStatement),
    /// Parsed fine but not handled by the executor.
    Other(String),
}

pub fn parse_sql(raw_query: &str) -> Result<Vec<Statement>, SqlExecError> {
    let q = strip_trailing_semicolon(raw_query);
    if q.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(stmt) = try_parse_index_statement(q) {
        return stmt.map(|s| vec![s]);
    }

    let dialect = MySqlDialect {};
    let ast = Parser::parse_sql(&dialect, q).map_err(|e| SqlExecError::Parse(e.to_string()))?;
    let mut out = Vec::with_capacity(ast.len());
    for stmt in &ast {
        out.extend(lower_statement(stmt)?);
    }
    Ok(out)
}

/// `DROP TABLE a, b` lowers to one statement per name.
fn lower_statement(stmt: &ast::Statement) -> Result<Vec<Statement>, SqlExecError> {
    let single = match stmt {
        ast::Statement::CreateTable(c) => Statement::CreateTable(CreateTableStatement {
            table_name: object_name(&c.name)?,
            columns: c
                .columns
                .iter()
                .map(|col| ColumnDefinition {
                    name: col.name.value.clone(),
                    data_type: declared_type(&col.data_type),
                })
                .collect(),
            if_not_exists: c.if_not_exists,
        }),
        ast::Statement::Drop {
            object_type,
            names,
            if_exists,
            ..
        } => {
            if names.is_empty() {
                return Err(SqlExecError::Parse("DROP requires a name".into()));
            }
            let kind = match object_type {
                ast::ObjectType::Table => DropKind::Table,
                other => DropKind::Other(other.to_string()),
            };
            return names
                .iter()
                .map(|name| {
                    Ok(Statement::Drop(DropStatement {
                        kind: kind.clone(),
                        name: object_name(name)?,
                        index_name: None,
                        if_exists: *if_exists,
                    }))
                })
                .collect();
        }
        ast::Statement::ShowTables { .. } => Statement::Show(ShowStatement {
            kind: ShowKind::Tables,
            table_name: None,
        }),
        ast::Statement::ShowColumns { show_options, .. } => {
            let table = show_options
                .show_in
                .as_ref()
                .and_then(|show_in| show_in.parent_name.as_ref())
                .ok_or_else(|| SqlExecError::Parse("SHOW COLUMNS requires FROM <table>".into()))?;
            Statement::Show(ShowStatement {
                kind: ShowKind::Columns,
                table_name: Some(object_name(table)?),
            })
        }
        other => Statement::Other(other.to_string()),
    };
    Ok(vec![single])
}

fn declared_type(data_type: &ast::DataType) -> DeclaredType {
    match data_type {
        ast::DataType::Int(_) | ast::DataType::Integer(_) => DeclaredType::Int,
        ast::DataType::Text => DeclaredType::Text,
        other => DeclaredType::Other(other.to_string()),
    }
}

fn get_ident_name(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(i) => i.value.clone(),
        _ => "".to_string(),
    }
}

fn object_name(name: &ObjectName) -> Result<Identifier, SqlExecError> {
    match name.0.as_slice() {
        [part] => Ok(get_ident_name(part)),
        _ => Err(SqlExecError::Parse(format!(
            "qualified names are not supported: {name}"
        ))),
    }
}

fn strip_trailing_semicolon(s: &str) -> &str {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix(';') {
        stripped.trim()
    } else {
        s
    }
}

/// Splits on whitespace and keeps `(`, `)` and `,` as tokens of their own.
fn split_sql_tokens(query: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    let mut in_bq = false;
    let mut in_dq = false;

    for (i, ch) in query.char_indices() {
        match ch {
            '`' if !in_dq => {
                if start.is_none() {
                    start = Some(i);
                }
                in_bq = !in_bq;
            }
            '"' if !in_bq => {
                if start.is_none() {
                    start = Some(i);
                }
                in_dq = !in_dq;
            }
            '(' | ')' | ',' if !in_bq && !in_dq => {
                if let Some(s) = start.take() {
                    tokens.push(&query[s..i]);
                }
                tokens.push(&query[i..i + 1]);
            }
            w if w.is_whitespace() && !in_bq && !in_dq => {
                if let Some(s) = start.take() {
                    tokens.push(&query[s..i]);
                }
            }
            _ => {
                if start.is_none() {
                    start = Some(i);
                }
            }
        }
    }
    if let Some(s) = start {
        tokens.push(&query[s..]);
    }
    tokens
}

fn unquote_identifier(token: &str) -> String {
    let t = token.trim();
    if let Some(stripped) = t.strip_prefix('`').and_then(|s| s.strip_suffix('`')) {
        stripped.replace("``", "`")
    } else if let Some(stripped) = t.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        stripped.replace("\"\"", "\"")
    } else {
        t.to_string()
    }
}

struct TokenCursor<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> TokenCursor<'a> {
    fn new(tokens: Vec<&'a str>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.tokens.get(self.pos) {
            Some(t) if t.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), SqlExecError> {
        if self.eat_keyword(keyword) {
            return Ok(());
        }
        Err(SqlExecError::Parse(match self.tokens.get(self.pos) {
            Some(t) => format!("expected {} but found {t}", keyword.to_ascii_uppercase()),
            None => format!("expected {} at end of statement", keyword.to_ascii_uppercase()),
        }))
    }

    fn expect_ident(&mut self, what: &str) -> Result<Identifier, SqlExecError> {
        match self.tokens.get(self.pos) {
            Some(t) if !matches!(*t, "(" | ")" | ",") => {
                self.pos += 1;
                Ok(unquote_identifier(t))
            }
            _ => Err(SqlExecError::Parse(format!("expected {what}"))),
        }
    }

    fn expect_index_kind(&mut self) -> Result<IndexKind, SqlExecError> {
        if self.eat_keyword("btree") {
            Ok(IndexKind::BTree)
        } else if self.eat_keyword("hash") {
            Ok(IndexKind::Hash)
        } else {
            Err(SqlExecError::Parse("USING expects BTREE or HASH".into()))
        }
    }

    fn expect_end(&self) -> Result<(), SqlExecError> {
        match self.tokens.get(self.pos) {
            None => Ok(()),
            Some(t) => Err(SqlExecError::Parse(format!("unexpected {t}"))),
        }
    }
}

fn try_parse_index_statement(query: &str) -> Option<Result<Statement, SqlExecError>> {
    let tokens = split_sql_tokens(query);
    let is = |i: usize, keyword: &str| {
        tokens
            .get(i)
            .is_some_and(|t| t.eq_ignore_ascii_case(keyword))
    };

    if is(0, "show") && (is(1, "index") || is(1, "indexes") || is(1, "keys")) {
        return Some(parse_show_index(TokenCursor::new(tokens)));
    }
    if is(0, "drop") && is(1, "index") {
        return Some(parse_drop_index(TokenCursor::new(tokens)));
    }
    if is(0, "create") && (is(1, "index") || (is(1, "unique") && is(2, "index"))) {
        return Some(parse_create_index(TokenCursor::new(tokens)));
    }
    None
}

fn parse_show_index(mut c: TokenCursor<'_>) -> Result<Statement, SqlExecError> {
    c.pos = 2;
    if !c.eat_keyword("from") && !c.eat_keyword("in") {
        return Err(SqlExecError::Parse(
            "SHOW INDEX requires FROM <table>".into(),
        ));
    }
    let table_name = c.expect_ident("table name")?;
    c.expect_end()?;
    Ok(Statement::Show(ShowStatement {
        kind: ShowKind::Index,
        table_name: Some(table_name),
    }))
}

fn parse_drop_index(mut c: TokenCursor<'_>) -> Result<Statement, SqlExecError> {
    c.pos = 2;
    let if_exists = if c.eat_keyword("if") {
        c.expect_keyword("exists")?;
        true
    } else {
        false
    };
    let index_name = c.expect_ident("index name")?;
    if !c.eat_keyword("on") && !c.eat_keyword("from") {
        return Err(SqlExecError::Parse(
            "DROP INDEX requires ON <table>".into(),
        ));
    }
    let table_name = c.expect_ident("table name")?;
    c.expect_end()?;
    Ok(Statement::Drop(DropStatement {
        kind: DropKind::Index,
        name: table_name,
        index_name: Some(index_name),
        if_exists,
    }))
}

fn parse_create_index(mut c: TokenCursor<'_>) -> Result<Statement, SqlExecError> {
    c.expect_keyword("create")?;
    let unique = c.eat_keyword("unique");
    c.expect_keyword("index")?;
    let if_not_exists = if c.eat_keyword("if") {
        c.expect_keyword("not")?;
        c.expect_keyword("exists")?;
        true
    } else {
        false
    };
    let index_name = c.expect_ident("index name")?;
    c.expect_keyword("on")?;
    let table_name = c.expect_ident("table name")?;

    let mut index_kind = None;
    if c.eat_keyword("using") {
        index_kind = Some(c.expect_index_kind()?);
    }

    c.expect_keyword("(")?;
    let mut columns = vec![c.expect_ident("column name")?];
    while c.eat_keyword(",") {
        columns.push(c.expect_ident("column name")?);
    }
    c.expect_keyword(")")?;

    if c.eat_keyword("using") {
        if index_kind.is_some() {
            return Err(SqlExecError::Parse("USING given twice".into()));
        }
        index_kind = Some(c.expect_index_kind()?);
    }
    c.expect_end()?;

    Ok(Statement::CreateIndex(CreateIndexStatement {
        index_name,
        table_name,
        columns,
        index_kind: index_kind.unwrap_or(IndexKind::BTree),
        unique,
        if_not_exists,
    }))
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclaredType::Int => f.write_str("INT"),
            DeclaredType::Text => f.write_str("TEXT"),
            DeclaredType::Other(name) => f.write_str(name),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::CreateTable(c) => {
                write!(f, "CREATE TABLE ")?;
                if c.if_not_exists {
                    write!(f, "IF NOT EXISTS ")?;
                }
                let columns: Vec<String> = c
                    .columns
                    .iter()
                    .map(|col| format!("{} {}", col.name, col.data_type))
                    .collect();
                write!(f, "{} ({})", c.table_name, columns.join(", "))
            }
            Statement::CreateIndex(c) => {
                write!(f, "CREATE ")?;
                if c.unique {
                    write!(f, "UNIQUE ")?;
                }
                write!(f, "INDEX ")?;
                if c.if_not_exists {
                    write!(f, "IF NOT EXISTS ")?;
                }
                write!(
                    f,
                    "{} ON {} USING {} ({})",
                    c.index_name,
                    c.table_name,
                    c.index_kind.as_str(),
                    c.columns.join(", ")
                )
            }
            Statement::Drop(d) => match &d.kind {
                DropKind::Table if d.if_exists => write!(f, "DROP TABLE IF EXISTS {}", d.name),
                DropKind::Table => write!(f, "DROP TABLE {}", d.name),
                DropKind::Index => write!(
                    f,
                    "DROP INDEX {}{} FROM {}",
                    if d.if_exists { "IF EXISTS " } else { "" },
                    d.index_name.as_deref().unwrap_or("?"),
                    d.name
                ),
                DropKind::Other(kind) => write!(f, "DROP {kind} {}", d.name),
            },
            Statement::Show(s) => match (s.kind, s.table_name.as_deref()) {
                (ShowKind::Tables, _) => write!(f, "SHOW TABLES"),
                (ShowKind::Columns, table) => {
                    write!(f, "SHOW COLUMNS FROM {}", table.unwrap_or("?"))
                }
                (ShowKind::Index, table) => write!(f, "SHOW INDEX FROM {}", table.unwrap_or("?")),
            },
            Statement::Other(text) => f.write_str(text),
        }
    }
}
