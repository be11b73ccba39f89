//! A tiny engine that evaluates literal selects over in-memory tables.
//!
//! Understands `SELECT <literal>, ...` (integers, floats, quoted strings, booleans, NULL,
//! `$n` parameters, `::type` casts and `AS` aliases), `SELECT * FROM <table>`,
//! `SELECT pg_sleep(<seconds>)`, transaction control, `SET`, `COPY <table> TO STDOUT` and
//! `COPY <table> FROM STDIN`.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use tracing::debug;

use crate::engine::{
    Column, CommandTag, CopySink, Description, Engine, ExecutionError, QueryResult, Row,
    SessionInfo,
};
use crate::error::sql_state;
use crate::types::{oid, DefaultFormat, FormatCode, Oid, Value, ValueFormat};

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

type Tables = Arc<Mutex<HashMap<String, Table>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap to clone; clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct LiteralEngine {
    tables: Tables,
}

impl LiteralEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table. Names are case insensitive.
    pub fn with_table(self, name: &str, columns: &[(&str, Oid)], rows: Vec<Row>) -> Self {
        let columns = columns
            .iter()
            .enumerate()
            .map(|(i, (name, type_oid))| Column {
                column_id: i16::try_from(i + 1).unwrap_or(i16::MAX),
                ..Column::new(*name, *type_oid)
            })
            .collect();

        lock(&self.tables).insert(name.to_ascii_lowercase(), Table { columns, rows });
        self
    }

    /// Current contents of a table.
    pub fn rows(&self, table: &str) -> Option<Vec<Row>> {
        lock(&self.tables)
            .get(&table.to_ascii_lowercase())
            .map(|table| table.rows.clone())
    }

    fn table(&self, name: &str) -> Result<Table, ExecutionError> {
        lock(&self.tables)
            .get(name)
            .cloned()
            .ok_or_else(|| undefined_table(name))
    }

    fn describe_plan(
        &self,
        plan: &Plan,
        parameter_types: &[Oid],
    ) -> Result<Description, ExecutionError> {
        let fixed = |n: usize| parameter_types.get(n - 1).copied().filter(|oid| *oid != 0);

        let description = match plan {
            Plan::Literals(items) => {
                let count = items
                    .iter()
                    .filter_map(|item| item.parameter())
                    .max()
                    .unwrap_or(0)
                    .max(parameter_types.len());
                let parameters = (1..=count)
                    .map(|n| {
                        fixed(n)
                            .or_else(|| {
                                items
                                    .iter()
                                    .find(|item| item.parameter() == Some(n) && item.type_oid != 0)
                                    .map(|item| item.type_oid)
                            })
                            .unwrap_or(oid::TEXT)
                    })
                    .collect::<Vec<_>>();
                let columns = items
                    .iter()
                    .map(|item| {
                        let type_oid = match (item.type_oid, item.parameter()) {
                            (0, Some(n)) => parameters.get(n - 1).copied().unwrap_or(oid::TEXT),
                            (type_oid, _) => type_oid,
                        };
                        Column::new(item.name.as_str(), type_oid)
                    })
                    .collect();
                Description {
                    parameters,
                    columns,
                }
            }
            Plan::Scan(name) => Description {
                parameters: resolve_unspecified(parameter_types),
                columns: self.table(name)?.columns,
            },
            Plan::Sleep(_) => Description {
                parameters: resolve_unspecified(parameter_types),
                columns: vec![Column::new("pg_sleep", oid::VOID)],
            },
            Plan::Command(_) | Plan::CopyTo(_) | Plan::CopyFrom(_) => Description {
                parameters: resolve_unspecified(parameter_types),
                columns: Vec::new(),
            },
        };

        Ok(description)
    }
}

fn resolve_unspecified(parameter_types: &[Oid]) -> Vec<Oid> {
    parameter_types
        .iter()
        .map(|oid| if *oid == 0 { oid::TEXT } else { *oid })
        .collect()
}

impl Engine for LiteralEngine {
    async fn describe(
        &self,
        _session: &SessionInfo,
        query: &str,
        parameter_types: &[Oid],
    ) -> Result<Description, ExecutionError> {
        let plan = plan(query)?;
        self.describe_plan(&plan, parameter_types)
    }

    async fn execute(
        &self,
        _session: &SessionInfo,
        query: &str,
        parameters: &[Value],
    ) -> Result<QueryResult, ExecutionError> {
        let plan = plan(query)?;
        debug!(?plan, "executing");

        let result = match plan {
            Plan::Literals(items) => {
                let mut columns = Vec::with_capacity(items.len());
                let mut row = Vec::with_capacity(items.len());
                for item in items {
                    let value = match item.expr {
                        Expr::Const(value) => value,
                        Expr::Param(n) => parameters.get(n - 1).cloned().ok_or_else(|| {
                            ExecutionError::new(
                                sql_state::UNDEFINED_PARAMETER,
                                format!("there is no parameter ${n}"),
                            )
                        })?,
                    };
                    let (type_oid, value) = match item.type_oid {
                        0 => (value.type_oid(), value),
                        type_oid => (type_oid, cast(value, type_oid)?),
                    };
                    columns.push(Column::new(item.name, type_oid));
                    row.push(value);
                }
                QueryResult::Rows {
                    columns,
                    rows: stream::iter([Ok(row)]).boxed(),
                }
            }
            Plan::Scan(name) => {
                let table = self.table(&name)?;
                QueryResult::Rows {
                    columns: table.columns,
                    rows: stream::iter(table.rows.into_iter().map(Ok)).boxed(),
                }
            }
            Plan::Sleep(seconds) => {
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                QueryResult::Rows {
                    columns: vec![Column::new("pg_sleep", oid::VOID)],
                    rows: stream::iter([Ok(vec![Value::Null])]).boxed(),
                }
            }
            Plan::Command(command) => QueryResult::Command(CommandTag::new(command)),
            Plan::CopyTo(name) => {
                let table = self.table(&name)?;
                QueryResult::CopyOut {
                    columns: table.columns.len(),
                    data: stream::iter(table.rows.into_iter().map(|row| Ok(copy_line(&row))))
                        .boxed(),
                }
            }
            Plan::CopyFrom(name) => {
                let table = self.table(&name)?;
                QueryResult::CopyIn {
                    columns: table.columns.len(),
                    sink: Box::new(TableSink {
                        tables: self.tables.clone(),
                        types: table.columns.iter().map(|c| c.type_oid).collect(),
                        table: name,
                        pending: BytesMut::new(),
                        rows: Vec::new(),
                    }),
                }
            }
        };

        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Const(Value),
    /// 1-based parameter reference.
    Param(usize),
}

#[derive(Debug, Clone, PartialEq)]
struct Item {
    name: String,
    /// Zero when the type comes from an uncast parameter.
    type_oid: Oid,
    expr: Expr,
}

impl Item {
    fn parameter(&self) -> Option<usize> {
        match self.expr {
            Expr::Param(n) => Some(n),
            Expr::Const(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Plan {
    Literals(Vec<Item>),
    Scan(String),
    Sleep(f64),
    Command(&'static str),
    CopyTo(String),
    CopyFrom(String),
}

fn syntax_error(near: &str) -> ExecutionError {
    ExecutionError::syntax(format!("syntax error at or near \"{near}\""))
}

fn undefined_table(name: &str) -> ExecutionError {
    ExecutionError::new(
        sql_state::UNDEFINED_TABLE,
        format!("relation \"{name}\" does not exist"),
    )
}

fn plan(query: &str) -> Result<Plan, ExecutionError> {
    let sql = query.trim().trim_end_matches(';').trim_end();
    let words = sql.split_whitespace().collect::<Vec<_>>();
    let Some(first) = words.first() else {
        return Err(syntax_error(sql));
    };

    let plan = match first.to_ascii_uppercase().as_str() {
        "BEGIN" => Plan::Command("BEGIN"),
        "START" => match words.get(1) {
            Some(word) if word.eq_ignore_ascii_case("TRANSACTION") => Plan::Command("BEGIN"),
            _ => return Err(syntax_error(first)),
        },
        "COMMIT" | "END" => Plan::Command("COMMIT"),
        "ROLLBACK" | "ABORT" => Plan::Command("ROLLBACK"),
        "SET" => Plan::Command("SET"),
        "SELECT" => plan_select(sql[first.len()..].trim())?,
        "COPY" => plan_copy(&words[1..])?,
        _ => return Err(syntax_error(first)),
    };
    Ok(plan)
}

fn plan_select(rest: &str) -> Result<Plan, ExecutionError> {
    let words = rest.split_whitespace().collect::<Vec<_>>();
    if let ["*", from, table] = words.as_slice() {
        if from.eq_ignore_ascii_case("FROM") {
            return Ok(Plan::Scan(identifier(table)));
        }
    }

    let lower = rest.to_ascii_lowercase();
    if let Some(arg) = lower
        .strip_prefix("pg_sleep(")
        .and_then(|arg| arg.strip_suffix(')'))
    {
        let arg = arg.trim();
        let seconds = arg
            .parse::<f64>()
            .ok()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .ok_or_else(|| {
                ExecutionError::new(
                    sql_state::INVALID_TEXT_REPRESENTATION,
                    format!("invalid input syntax for type double precision: \"{arg}\""),
                )
            })?;
        return Ok(Plan::Sleep(seconds));
    }

    if rest.is_empty() {
        return Ok(Plan::Literals(Vec::new()));
    }

    split_items(rest)?
        .into_iter()
        .map(parse_item)
        .collect::<Result<_, _>>()
        .map(Plan::Literals)
}

fn plan_copy(words: &[&str]) -> Result<Plan, ExecutionError> {
    match words {
        [table, to, stdout]
            if to.eq_ignore_ascii_case("TO") && stdout.eq_ignore_ascii_case("STDOUT") =>
        {
            Ok(Plan::CopyTo(identifier(table)))
        }
        [table, from, stdin]
            if from.eq_ignore_ascii_case("FROM") && stdin.eq_ignore_ascii_case("STDIN") =>
        {
            Ok(Plan::CopyFrom(identifier(table)))
        }
        _ => Err(ExecutionError::new(
            sql_state::FEATURE_NOT_SUPPORTED,
            "only COPY <table> TO STDOUT and COPY <table> FROM STDIN are supported",
        )),
    }
}

fn identifier(word: &str) -> String {
    match word.strip_prefix('"').and_then(|w| w.strip_suffix('"')) {
        Some(quoted) => quoted.to_owned(),
        None => word.to_ascii_lowercase(),
    }
}

fn is_identifier(word: &str) -> bool {
    !word.is_empty()
        && !word.starts_with(|c: char| c.is_ascii_digit())
        && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn outside_quotes(prefix: &str) -> bool {
    prefix.matches('\'').count() % 2 == 0
}

/// Splits a select list on commas outside of string literals.
fn split_items(text: &str) -> Result<Vec<&str>, ExecutionError> {
    let mut items = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in text.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            ',' if !quoted => {
                items.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return Err(ExecutionError::syntax("unterminated quoted string"));
    }
    items.push(text[start..].trim());

    if items.iter().any(|item| item.is_empty()) {
        return Err(syntax_error(","));
    }
    Ok(items)
}

fn split_alias(text: &str) -> (&str, Option<String>) {
    if let Some(pos) = text.to_ascii_lowercase().rfind(" as ") {
        let (expr, alias) = (text[..pos].trim(), text[pos + 4..].trim());
        let bare = alias.trim_matches('"');
        if outside_quotes(expr) && is_identifier(bare) {
            return (expr, Some(identifier(alias)));
        }
    }
    (text, None)
}

fn split_cast(text: &str) -> (&str, Option<&str>) {
    if let Some(pos) = text.rfind("::") {
        let (expr, type_name) = (text[..pos].trim(), text[pos + 2..].trim());
        if outside_quotes(expr) && is_identifier(type_name) {
            return (expr, Some(type_name));
        }
    }
    (text, None)
}

fn cast_type(name: &str) -> Result<Oid, ExecutionError> {
    let type_oid = match name.to_ascii_lowercase().as_str() {
        "int2" | "smallint" => oid::INT2,
        "int" | "int4" | "integer" => oid::INT4,
        "int8" | "bigint" => oid::INT8,
        "float4" | "real" => oid::FLOAT4,
        "float8" => oid::FLOAT8,
        "bool" | "boolean" => oid::BOOL,
        "text" => oid::TEXT,
        "varchar" => oid::VARCHAR,
        "bytea" => oid::BYTEA,
        other => {
            return Err(ExecutionError::new(
                sql_state::UNDEFINED_OBJECT,
                format!("type \"{other}\" does not exist"),
            ))
        }
    };
    Ok(type_oid)
}

/// Converts a value to another type through its text form.
fn cast(value: Value, type_oid: Oid) -> Result<Value, ExecutionError> {
    if value.is_null() || value.type_oid() == type_oid {
        return Ok(value);
    }
    DefaultFormat.parse(type_oid, FormatCode::Text, Some(value.to_string().as_bytes()))
}

fn parse_item(text: &str) -> Result<Item, ExecutionError> {
    let (text, alias) = split_alias(text);
    let (literal, cast_to) = split_cast(text);
    let expr = parse_literal(literal)?;

    let (expr, type_oid, name) = match cast_to {
        Some(type_name) => {
            let type_oid = cast_type(type_name)?;
            let expr = match expr {
                Expr::Const(value) => Expr::Const(cast(value, type_oid)?),
                param => param,
            };
            (expr, type_oid, type_name.to_ascii_lowercase())
        }
        None => {
            let type_oid = match &expr {
                Expr::Const(value) => value.type_oid(),
                Expr::Param(_) => 0,
            };
            (expr, type_oid, "?column?".to_owned())
        }
    };

    Ok(Item {
        name: alias.unwrap_or(name),
        type_oid,
        expr,
    })
}

fn parse_literal(text: &str) -> Result<Expr, ExecutionError> {
    if let Some(inner) = text
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        return Ok(Expr::Const(Value::Text(inner.replace("''", "'"))));
    }
    if text.eq_ignore_ascii_case("null") {
        return Ok(Expr::Const(Value::Null));
    }
    if text.eq_ignore_ascii_case("true") {
        return Ok(Expr::Const(Value::Bool(true)));
    }
    if text.eq_ignore_ascii_case("false") {
        return Ok(Expr::Const(Value::Bool(false)));
    }
    if let Some(n) = text.strip_prefix('$') {
        return match n.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(Expr::Param(n)),
            _ => Err(syntax_error(text)),
        };
    }
    if let Ok(i) = text.parse::<i64>() {
        let value = i32::try_from(i).map_or(Value::Int8(i), Value::Int4);
        return Ok(Expr::Const(value));
    }
    if text.contains(['.', 'e', 'E']) {
        if let Ok(x) = text.parse::<f64>() {
            return Ok(Expr::Const(Value::Float8(x)));
        }
    }
    Err(syntax_error(text))
}

/// One row in COPY text format.
fn copy_line(row: &Row) -> Bytes {
    let mut line = row
        .iter()
        .map(|value| match value {
            Value::Null => "\\N".to_owned(),
            value => value.to_string(),
        })
        .join("\t");
    line.push('\n');
    Bytes::from(line)
}

/// Collects COPY text rows and appends them to the table once the copy completes.
struct TableSink {
    tables: Tables,
    table: String,
    types: Vec<Oid>,
    /// An incomplete line carried over to the next chunk.
    pending: BytesMut,
    rows: Vec<Row>,
}

impl TableSink {
    fn push_line(&mut self, line: &[u8]) -> Result<(), ExecutionError> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line == b"\\." {
            return Ok(());
        }

        let fields = line.split(|b| *b == b'\t').collect::<Vec<_>>();
        if fields.len() != self.types.len() {
            return Err(ExecutionError::new(
                sql_state::BAD_COPY_FILE_FORMAT,
                format!(
                    "expected {} columns but found {}",
                    self.types.len(),
                    fields.len()
                ),
            ));
        }

        let row = fields
            .into_iter()
            .zip(&self.types)
            .map(|(field, type_oid)| match field {
                b"\\N" => Ok(Value::Null),
                field => DefaultFormat.parse(*type_oid, FormatCode::Text, Some(field)),
            })
            .collect::<Result<Row, _>>()?;
        self.rows.push(row);
        Ok(())
    }
}

impl CopySink for TableSink {
    fn write(&mut self, data: Bytes) -> Result<(), ExecutionError> {
        self.pending.extend_from_slice(&data);
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line = self.pending.split_to(end + 1);
            self.push_line(&line[..end])?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<CommandTag, ExecutionError> {
        if !self.pending.is_empty() {
            let line = self.pending.split();
            self.push_line(&line)?;
        }

        let mut rows = mem::take(&mut self.rows);
        let count = rows.len() as u64;
        lock(&self.tables)
            .get_mut(&self.table)
            .ok_or_else(|| undefined_table(&self.table))?
            .rows
            .append(&mut rows);

        Ok(CommandTag::with_rows("COPY", count))
    }

    fn abort(self: Box<Self>, reason: &str) {
        debug!(table = %self.table, reason, "copy aborted");
    }
}
