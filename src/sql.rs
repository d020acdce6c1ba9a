use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::projector::MonthRef;

/// Column order assumed by `INSERT INTO windows VALUES (...)` without a column list.
const WINDOW_COLUMNS: &[&str] = &[
    "id",
    "name",
    "date_begin",
    "date_end",
    "time_first",
    "time_last",
    "time_unit",
    "max_limit",
];

/// Column order assumed by `INSERT INTO bookings VALUES (...)` without a column list.
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "window_id",
    "date",
    "time",
    "subject_id",
    "contact_name",
    "contact_phone",
    "memo",
    "line",
];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertWindow {
        id: Ulid,
        name: Option<String>,
        config: WindowConfig,
    },
    UpdateWindow {
        id: Ulid,
        patch: WindowPatch,
    },
    DeleteWindow {
        id: Ulid,
    },
    InsertBooking(BookRequest),
    DeleteBooking {
        id: Ulid,
        reason: Option<String>,
    },
    SelectWindows {
        id: Option<Ulid>,
    },
    SelectBookings {
        window_id: Option<Ulid>,
        id: Option<Ulid>,
        status: Option<BookingStatus>,
    },
    SelectSlots {
        window_id: Ulid,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    SelectCalendar {
        window_id: Ulid,
        month: MonthRef,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "windows" => {
            let row = Row::from_insert(insert, WINDOW_COLUMNS)?;
            Ok(Command::InsertWindow {
                id: parse_ulid_expr(row.required("id")?)?,
                name: row.text_or_null("name")?,
                config: WindowConfig {
                    date_begin: parse_date_expr(row.required("date_begin")?)?,
                    date_end: parse_date_expr(row.required("date_end")?)?,
                    time_first: parse_time_expr(row.required("time_first")?)?,
                    time_last: parse_time_expr(row.required("time_last")?)?,
                    time_unit: parse_i32(row.required("time_unit")?)?,
                    max_limit: match row.get("max_limit") {
                        Some(e) => parse_u32_or_null(e)?,
                        None => None,
                    },
                },
            })
        }
        "bookings" => {
            let row = Row::from_insert(insert, BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking(BookRequest {
                id: parse_ulid_expr(row.required("id")?)?,
                window_id: parse_ulid_expr(row.required("window_id")?)?,
                date: parse_date_expr(row.required("date")?)?,
                time: parse_time_expr(row.required("time")?)?,
                subject_id: parse_text(row.required("subject_id")?)?,
                contact_name: parse_text(row.required("contact_name")?)?,
                contact_phone: parse_text(row.required("contact_phone")?)?,
                memo: row.text_or_null("memo")?,
                line: row
                    .text_or_null("line")?
                    .map(|s| s.parse::<ServiceLine>().map_err(SqlError::Parse))
                    .transpose()?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "windows" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = Filters::from_selection(selection)?;
    let id = parse_ulid_expr(filters.eq("id").ok_or(SqlError::MissingFilter("id"))?)?;

    let mut patch = WindowPatch::default();
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let v = &a.value;
        match column.as_str() {
            "name" => patch.name = Some(parse_text_or_null(v)?),
            "date_begin" => patch.date_begin = Some(parse_date_expr(v)?),
            "date_end" => patch.date_end = Some(parse_date_expr(v)?),
            "time_first" => patch.time_first = Some(parse_time_expr(v)?),
            "time_last" => patch.time_last = Some(parse_time_expr(v)?),
            "time_unit" => patch.time_unit = Some(parse_i32(v)?),
            "max_limit" => patch.max_limit = Some(parse_u32_or_null(v)?),
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }
    if patch.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }
    Ok(Command::UpdateWindow { id, patch })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;
    let id = parse_ulid_expr(filters.eq("id").ok_or(SqlError::MissingFilter("id"))?)?;

    match table.as_str() {
        "windows" => Ok(Command::DeleteWindow { id }),
        "bookings" => Ok(Command::DeleteBooking {
            id,
            reason: filters.eq("reason").map(parse_text_or_null).transpose()?.flatten(),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "windows" => Ok(Command::SelectWindows {
            id: filters.eq("id").map(parse_ulid_expr).transpose()?,
        }),
        "bookings" => {
            let window_id = filters.eq("window_id").map(parse_ulid_expr).transpose()?;
            let id = filters.eq("id").map(parse_ulid_expr).transpose()?;
            if window_id.is_none() && id.is_none() {
                return Err(SqlError::MissingFilter("window_id"));
            }
            let status = match filters.eq("status") {
                None => None,
                Some(e) => Some(match parse_text(e)?.to_lowercase().as_str() {
                    "active" => BookingStatus::Active,
                    "cancelled" | "canceled" => BookingStatus::Cancelled,
                    other => return Err(SqlError::Parse(format!("unknown status: {other}"))),
                }),
            };
            Ok(Command::SelectBookings { window_id, id, status })
        }
        "slots" => {
            let window_id = required_window_id(&filters)?;
            let exact = filters.eq("date").map(parse_date_expr).transpose()?;
            let from = filters.ge("date").map(parse_date_expr).transpose()?.or(exact);
            let to = filters.le("date").map(parse_date_expr).transpose()?.or(exact);
            Ok(Command::SelectSlots { window_id, from, to })
        }
        "calendar" => {
            let window_id = required_window_id(&filters)?;
            let month = parse_text(filters.eq("month").ok_or(SqlError::MissingFilter("month"))?)?;
            Ok(Command::SelectCalendar {
                window_id,
                month: month.parse().map_err(SqlError::Parse)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn required_window_id(filters: &Filters<'_>) -> Result<Ulid, SqlError> {
    parse_ulid_expr(filters.eq("window_id").ok_or(SqlError::MissingFilter("window_id"))?)
}

// ── Rows and filters ─────────────────────────────────────────

/// One VALUES row keyed by column name.
struct Row {
    fields: Vec<(String, Expr)>,
}

impl Row {
    /// Columns come from the statement's column list, or positionally from
    /// `defaults` when the list is omitted.
    fn from_insert(insert: &ast::Insert, defaults: &'static [&'static str]) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            if values.len() > defaults.len() {
                return Err(SqlError::WrongArity(defaults.len(), values.len()));
            }
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            if insert.columns.len() != values.len() {
                return Err(SqlError::WrongArity(insert.columns.len(), values.len()));
            }
            insert.columns.iter().map(|c| column_name(&c.to_string())).collect()
        };
        Ok(Self {
            fields: columns.into_iter().zip(values).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.fields.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn text_or_null(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map(parse_text_or_null).transpose().map(Option::flatten)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterOp {
    Eq,
    GtEq,
    LtEq,
}

/// Conjunction of `column <op> value` comparisons from a WHERE clause.
struct Filters<'a> {
    items: Vec<(String, FilterOp, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut items = Vec::new();
        if let Some(expr) = selection {
            collect_filters(expr, &mut items)?;
        }
        Ok(Self { items })
    }

    fn find(&self, column: &str, op: FilterOp) -> Option<&'a Expr> {
        self.items
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, e)| *e)
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, FilterOp::Eq)
    }

    fn ge(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, FilterOp::GtEq)
    }

    fn le(&self, column: &str) -> Option<&'a Expr> {
        self.find(column, FilterOp::LtEq)
    }
}

fn collect_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, FilterOp, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_filters(left, out)?;
                    return collect_filters(right, out);
                }
                ast::BinaryOperator::Eq => FilterOp::Eq,
                ast::BinaryOperator::GtEq => FilterOp::GtEq,
                ast::BinaryOperator::LtEq => FilterOp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, op, right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn column_name(raw: &str) -> String {
    raw.rsplit('.')
        .next()
        .unwrap_or(raw)
        .trim_matches('"')
        .to_lowercase()
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

/// Quoted string or bare number, as text.
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    parse_hhmm(&s).ok_or_else(|| SqlError::Parse(format!("bad time {s}: expected HH:MM")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = parse_text(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64_expr(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    let v = parse_i64_expr(expr)?;
    u32::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    /// Expected column count, got value count.
    WrongArity(usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(expected, got) => {
                write!(f, "expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
