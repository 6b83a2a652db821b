use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService(NewService),
    UpdateService {
        id: ServiceId,
        patch: ServicePatch,
    },
    DeleteService {
        id: ServiceId,
    },
    SelectServices {
        active: Option<bool>,
    },
    SelectService {
        id: ServiceId,
    },
    InsertBooking {
        service_id: ServiceId,
        start: Ms,
        end: Ms,
        returning: bool,
    },
    UpdateBooking {
        id: BookingId,
        changes: BookingChanges,
        returning: bool,
    },
    DeleteBooking {
        id: BookingId,
        returning: bool,
    },
    SelectBookings {
        id: Option<BookingId>,
        filter: BookingFilter,
    },
    SelectConflicts {
        service_id: ServiceId,
        start: Ms,
        end: Ms,
    },
    InsertReview {
        booking_id: BookingId,
        rating: i64,
        comment: String,
        returning: bool,
    },
    UpdateReview {
        id: ReviewId,
        patch: ReviewPatch,
    },
    DeleteReview {
        id: ReviewId,
    },
    SelectReviews {
        service_id: ServiceId,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let trimmed = sql.trim_start();
    if trimmed
        .split_whitespace()
        .next()
        .is_some_and(|keyword| keyword.eq_ignore_ascii_case("UPDATE"))
    {
        return parse_update(&dialect, trimmed);
    }

    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let mut stmts = stmts.into_iter();
    let stmt = stmts.next().ok_or(SqlError::Empty)?;
    if stmts.next().is_some() {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match &stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column/value pairs of a single-row INSERT. Without a column list, values
/// are matched to `positional` in order.
struct Row {
    table: &'static str,
    cols: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.cols.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn require(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn check_known(&self, known: &[&str]) -> Result<(), SqlError> {
        match self.cols.iter().find(|(c, _)| !known.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::UnknownColumn(self.table, c.clone())),
            None => Ok(()),
        }
    }
}

fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    positional: &[&str],
) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.as_slice() {
        [row] => row,
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let names: Vec<String> = if insert.columns.is_empty() {
        positional.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if names.len() != row.len() {
        return Err(SqlError::WrongArity(table, names.len(), row.len()));
    }
    let row = Row {
        table,
        cols: names.into_iter().zip(row.iter().cloned()).collect(),
    };
    row.check_known(positional)?;
    Ok(row)
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "services" => {
            let row = insert_row(
                insert,
                "services",
                &["id", "title", "description", "price_cents", "duration_minutes", "active"],
            )?;
            Ok(Command::InsertService(NewService {
                id: parse_i64_expr(row.require("id")?)?,
                title: parse_string(row.require("title")?)?,
                description: row.get("description").map(parse_string).transpose()?.unwrap_or_default(),
                price_cents: parse_i64_expr(row.require("price_cents")?)?,
                duration_minutes: parse_u32(row.require("duration_minutes")?)?,
                active: row.get("active").map(parse_bool).transpose()?.unwrap_or(true),
            }))
        }
        "bookings" => {
            let row = insert_row(insert, "bookings", &["service_id", "start", "end"])?;
            Ok(Command::InsertBooking {
                service_id: parse_i64_expr(row.require("service_id")?)?,
                start: parse_i64_expr(row.require("start")?)?,
                end: parse_i64_expr(row.require("end")?)?,
                returning,
            })
        }
        "reviews" => {
            let row = insert_row(insert, "reviews", &["booking_id", "rating", "comment"])?;
            Ok(Command::InsertReview {
                booking_id: parse_i64_expr(row.require("booking_id")?)?,
                rating: parse_i64_expr(row.require("rating")?)?,
                comment: row.get("comment").map(parse_string).transpose()?.unwrap_or_default(),
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

/// `UPDATE <table> SET col = v, ... WHERE id = N [RETURNING ...]`, parsed clause by clause.
fn parse_update(dialect: &PostgreSqlDialect, sql: &str) -> Result<Command, SqlError> {
    let perr = |e: ParserError| SqlError::Parse(e.to_string());
    let mut parser = Parser::new(dialect).try_with_sql(sql).map_err(perr)?;

    parser.expect_keyword(Keyword::UPDATE).map_err(perr)?;
    let table = parser.parse_object_name(false).map_err(perr)?;
    let table = object_name_last(&table).ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    parser.expect_keyword(Keyword::SET).map_err(perr)?;
    let assignments = parser
        .parse_comma_separated(Parser::parse_assignment)
        .map_err(perr)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr().map_err(perr)?)
    } else {
        None
    };
    let returning = parser.parse_keyword(Keyword::RETURNING);
    if returning {
        parser
            .parse_comma_separated(Parser::parse_select_item)
            .map_err(perr)?;
    }
    parser.consume_token(&Token::SemiColon);
    parser.expect_token(&Token::EOF).map_err(perr)?;

    let id = extract_where_id(&selection)?;
    let mut sets = Vec::with_capacity(assignments.len());
    for a in &assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        sets.push((col, &a.value));
    }

    match table.as_str() {
        "services" => {
            let mut patch = ServicePatch::default();
            for (col, value) in sets {
                match col.as_str() {
                    "title" => patch.title = Some(parse_string(value)?),
                    "description" => patch.description = Some(parse_string(value)?),
                    "price_cents" => patch.price_cents = Some(parse_i64_expr(value)?),
                    "duration_minutes" => patch.duration_minutes = Some(parse_u32(value)?),
                    "active" => patch.active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn("services", col)),
                }
            }
            Ok(Command::UpdateService { id, patch })
        }
        "bookings" => {
            let mut changes = BookingChanges::default();
            for (col, value) in sets {
                match col.as_str() {
                    "start" => changes.start = Some(parse_i64_expr(value)?),
                    "end" => changes.end = Some(parse_i64_expr(value)?),
                    "status" => changes.status = Some(parse_string(value)?.parse()?),
                    _ => return Err(SqlError::UnknownColumn("bookings", col)),
                }
            }
            Ok(Command::UpdateBooking { id, changes, returning })
        }
        "reviews" => {
            let mut patch = ReviewPatch::default();
            for (col, value) in sets {
                match col.as_str() {
                    "rating" => patch.rating = Some(parse_i64_expr(value)?),
                    "comment" => patch.comment = Some(parse_string(value)?),
                    _ => return Err(SqlError::UnknownColumn("reviews", col)),
                }
            }
            Ok(Command::UpdateReview { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;
    let returning = delete.returning.is_some();

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "bookings" => Ok(Command::DeleteBooking { id, returning }),
        "reviews" => Ok(Command::DeleteReview { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;

    let mut preds = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut preds)?;
    }

    match table.as_str() {
        "services" => {
            let (mut id, mut active) = (None, None);
            for (col, op, value) in preds {
                match (col.as_str(), op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_i64_expr(value)?),
                    ("active", BinaryOperator::Eq) => active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnsupportedFilter("services", col)),
                }
            }
            match (id, active) {
                (Some(id), None) => Ok(Command::SelectService { id }),
                (Some(_), Some(_)) => Err(SqlError::UnsupportedFilter("services", "active".into())),
                (None, active) => Ok(Command::SelectServices { active }),
            }
        }
        "bookings" => {
            let mut id = None;
            let mut filter = BookingFilter::default();
            for (col, op, value) in preds {
                match (col.as_str(), op) {
                    ("id", BinaryOperator::Eq) => id = Some(parse_i64_expr(value)?),
                    ("service_id", BinaryOperator::Eq) => filter.service_id = Some(parse_i64_expr(value)?),
                    ("status", BinaryOperator::Eq) => filter.status = Some(parse_string(value)?.parse()?),
                    ("start", BinaryOperator::GtEq) => filter.from = Some(parse_i64_expr(value)?),
                    ("end", BinaryOperator::LtEq) => filter.to = Some(parse_i64_expr(value)?),
                    _ => return Err(SqlError::UnsupportedFilter("bookings", col)),
                }
            }
            Ok(Command::SelectBookings { id, filter })
        }
        "conflicts" => {
            let (mut service_id, mut start, mut end) = (None, None, None);
            for (col, op, value) in preds {
                match (col.as_str(), op) {
                    ("service_id", BinaryOperator::Eq) => service_id = Some(parse_i64_expr(value)?),
                    ("start", BinaryOperator::GtEq) => start = Some(parse_i64_expr(value)?),
                    ("end", BinaryOperator::LtEq) => end = Some(parse_i64_expr(value)?),
                    _ => return Err(SqlError::UnsupportedFilter("conflicts", col)),
                }
            }
            Ok(Command::SelectConflicts {
                service_id: service_id.ok_or(SqlError::MissingFilter("service_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        "reviews" => {
            let mut service_id = None;
            for (col, op, value) in preds {
                match (col.as_str(), op) {
                    ("service_id", BinaryOperator::Eq) => service_id = Some(parse_i64_expr(value)?),
                    _ => return Err(SqlError::UnsupportedFilter("reviews", col)),
                }
            }
            Ok(Command::SelectReviews {
                service_id: service_id.ok_or(SqlError::MissingFilter("service_id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten an AND-tree of `column <op> value` comparisons.
fn collect_predicates<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((col, op.clone(), right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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

fn extract_where_id(selection: &Option<Expr>) -> Result<i64, SqlError> {
    match selection.as_ref() {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_i64_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    UnsupportedFilter(&'static str, String),
    /// Well-formed SQL carrying a status outside the lifecycle.
    InvalidStatus(UnknownStatus),
}

impl From<UnknownStatus> for SqlError {
    fn from(e: UnknownStatus) -> Self {
        SqlError::InvalidStatus(e)
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(t, c) => write!(f, "{t}: cannot filter on {c}"),
            SqlError::InvalidStatus(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SqlError {}
