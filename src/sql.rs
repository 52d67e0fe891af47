use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
///
/// Every write is an `INSERT` into a table named after the action, with
/// positional values; reads are `SELECT * FROM <view> WHERE col = value AND ...`.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertSalon {
        id: Ulid,
        opening_hour: u8,
        closing_hour: u8,
        max_concurrent_slots: u32,
        name: Option<String>,
    },
    UpdateSalon {
        id: Ulid,
        opening_hour: u8,
        closing_hour: u8,
        max_concurrent_slots: u32,
        is_active: bool,
    },
    InsertService {
        id: Ulid,
        salon_id: Ulid,
        duration_minutes: u32,
        name: Option<String>,
    },
    InsertSubService {
        id: Ulid,
        service_id: Ulid,
        pricing: Pricing,
        price: i64,
        name: Option<String>,
    },
    InsertAppointment {
        request: BookingRequest,
    },
    InsertCompletion {
        appointment_id: Ulid,
        message: Option<String>,
    },
    /// A customer id makes it a customer cancellation.
    InsertCancellation {
        appointment_id: Ulid,
        customer_id: Option<Ulid>,
        message: Option<String>,
    },
    InsertOffsiteQuote {
        appointment_id: Ulid,
        extra_charge: i64,
        response: Option<String>,
    },
    InsertOffsiteRejection {
        appointment_id: Ulid,
        response: Option<String>,
    },
    InsertQuoteResponse {
        appointment_id: Ulid,
        customer_id: Ulid,
        accepted: bool,
    },
    SelectAppointments {
        id: Option<Ulid>,
        filter: AppointmentFilter,
    },
    SelectAvailability {
        salon_id: Ulid,
        service_id: Ulid,
        start: NaiveDateTime,
    },
    SelectDayAvailability {
        salon_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    },
    SelectMonthAvailability {
        salon_id: Ulid,
        service_id: Ulid,
        year: i32,
        month: u32,
    },
    SelectOverdueSweep {
        salon_id: Option<Ulid>,
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
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn require<'a>(values: &'a [Expr], table: &'static str, n: usize) -> Result<&'a [Expr], SqlError> {
    if values.len() < n {
        return Err(SqlError::WrongArity(table, n, values.len()));
    }
    Ok(values)
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let v = values.as_slice();

    match table.as_str() {
        "salons" => {
            let v = require(v, "salons", 4)?;
            Ok(Command::InsertSalon {
                id: parse_ulid(&v[0])?,
                opening_hour: parse_u8(&v[1])?,
                closing_hour: parse_u8(&v[2])?,
                max_concurrent_slots: parse_u32(&v[3])?,
                name: optional(v, 4, parse_string_or_null)?,
            })
        }
        "salon_settings" => {
            let v = require(v, "salon_settings", 5)?;
            Ok(Command::UpdateSalon {
                id: parse_ulid(&v[0])?,
                opening_hour: parse_u8(&v[1])?,
                closing_hour: parse_u8(&v[2])?,
                max_concurrent_slots: parse_u32(&v[3])?,
                is_active: parse_bool(&v[4])?,
            })
        }
        "services" => {
            let v = require(v, "services", 3)?;
            Ok(Command::InsertService {
                id: parse_ulid(&v[0])?,
                salon_id: parse_ulid(&v[1])?,
                duration_minutes: parse_u32(&v[2])?,
                name: optional(v, 3, parse_string_or_null)?,
            })
        }
        "sub_services" => {
            let v = require(v, "sub_services", 4)?;
            let pricing = parse_string(&v[2])?
                .parse::<Pricing>()
                .map_err(SqlError::Parse)?;
            Ok(Command::InsertSubService {
                id: parse_ulid(&v[0])?,
                service_id: parse_ulid(&v[1])?,
                pricing,
                price: parse_i64(&v[3])?,
                name: optional(v, 4, parse_string_or_null)?,
            })
        }
        "appointments" => {
            let v = require(v, "appointments", 5)?;
            let mut request = BookingRequest::new(
                parse_ulid(&v[0])?,
                parse_ulid(&v[1])?,
                parse_ulid(&v[2])?,
                parse_ulid(&v[3])?,
                parse_timestamp_expr(&v[4])?,
            );
            request.sub_service_id = optional(v, 5, parse_ulid_or_null)?;
            request.hours = optional(v, 6, parse_u32_or_null)?;
            request.is_offsite = optional(v, 7, parse_bool_or_null)?.unwrap_or(false);
            request.offsite_location = optional(v, 8, parse_string_or_null)?;
            request.notes = optional(v, 9, parse_string_or_null)?;
            Ok(Command::InsertAppointment { request })
        }
        "completions" => {
            let v = require(v, "completions", 1)?;
            Ok(Command::InsertCompletion {
                appointment_id: parse_ulid(&v[0])?,
                message: optional(v, 1, parse_string_or_null)?,
            })
        }
        "cancellations" => {
            let v = require(v, "cancellations", 1)?;
            Ok(Command::InsertCancellation {
                appointment_id: parse_ulid(&v[0])?,
                customer_id: optional(v, 1, parse_ulid_or_null)?,
                message: optional(v, 2, parse_string_or_null)?,
            })
        }
        "offsite_quotes" => {
            let v = require(v, "offsite_quotes", 2)?;
            Ok(Command::InsertOffsiteQuote {
                appointment_id: parse_ulid(&v[0])?,
                extra_charge: parse_i64(&v[1])?,
                response: optional(v, 2, parse_string_or_null)?,
            })
        }
        "offsite_rejections" => {
            let v = require(v, "offsite_rejections", 1)?;
            Ok(Command::InsertOffsiteRejection {
                appointment_id: parse_ulid(&v[0])?,
                response: optional(v, 1, parse_string_or_null)?,
            })
        }
        "quote_responses" => {
            let v = require(v, "quote_responses", 3)?;
            Ok(Command::InsertQuoteResponse {
                appointment_id: parse_ulid(&v[0])?,
                customer_id: parse_ulid(&v[1])?,
                accepted: parse_bool(&v[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` pairs joined by AND.
struct Filters<'a>(Vec<(String, &'a Expr)>);

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut pairs = Vec::new();
        if let Some(expr) = selection {
            collect_eq_filters(expr, &mut pairs)?;
        }
        Ok(Self(pairs))
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingFilter(col))
    }

    fn map<T>(
        &self,
        col: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        self.get(col).map(parse).transpose()
    }
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "appointments" => {
            let filter = AppointmentFilter {
                salon_id: filters.map("salon_id", parse_ulid)?,
                customer_id: filters.map("customer_id", parse_ulid)?,
                status: filters.map("status", |e| {
                    parse_string(e)?.parse::<AppointmentStatus>().map_err(SqlError::Parse)
                })?,
                offsite_status: filters.map("offsite_status", |e| {
                    parse_string(e)?.parse::<OffsiteStatus>().map_err(SqlError::Parse)
                })?,
                is_offsite: filters.map("is_offsite", parse_bool)?,
                page: filters.map("page", parse_u32)?,
                per_page: filters.map("per_page", parse_u32)?,
            };
            Ok(Command::SelectAppointments {
                id: filters.map("id", parse_ulid)?,
                filter,
            })
        }
        "availability" => Ok(Command::SelectAvailability {
            salon_id: parse_ulid(filters.required("salon_id")?)?,
            service_id: parse_ulid(filters.required("service_id")?)?,
            start: parse_timestamp_expr(filters.required("start")?)?,
        }),
        "day_availability" => Ok(Command::SelectDayAvailability {
            salon_id: parse_ulid(filters.required("salon_id")?)?,
            service_id: parse_ulid(filters.required("service_id")?)?,
            date: parse_date_expr(filters.required("date")?)?,
        }),
        "month_availability" => {
            let year = parse_i64(filters.required("year")?)?;
            Ok(Command::SelectMonthAvailability {
                salon_id: parse_ulid(filters.required("salon_id")?)?,
                service_id: parse_ulid(filters.required("service_id")?)?,
                year: i32::try_from(year)
                    .map_err(|_| SqlError::Parse(format!("{year} out of range for year")))?,
                month: parse_u32(filters.required("month")?)?,
            })
        }
        "overdue_sweep" => Ok(Command::SelectOverdueSweep {
            salon_id: filters.map("salon_id", parse_ulid)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

/// Trailing optional column: absent and NULL both mean `None`.
fn optional<T>(
    values: &[Expr],
    idx: usize,
    parse: impl Fn(&Expr) -> Result<Option<T>, SqlError>,
) -> Result<Option<T>, SqlError> {
    match values.get(idx) {
        Some(expr) => parse(expr),
        None => Ok(None),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_string(expr)?;
    s.trim()
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range for an hour")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_bool_or_null(expr: &Expr) -> Result<Option<bool>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_bool(expr).map(Some)
}

fn parse_timestamp_expr(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    let s = parse_string(expr)?;
    parse_timestamp(&s).ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
