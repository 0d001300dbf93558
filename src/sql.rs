use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertFacility {
        id: Ulid,
        name: String,
        capacity: u32,
        hourly_rate: f64,
    },
    UpdateFacility {
        id: Ulid,
        name: Option<String>,
        capacity: Option<u32>,
        hourly_rate: Option<f64>,
    },
    DeleteFacility {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        facility_id: Ulid,
        user_id: Ulid,
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        amount: f64,
        space_id: Option<String>,
        status: BookingStatus,
    },
    ConfirmBooking {
        id: Ulid,
        method: PaymentMethod,
        transaction_id: Option<String>,
    },
    CheckIn {
        id: Ulid,
        method: CheckMethod,
        verified_by: Option<Ulid>,
        notes: Option<String>,
    },
    CheckOut {
        id: Ulid,
        method: CheckMethod,
        verified_by: Option<Ulid>,
        notes: Option<String>,
        charges: f64,
    },
    CancelBooking {
        id: Ulid,
        cancelled_by: Ulid,
        reason: String,
    },
    InsertExtension {
        booking_id: Ulid,
        minutes: i64,
        payment_method: Option<PaymentMethod>,
        transaction_id: Option<String>,
    },
    ApproveExtension {
        booking_id: Ulid,
        index: usize,
        transaction_id: Option<String>,
    },
    InsertRating {
        booking_id: Ulid,
        score: u8,
        comment: Option<String>,
    },
    InsertNote {
        booking_id: Ulid,
        author_id: Ulid,
        text: String,
    },
    SelectFacilities,
    SelectBookings {
        filter: BookingFilter,
    },
    SelectExtensions {
        booking_id: Ulid,
    },
    SelectAvailability {
        facility_id: Ulid,
        start: Ms,
        end: Ms,
        space_id: Option<String>,
        exclude: Option<Ulid>,
    },
    SelectFacilityStats {
        facility_id: Ulid,
    },
    Listen {
        channel: String,
    },
}

#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    Id(Ulid),
    Number(String),
    Facility(Ulid),
    User(Ulid),
    Vehicle(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "facilities" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("facilities", 4, values.len()));
            }
            Ok(Command::InsertFacility {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                capacity: parse_u32(&values[2])?,
                hourly_rate: parse_f64(&values[3])?,
            })
        }
        "bookings" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("bookings", 7, values.len()));
            }
            let space_id = if values.len() >= 8 {
                parse_string_or_null(&values[7])?
            } else {
                None
            };
            let status = if values.len() >= 9 {
                let s = parse_string(&values[8])?;
                BookingStatus::parse(&s)
                    .ok_or_else(|| SqlError::Parse(format!("bad booking status: {s}")))?
            } else {
                BookingStatus::Pending
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                facility_id: parse_ulid(&values[1])?,
                user_id: parse_ulid(&values[2])?,
                vehicle_id: parse_ulid(&values[3])?,
                start: parse_i64(&values[4])?,
                end: parse_i64(&values[5])?,
                amount: parse_f64(&values[6])?,
                space_id,
                status,
            })
        }
        "extensions" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("extensions", 2, values.len()));
            }
            let payment_method = if values.len() >= 3 {
                match parse_string_or_null(&values[2])? {
                    Some(s) => Some(
                        PaymentMethod::parse(&s)
                            .ok_or_else(|| SqlError::Parse(format!("bad payment method: {s}")))?,
                    ),
                    None => None,
                }
            } else {
                None
            };
            let transaction_id = if values.len() >= 4 {
                parse_string_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::InsertExtension {
                booking_id: parse_ulid(&values[0])?,
                minutes: parse_i64(&values[1])?,
                payment_method,
                transaction_id,
            })
        }
        "ratings" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("ratings", 2, values.len()));
            }
            let comment = if values.len() >= 3 {
                parse_string_or_null(&values[2])?
            } else {
                None
            };
            Ok(Command::InsertRating {
                booking_id: parse_ulid(&values[0])?,
                score: parse_u8(&values[1])?,
                comment,
            })
        }
        "notes" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("notes", 3, values.len()));
            }
            Ok(Command::InsertNote {
                booking_id: parse_ulid(&values[0])?,
                author_id: parse_ulid(&values[1])?,
                text: parse_string(&values[2])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let set: Vec<(String, &Expr)> = assignments
        .iter()
        .map(|a| Ok((assignment_column(a)?, &a.value)))
        .collect::<Result<_, SqlError>>()?;

    let get = |col: &str| set.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "facilities" => {
            let filters = extract_eq_filters(selection)?;
            let id = filters
                .ulid("id")?
                .ok_or(SqlError::MissingFilter("id"))?;
            Ok(Command::UpdateFacility {
                id,
                name: get("name").map(parse_string).transpose()?,
                capacity: get("capacity").map(parse_u32).transpose()?,
                hourly_rate: get("hourly_rate").map(parse_f64).transpose()?,
            })
        }
        "bookings" => {
            let filters = extract_eq_filters(selection)?;
            let id = filters
                .ulid("id")?
                .ok_or(SqlError::MissingFilter("id"))?;
            let status_expr = get("status").ok_or(SqlError::MissingColumn("status"))?;
            let status = parse_string(status_expr)?;

            match status.as_str() {
                "confirmed" => Ok(Command::ConfirmBooking {
                    id,
                    method: parse_payment_method(
                        get("method").ok_or(SqlError::MissingColumn("method"))?,
                    )?,
                    transaction_id: get("transaction_id").map(parse_string).transpose()?,
                }),
                "active" => Ok(Command::CheckIn {
                    id,
                    method: parse_check_method(
                        get("method").ok_or(SqlError::MissingColumn("method"))?,
                    )?,
                    verified_by: get("verified_by").map(parse_ulid).transpose()?,
                    notes: get("notes").map(parse_string).transpose()?,
                }),
                "completed" => Ok(Command::CheckOut {
                    id,
                    method: parse_check_method(
                        get("method").ok_or(SqlError::MissingColumn("method"))?,
                    )?,
                    verified_by: get("verified_by").map(parse_ulid).transpose()?,
                    notes: get("notes").map(parse_string).transpose()?,
                    charges: get("charges").map(parse_f64).transpose()?.unwrap_or(0.0),
                }),
                "cancelled" => Ok(Command::CancelBooking {
                    id,
                    cancelled_by: parse_ulid(
                        get("cancelled_by").ok_or(SqlError::MissingColumn("cancelled_by"))?,
                    )?,
                    reason: get("reason").map(parse_string).transpose()?.unwrap_or_default(),
                }),
                other => Err(SqlError::Unsupported(format!(
                    "status transition to '{other}'"
                ))),
            }
        }
        "extensions" => {
            let filters = extract_eq_filters(selection)?;
            let booking_id = filters
                .ulid("booking_id")?
                .ok_or(SqlError::MissingFilter("booking_id"))?;
            let index = filters
                .i64("idx")?
                .ok_or(SqlError::MissingFilter("idx"))?;
            let status_expr = get("status").ok_or(SqlError::MissingColumn("status"))?;
            let status = parse_string(status_expr)?;
            if status != "approved" {
                return Err(SqlError::Unsupported(format!(
                    "extension status transition to '{status}'"
                )));
            }
            Ok(Command::ApproveExtension {
                booking_id,
                index: usize::try_from(index)
                    .map_err(|_| SqlError::Parse(format!("bad extension index: {index}")))?,
                transaction_id: get("transaction_id").map(parse_string).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        other => Err(SqlError::Parse(format!("unsupported SET target: {other}"))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = extract_eq_filters(&delete.selection)?;
    let id = filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "facilities" => Ok(Command::DeleteFacility { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "facilities" => Ok(Command::SelectFacilities),
        "bookings" => {
            let filters = extract_eq_filters(&select.selection)?;
            let filter = if let Some(id) = filters.ulid("id")? {
                BookingFilter::Id(id)
            } else if let Some(number) = filters.string("number")? {
                BookingFilter::Number(number)
            } else if let Some(fid) = filters.ulid("facility_id")? {
                BookingFilter::Facility(fid)
            } else if let Some(uid) = filters.ulid("user_id")? {
                BookingFilter::User(uid)
            } else if let Some(vid) = filters.ulid("vehicle_id")? {
                BookingFilter::Vehicle(vid)
            } else {
                return Err(SqlError::MissingFilter(
                    "id, number, facility_id, user_id or vehicle_id",
                ));
            };
            Ok(Command::SelectBookings { filter })
        }
        "extensions" => {
            let filters = extract_eq_filters(&select.selection)?;
            Ok(Command::SelectExtensions {
                booking_id: filters
                    .ulid("booking_id")?
                    .ok_or(SqlError::MissingFilter("booking_id"))?,
            })
        }
        "availability" => {
            let (mut facility_id, mut start, mut end) = (None, None, None);
            let mut filters = EqFilters::default();
            if let Some(selection) = &select.selection {
                extract_availability_filters(
                    selection,
                    &mut facility_id,
                    &mut start,
                    &mut end,
                    &mut filters,
                )?;
            }
            Ok(Command::SelectAvailability {
                facility_id: facility_id.ok_or(SqlError::MissingFilter("facility_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                space_id: filters.string("space_id")?,
                exclude: filters.ulid("exclude")?,
            })
        }
        "facility_stats" => {
            let filters = extract_eq_filters(&select.selection)?;
            Ok(Command::SelectFacilityStats {
                facility_id: filters
                    .ulid("facility_id")?
                    .ok_or(SqlError::MissingFilter("facility_id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_availability_filters(
    expr: &Expr,
    facility_id: &mut Option<Ulid>,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
    eq: &mut EqFilters,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_availability_filters(left, facility_id, start, end, eq)?;
                extract_availability_filters(right, facility_id, start, end, eq)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    if col == "facility_id" {
                        *facility_id = Some(parse_ulid(right)?);
                    } else {
                        eq.0.push((col, (**right).clone()));
                    }
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_i64(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_i64(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ── WHERE col = value collection ──────────────────────────────

#[derive(Default)]
struct EqFilters(Vec<(String, Expr)>);

impl EqFilters {
    fn get(&self, col: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| e)
    }

    fn ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(col).map(parse_ulid).transpose()
    }

    fn string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_string).transpose()
    }

    fn i64(&self, col: &str) -> Result<Option<i64>, SqlError> {
        self.get(col).map(parse_i64).transpose()
    }
}

fn extract_eq_filters(selection: &Option<Expr>) -> Result<EqFilters, SqlError> {
    let mut filters = EqFilters::default();
    if let Some(expr) = selection {
        collect_eq(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_eq(expr: &Expr, filters: &mut EqFilters) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq(left, filters)?;
            collect_eq(right, filters)?;
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if let Some(col) = expr_column_name(left) {
                filters.0.push((col, (**right).clone()));
            }
        }
        Expr::Nested(inner) => collect_eq(inner, filters)?,
        _ => return Err(SqlError::Parse(format!("unsupported WHERE clause: {expr}"))),
    }
    Ok(())
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            Value::Number(s, _) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad f64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad f64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_f64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_payment_method(expr: &Expr) -> Result<PaymentMethod, SqlError> {
    let s = parse_string(expr)?;
    PaymentMethod::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad payment method: {s}")))
}

fn parse_check_method(expr: &Expr) -> Result<CheckMethod, SqlError> {
    let s = parse_string(expr)?;
    CheckMethod::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad check method: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing SET column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
