use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::SpotSenseAuthSource;
use crate::model::*;
use crate::sql::{self, BookingFilter, Command};
use crate::tenant::{Tenant, TenantManager};

pub struct SpotSenseHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SpotSenseQueryParser>,
}

impl SpotSenseHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SpotSenseQueryParser),
        }
    }

    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<Tenant> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute_command(&self, tenant: &Tenant, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &tenant.engine;
        match cmd {
            Command::InsertFacility {
                id,
                name,
                capacity,
                hourly_rate,
            } => {
                engine
                    .register_facility(id, name, capacity, hourly_rate)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateFacility {
                id,
                name,
                capacity,
                hourly_rate,
            } => {
                engine
                    .update_facility(id, name, capacity, hourly_rate)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteFacility { id } => {
                engine.remove_facility(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking {
                id,
                facility_id,
                user_id,
                vehicle_id,
                start,
                end,
                amount,
                space_id,
                status,
            } => {
                let req = NewBooking {
                    id,
                    facility: facility_id,
                    user: user_id,
                    vehicle: vehicle_id,
                    space: space_id.map(SpaceRef::new),
                    range: TimeRange { start, end },
                    amount,
                    status,
                    pricing: None,
                    source: BookingSource::ThirdParty,
                    special_requests: None,
                    recurrence: None,
                };
                engine.create_booking(req).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ConfirmBooking {
                id,
                method,
                transaction_id,
            } => {
                engine
                    .confirm_booking(id, method, transaction_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CheckIn {
                id,
                method,
                verified_by,
                notes,
            } => {
                engine
                    .check_in(id, method, verified_by, notes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CheckOut {
                id,
                method,
                verified_by,
                notes,
                charges,
            } => {
                engine
                    .check_out(id, method, verified_by, notes, charges)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CancelBooking {
                id,
                cancelled_by,
                reason,
            } => {
                engine
                    .cancel_booking(id, cancelled_by, &reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertExtension {
                booking_id,
                minutes,
                payment_method,
                transaction_id,
            } => {
                engine
                    .request_extension(booking_id, minutes, payment_method, transaction_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ApproveExtension {
                booking_id,
                index,
                transaction_id,
            } => {
                engine
                    .approve_extension(booking_id, index, transaction_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertRating {
                booking_id,
                score,
                comment,
            } => {
                engine
                    .add_rating(booking_id, score, comment)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertNote {
                booking_id,
                author_id,
                text,
            } => {
                engine
                    .add_note(booking_id, author_id, text, false)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectFacilities => {
                let schema = Arc::new(facilities_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_facilities()
                    .into_iter()
                    .map(|f| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&f.id.to_string())?;
                        encoder.encode_field(&f.name)?;
                        encoder.encode_field(&i64::from(f.capacity))?;
                        encoder.encode_field(&f.hourly_rate.to_string())?;
                        encoder.encode_field(&f.currency)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Id(id) => engine.get_booking(id).await.into_iter().collect(),
                    BookingFilter::Number(n) => match engine.find_by_number(&n).await {
                        Ok(b) => vec![b],
                        Err(crate::engine::EngineError::UnknownNumber(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                    BookingFilter::Facility(fid) => engine.bookings_for_facility(fid).await,
                    BookingFilter::User(uid) => {
                        engine.upcoming_for_user(uid, MIN_BOOKING_TIME, usize::MAX)
                    }
                    BookingFilter::Vehicle(vid) => {
                        engine.active_for_vehicle(vid, MIN_BOOKING_TIME)
                    }
                };
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .iter()
                    .map(|b| encode_booking_row(&schema, b))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectExtensions { booking_id } => {
                let booking = engine
                    .get_booking(booking_id)
                    .await
                    .ok_or_else(|| engine_err(crate::engine::EngineError::NotFound(booking_id)))?;
                let schema = Arc::new(extensions_schema());
                let bid = booking_id.to_string();
                let rows: Vec<PgWireResult<_>> = booking
                    .extensions
                    .iter()
                    .enumerate()
                    .map(|(idx, e)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&bid)?;
                        encoder.encode_field(&(idx as i64))?;
                        encoder.encode_field(&e.additional_minutes)?;
                        encoder.encode_field(&e.original_end)?;
                        encoder.encode_field(&e.new_end)?;
                        encoder.encode_field(&e.status.as_str())?;
                        encoder.encode_field(&e.additional_amount.to_string())?;
                        encoder.encode_field(&e.payment_status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectAvailability {
                facility_id,
                start,
                end,
                space_id,
                exclude,
            } => {
                let report = engine
                    .check_availability(
                        facility_id,
                        TimeRange { start, end },
                        space_id.as_deref(),
                        exclude,
                    )
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&facility_id.to_string())?;
                encoder.encode_field(&if report.is_available { "t" } else { "f" })?;
                encoder.encode_field(&i64::from(report.available_spaces))?;
                encoder.encode_field(&i64::from(report.total_spaces))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectFacilityStats { facility_id } => {
                let stats = tenant.stats.facility(&facility_id).ok_or_else(|| {
                    engine_err(crate::engine::EngineError::NotFound(facility_id))
                })?;
                let schema = Arc::new(stats_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&facility_id.to_string())?;
                encoder.encode_field(&i64::from(stats.capacity))?;
                encoder.encode_field(&i64::from(stats.occupied))?;
                encoder.encode_field(&(stats.completed_total as i64))?;
                encoder.encode_field(&stats.revenue_total.to_string())?;
                encoder.encode_field(&stats.minutes_total)?;
                encoder.encode_field(
                    &stats.rating_avg().map_or(String::new(), |a| a.to_string()),
                )?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let facility_id_str = channel.strip_prefix("facility_").ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected facility_{{id}})"),
                    )))
                })?;
                let _facility_id = Ulid::from_string(facility_id_str).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("bad ULID in channel: {e}"),
                    )))
                })?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
        }
    }
}

/// User/vehicle listings take "everything from the epoch" — callers filter
/// further client-side.
const MIN_BOOKING_TIME: Ms = 0;

// ── Row schemas ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn facilities_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("capacity", Type::INT8),
        text_field("hourly_rate", Type::FLOAT8),
        text_field("currency", Type::VARCHAR),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("number", Type::VARCHAR),
        text_field("facility_id", Type::VARCHAR),
        text_field("user_id", Type::VARCHAR),
        text_field("vehicle_id", Type::VARCHAR),
        text_field("space", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("duration_minutes", Type::INT8),
        text_field("amount", Type::FLOAT8),
        text_field("payment_status", Type::VARCHAR),
    ]
}

fn extensions_schema() -> Vec<FieldInfo> {
    vec![
        text_field("booking_id", Type::VARCHAR),
        text_field("idx", Type::INT8),
        text_field("minutes", Type::INT8),
        text_field("original_end", Type::INT8),
        text_field("new_end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("additional_amount", Type::FLOAT8),
        text_field("payment_status", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("facility_id", Type::VARCHAR),
        text_field("is_available", Type::BOOL),
        text_field("available_spaces", Type::INT8),
        text_field("total_spaces", Type::INT8),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![
        text_field("facility_id", Type::VARCHAR),
        text_field("capacity", Type::INT8),
        text_field("occupied", Type::INT8),
        text_field("completed_total", Type::INT8),
        text_field("revenue_total", Type::FLOAT8),
        text_field("minutes_total", Type::INT8),
        text_field("rating_avg", Type::FLOAT8),
    ]
}

fn encode_booking_row(
    schema: &Arc<Vec<FieldInfo>>,
    b: &Booking,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let space_json = match &b.space {
        Some(space) => serde_json::to_string(space).unwrap_or_else(|_| "null".into()),
        None => "null".into(),
    };
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.number)?;
    encoder.encode_field(&b.facility.to_string())?;
    encoder.encode_field(&b.user.to_string())?;
    encoder.encode_field(&b.vehicle.to_string())?;
    encoder.encode_field(&space_json)?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.range.start)?;
    encoder.encode_field(&b.range.end)?;
    encoder.encode_field(&b.duration_minutes)?;
    encoder.encode_field(&b.payment.amount.to_string())?;
    encoder.encode_field(&b.payment.status.as_str())?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for SpotSenseHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let tenant = self.resolve_tenant(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = crate::observability::command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(&tenant, cmd).await;
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label,
            "status" => if result.is_ok() { "ok" } else { "error" }
        )
        .increment(1);
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SpotSenseQueryParser;

#[async_trait]
impl QueryParser for SpotSenseQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_statement(stmt))
    }
}

fn schema_for_statement(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("FACILITY_STATS") {
        stats_schema()
    } else if upper.contains("FACILITIES") {
        facilities_schema()
    } else if upper.contains("EXTENSIONS") {
        extensions_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for SpotSenseHandler {
    type Statement = String;
    type QueryParser = SpotSenseQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let tenant = self.resolve_tenant(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&tenant, cmd).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for_statement(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
                && n > max {
                    max = n;
                }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SpotSenseFactory {
    handler: Arc<SpotSenseHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SpotSenseAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SpotSenseFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SpotSenseAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SpotSenseHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpotSenseFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Run one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SpotSenseFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
