use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat,
    FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::messages::data::DataRow;
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::ChairtimeAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct ChairtimeHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ChairtimeQueryParser>,
}

impl ChairtimeHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ChairtimeQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
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

    /// Parse, run and time one statement.
    async fn run(&self, engine: &Engine, query: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        debug!(command = label, status, "statement executed");

        result.map_err(engine_err)
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

async fn execute_command(
    engine: &Engine,
    cmd: Command,
    format: &Format,
) -> Result<Response, EngineError> {
    match cmd {
        Command::InsertSalon {
            id,
            opening_hour,
            closing_hour,
            max_concurrent_slots,
            name,
        } => {
            engine
                .create_salon(id, name, opening_hour, closing_hour, max_concurrent_slots)
                .await?;
            Ok(inserted())
        }
        Command::UpdateSalon {
            id,
            opening_hour,
            closing_hour,
            max_concurrent_slots,
            is_active,
        } => {
            engine
                .update_salon(id, opening_hour, closing_hour, max_concurrent_slots, is_active)
                .await?;
            Ok(inserted())
        }
        Command::InsertService {
            id,
            salon_id,
            duration_minutes,
            name,
        } => {
            engine
                .register_service(id, salon_id, name, duration_minutes)
                .await?;
            Ok(inserted())
        }
        Command::InsertSubService {
            id,
            service_id,
            pricing,
            price,
            name,
        } => {
            engine
                .register_sub_service(id, service_id, name, pricing, price)
                .await?;
            Ok(inserted())
        }
        Command::InsertAppointment { request } => {
            engine.book_appointment(request).await?;
            Ok(inserted())
        }
        Command::InsertCompletion {
            appointment_id,
            message,
        } => {
            engine.complete_appointment(appointment_id, message).await?;
            Ok(inserted())
        }
        Command::InsertCancellation {
            appointment_id,
            customer_id,
            message,
        } => {
            let actor = customer_id.map_or(Actor::Salon, Actor::Customer);
            engine
                .cancel_appointment(appointment_id, actor, message)
                .await?;
            Ok(inserted())
        }
        Command::InsertOffsiteQuote {
            appointment_id,
            extra_charge,
            response,
        } => {
            engine
                .quote_offsite(appointment_id, extra_charge, response)
                .await?;
            Ok(inserted())
        }
        Command::InsertOffsiteRejection {
            appointment_id,
            response,
        } => {
            engine.reject_offsite(appointment_id, response).await?;
            Ok(inserted())
        }
        Command::InsertQuoteResponse {
            appointment_id,
            customer_id,
            accepted,
        } => {
            if accepted {
                engine.accept_quote(appointment_id, customer_id).await?;
            } else {
                engine.reject_quote(appointment_id, customer_id).await?;
            }
            Ok(inserted())
        }
        Command::SelectAppointments { id: Some(id), filter } => {
            let appt = engine.get_appointment(id).await?;
            let rows = if filter.matches(&appt) { vec![appt] } else { vec![] };
            let total = rows.len();
            Ok(appointment_rows(&rows, total, total, format))
        }
        Command::SelectAppointments { id: None, filter } => {
            let page = engine.list_appointments(&filter).await?;
            Ok(appointment_rows(
                &page.appointments,
                page.total,
                page.total_pages,
                format,
            ))
        }
        Command::SelectAvailability {
            salon_id,
            service_id,
            start,
        } => {
            let check = engine
                .check_availability(salon_id, service_id, start)
                .await?;
            let schema = Arc::new(with_format(availability_schema(), format));
            let row = encode_availability(&schema, &check);
            Ok(query_response(schema, vec![row]))
        }
        Command::SelectDayAvailability {
            salon_id,
            service_id,
            date,
        } => {
            let offers = engine
                .day_availability(salon_id, service_id, date)
                .await?;
            let schema = Arc::new(with_format(day_availability_schema(), format));
            let rows = offers
                .iter()
                .map(|offer| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&format_timestamp(&offer.time))?;
                    encoder.encode_field(&i64::from(offer.slot_number))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectMonthAvailability {
            salon_id,
            service_id,
            year,
            month,
        } => {
            let days = engine
                .month_availability(salon_id, service_id, year, month)
                .await?;
            let schema = Arc::new(with_format(month_availability_schema(), format));
            let rows = days
                .iter()
                .map(|(date, day)| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&date.format("%Y-%m-%d").to_string())?;
                    encoder.encode_field(&day.available)?;
                    encoder.encode_field(&(day.total_slots as i64))?;
                    encoder.encode_field(&day.reason.as_str().to_string())?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectOverdueSweep { salon_id } => {
            let cancelled = engine
                .sweep_overdue(salon_id, chrono::Utc::now().naive_utc())
                .await?;
            let schema = Arc::new(with_format(overdue_sweep_schema(), format));
            let mut encoder = DataRowEncoder::new(schema.clone());
            let row = encoder.encode_field(&(cancelled as i64)).map(|()| encoder.take_row());
            Ok(query_response(schema, vec![row]))
        }
    }
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_availability(schema: &Arc<Vec<FieldInfo>>, check: &AvailabilityCheck) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&check.available)?;
    encoder.encode_field(&check.slot_number.map(i64::from))?;
    encoder.encode_field(&check.reason)?;
    Ok(encoder.take_row())
}

fn appointment_rows(
    appointments: &[Appointment],
    total: usize,
    total_pages: usize,
    format: &Format,
) -> Response {
    let schema = Arc::new(with_format(appointments_schema(), format));
    let rows = appointments
        .iter()
        .map(|appt| encode_appointment(&schema, appt, total, total_pages))
        .collect();
    query_response(schema, rows)
}

fn encode_appointment(
    schema: &Arc<Vec<FieldInfo>>,
    appt: &Appointment,
    total: usize,
    total_pages: usize,
) -> PgWireResult<DataRow> {
    let offsite = appt.offsite.as_ref();
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&appt.id.to_string())?;
    encoder.encode_field(&appt.salon_id.to_string())?;
    encoder.encode_field(&appt.customer_id.to_string())?;
    encoder.encode_field(&appt.service_id.to_string())?;
    encoder.encode_field(&appt.sub_service_id.map(|id| id.to_string()))?;
    encoder.encode_field(&format_timestamp(&appt.start))?;
    encoder.encode_field(&i64::from(appt.duration_minutes))?;
    encoder.encode_field(&i64::from(appt.slot_number))?;
    encoder.encode_field(&i64::from(appt.hours))?;
    encoder.encode_field(&appt.estimated_price)?;
    encoder.encode_field(&appt.status.to_string())?;
    encoder.encode_field(&appt.status_message)?;
    encoder.encode_field(&appt.is_offsite())?;
    encoder.encode_field(&offsite.map(|o| o.location.clone()))?;
    encoder.encode_field(&offsite.map(|o| o.status.to_string()))?;
    encoder.encode_field(&offsite.and_then(|o| o.extra_charge))?;
    encoder.encode_field(&offsite.and_then(|o| o.response.clone()))?;
    encoder.encode_field(&appt.notes)?;
    encoder.encode_field(&format_timestamp(&appt.created_at))?;
    encoder.encode_field(&(total as i64))?;
    encoder.encode_field(&(total_pages as i64))?;
    Ok(encoder.take_row())
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Re-tag columns with the wire format the client asked for. Extended
/// query clients usually want binary.
fn with_format(schema: Vec<FieldInfo>, format: &Format) -> Vec<FieldInfo> {
    schema
        .into_iter()
        .enumerate()
        .map(|(i, f)| {
            FieldInfo::new(
                f.name().to_string(),
                None,
                None,
                f.datatype().clone(),
                format.format_for(i),
            )
        })
        .collect()
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("salon_id", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("service_id", Type::VARCHAR),
        field("sub_service_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("duration_minutes", Type::INT8),
        field("slot_number", Type::INT8),
        field("hours", Type::INT8),
        field("estimated_price", Type::INT8),
        field("status", Type::VARCHAR),
        field("status_message", Type::VARCHAR),
        field("is_offsite", Type::BOOL),
        field("offsite_location", Type::VARCHAR),
        field("offsite_status", Type::VARCHAR),
        field("extra_charge", Type::INT8),
        field("offsite_response", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
        field("total", Type::INT8),
        field("total_pages", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("available", Type::BOOL),
        field("slot_number", Type::INT8),
        field("reason", Type::VARCHAR),
    ]
}

fn day_availability_schema() -> Vec<FieldInfo> {
    vec![field("time", Type::VARCHAR), field("slot_number", Type::INT8)]
}

fn month_availability_schema() -> Vec<FieldInfo> {
    vec![
        field("date", Type::VARCHAR),
        field("available", Type::BOOL),
        field("total_slots", Type::INT8),
        field("reason", Type::VARCHAR),
    ]
}

fn overdue_sweep_schema() -> Vec<FieldInfo> {
    vec![field("cancelled", Type::INT8)]
}

/// Result columns for a statement. Statements are described before their
/// `$n` values are bound, so this goes by the FROM clause alone.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_end_matches(';'))
        .unwrap_or_default();
    match table {
        "appointments" => appointments_schema(),
        "availability" => availability_schema(),
        "day_availability" => day_availability_schema(),
        "month_availability" => month_availability_schema(),
        "overdue_sweep" => overdue_sweep_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ChairtimeHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ChairtimeQueryParser;

#[async_trait]
impl QueryParser for ChairtimeQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        let schema = result_schema(stmt);
        Ok(match column_format {
            Some(format) => with_format(schema, format),
            None => schema,
        })
    }
}

#[async_trait]
impl ExtendedQueryHandler for ChairtimeHandler {
    type Statement = String;
    type QueryParser = ChairtimeQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql, &portal.result_column_format).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(with_format(
            result_schema(&target.statement.statement),
            &target.result_column_format,
        )))
    }
}

/// Highest `$n` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    portal
        .parameters
        .iter()
        .enumerate()
        .rev()
        .fold(portal.statement.statement.clone(), |sql, (i, param)| {
            let value = match param {
                Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
                None => "NULL".to_string(),
            };
            sql.replace(&format!("${}", i + 1), &value)
        })
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ChairtimeFactory {
    handler: Arc<ChairtimeHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<ChairtimeAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ChairtimeFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(ChairtimeHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                ChairtimeAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ChairtimeFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = ChairtimeFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
