use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

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

use crate::auth::ReslotAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::projector::{self, PREVIEW_BUDGET};
use crate::site::SiteManager;
use crate::sql::{self, Command, SqlError};

pub struct ReslotHandler {
    sites: Arc<SiteManager>,
    query_parser: Arc<ReslotQueryParser>,
}

impl ReslotHandler {
    pub fn new(sites: Arc<SiteManager>) -> Self {
        Self {
            sites,
            query_parser: Arc::new(ReslotQueryParser),
        }
    }

    /// The connection's database name selects the site.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let site = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.sites.get_or_create(&site).map_err(|e| {
            tracing::error!("cannot load site {site}: {e}");
            user_error("08006", format!("site error: {e}"))
        })
    }

    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertWindow { id, name, config } => {
                engine.create_window(id, name, config).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateWindow { id, patch } => {
                engine.edit_window(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteWindow { id } => {
                engine.delete_window(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertBooking(req) => {
                engine.book(req).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteBooking { id, reason } => {
                engine.cancel(id, reason).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectWindows { id } => {
                let windows = match id {
                    Some(id) => vec![engine.window_info(id).await.map_err(engine_err)?],
                    None => engine.list_windows().await,
                };
                let schema = Arc::new(windows_schema());
                let rows: Vec<PgWireResult<_>> = windows
                    .iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.id.to_string())?;
                        encoder.encode_field(&w.name)?;
                        encoder.encode_field(&w.config.date_begin.to_string())?;
                        encoder.encode_field(&w.config.date_end.to_string())?;
                        encoder.encode_field(&fmt_hhmm(w.config.time_first))?;
                        encoder.encode_field(&fmt_hhmm(w.config.time_last))?;
                        encoder.encode_field(&w.config.time_unit)?;
                        encoder.encode_field(&w.config.max_limit.map(i64::from))?;
                        encoder.encode_field(&(w.active_bookings as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookings { window_id, id, status } => {
                let mut bookings = match (id, window_id) {
                    (Some(id), _) => vec![engine.get_booking(id).await.map_err(engine_err)?],
                    (None, Some(window_id)) => {
                        engine.get_bookings(window_id, true).await.map_err(engine_err)?
                    }
                    (None, None) => return Err(sql_err(SqlError::MissingFilter("window_id"))),
                };
                bookings.retain(|b| {
                    window_id.is_none_or(|w| b.window_id == w) && status.is_none_or(|s| b.status == s)
                });
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.window_id.to_string())?;
                        encoder.encode_field(&b.slot_date.to_string())?;
                        encoder.encode_field(&fmt_hhmm(b.slot_time))?;
                        encoder.encode_field(&b.subject_id)?;
                        encoder.encode_field(&b.contact_name)?;
                        encoder.encode_field(&b.contact_phone)?;
                        encoder.encode_field(&b.memo)?;
                        encoder.encode_field(&b.line.map(|l| l.as_str().to_string()))?;
                        encoder.encode_field(&b.status.as_str().to_string())?;
                        encoder.encode_field(&b.created_at)?;
                        encoder.encode_field(&b.cancelled_at)?;
                        encoder.encode_field(&b.cancel_reason)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectSlots { window_id, from, to } => {
                let days = match (from, to) {
                    (None, None) => engine.window_availability(window_id).await,
                    _ => {
                        let config = engine.window_info(window_id).await.map_err(engine_err)?.config;
                        engine
                            .availability(
                                window_id,
                                from.unwrap_or(config.date_begin),
                                to.unwrap_or(config.date_end),
                            )
                            .await
                    }
                }
                .map_err(engine_err)?;

                let schema = Arc::new(slots_schema());
                let wid = window_id.to_string();
                let rows: Vec<PgWireResult<_>> = days
                    .iter()
                    .flat_map(|day| day.slots.iter())
                    .map(|row| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&wid)?;
                        encoder.encode_field(&row.slot.date.to_string())?;
                        encoder.encode_field(&fmt_hhmm(row.slot.time))?;
                        encoder.encode_field(&i64::from(row.occupied))?;
                        encoder.encode_field(&row.available.remaining().map(i64::from))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectCalendar { window_id, month } => {
                let grid = engine.calendar(window_id, month).await.map_err(engine_err)?;
                let schema = Arc::new(calendar_schema());
                let rows: Vec<PgWireResult<_>> = grid
                    .cells()
                    .map(|cell| {
                        let preview = cell.preview(PREVIEW_BUDGET);
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&cell.date.to_string())?;
                        encoder.encode_field(&cell.in_month)?;
                        encoder.encode_field(&cell.in_window)?;
                        encoder.encode_field(&(cell.bookings.len() as i64))?;
                        encoder.encode_field(&preview_json(preview.shown))?;
                        encoder.encode_field(&preview.overflow_label())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

/// Compact JSON rendering of the bookings shown in one calendar cell.
fn preview_json(shown: &[Booking]) -> String {
    let items: Vec<serde_json::Value> = shown
        .iter()
        .map(|b| {
            serde_json::json!({
                "id": b.id.to_string(),
                "time": fmt_hhmm(b.slot_time),
                "subject_id": b.subject_id,
                "contact_name": b.contact_name,
                "color": projector::color_for_tag(b.line),
            })
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn windows_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("date_begin"),
        text_field("date_end"),
        text_field("time_first"),
        text_field("time_last"),
        typed_field("time_unit", Type::INT4),
        typed_field("max_limit", Type::INT8),
        typed_field("active_bookings", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("window_id"),
        text_field("date"),
        text_field("time"),
        text_field("subject_id"),
        text_field("contact_name"),
        text_field("contact_phone"),
        text_field("memo"),
        text_field("line"),
        text_field("status"),
        typed_field("created_at", Type::INT8),
        typed_field("cancelled_at", Type::INT8),
        text_field("cancel_reason"),
    ]
}

/// `remaining` is NULL for unbounded windows.
fn slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("window_id"),
        text_field("date"),
        text_field("time"),
        typed_field("occupied", Type::INT8),
        typed_field("remaining", Type::INT8),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        text_field("date"),
        typed_field("in_month", Type::BOOL),
        typed_field("in_window", Type::BOOL),
        typed_field("bookings", Type::INT8),
        text_field("preview"),
        text_field("overflow"),
    ]
}

/// Table named after the first `FROM` of a SELECT, lowercased.
fn select_table(sql: &str) -> Option<String> {
    let mut words = sql.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("select") {
        return None;
    }
    words
        .skip_while(|w| !w.eq_ignore_ascii_case("from"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').trim_matches('"').to_lowercase())
}

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match select_table(sql).as_deref() {
        Some("windows") => windows_schema(),
        Some("bookings") => bookings_schema(),
        Some("slots") => slots_schema(),
        Some("calendar") => calendar_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ReslotHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.run(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ReslotQueryParser;

#[async_trait]
impl QueryParser for ReslotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReslotHandler {
    type Statement = String;
    type QueryParser = ReslotQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.run(&engine, cmd).await?;
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReslotFactory {
    handler: Arc<ReslotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ReslotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ReslotFactory {
    pub fn new(sites: Arc<SiteManager>, password: String) -> Self {
        let auth_source = ReslotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReslotHandler::new(sites)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReslotFactory {
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
    sites: Arc<SiteManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ReslotFactory::new(sites, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE per engine error kind.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidWindow(_) | EngineError::InvalidBooking(_) => "22023",
        EngineError::SlotOutOfWindow { .. } => "22008",
        EngineError::SlotFull { .. } => "53400",
        EngineError::DuplicateBooking(_) => "23505",
        EngineError::AlreadyExists(_) => "42710",
        EngineError::WindowNotFound(_) | EngineError::BookingNotFound(_) => "P0002",
        EngineError::AlreadyCancelled(_) => "55000",
        EngineError::BookingsOrphaned { .. } => "23503",
        EngineError::CapacityBelowOccupancy { .. } => "23514",
        EngineError::Contended(_) => "40001",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::LedgerUnderflow(_) | EngineError::WalError(_) => "XX000",
    }
}

fn user_error(code: &str, msg: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), msg)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM windows"), 0);
        assert_eq!(count_params("DELETE FROM bookings WHERE id = $1 AND reason = $2"), 2);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($10, $2)"), 10);
        assert_eq!(count_params("SELECT '$' FROM windows"), 0);
    }

    #[test]
    fn substitution_quotes_and_escapes() {
        let params: Vec<Option<&str>> = vec![Some("it's"), None];
        let out = substitute_params("DELETE FROM bookings WHERE id = $1 AND reason = $2", &params);
        assert_eq!(out, "DELETE FROM bookings WHERE id = 'it''s' AND reason = NULL");
    }

    #[test]
    fn describe_picks_schema_by_table() {
        assert_eq!(select_table("SELECT * FROM slots WHERE window_id = $1").as_deref(), Some("slots"));
        assert_eq!(select_table("select id from Calendar;").as_deref(), Some("calendar"));
        assert_eq!(select_table("DELETE FROM windows WHERE id = $1"), None);
        assert_eq!(result_schema("SELECT * FROM bookings WHERE id = $1").len(), 13);
        assert_eq!(result_schema("SELECT * FROM slots WHERE window_id = $1").len(), 5);
        assert!(result_schema("INSERT INTO windows VALUES ($1)").is_empty());
    }

    #[test]
    fn each_error_kind_has_its_own_sqlstate() {
        let id = Ulid::new();
        let slot = Slot::new(NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(), parse_hhmm("10:00").unwrap());
        assert_eq!(sqlstate(&EngineError::Contended(id)), "40001");
        assert_eq!(sqlstate(&EngineError::DuplicateBooking(id)), "23505");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(id)), "42710");
        assert_eq!(sqlstate(&EngineError::WindowNotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::SlotFull { slot, capacity: 2 }), "53400");

        let distinct = [
            EngineError::InvalidWindow("x"),
            EngineError::SlotOutOfWindow { window_id: id, slot },
            EngineError::SlotFull { slot, capacity: 1 },
            EngineError::DuplicateBooking(id),
            EngineError::AlreadyExists(id),
            EngineError::BookingNotFound(id),
            EngineError::AlreadyCancelled(id),
            EngineError::BookingsOrphaned { window_id: id, bookings: vec![] },
            EngineError::CapacityBelowOccupancy { limit: 1, occupied: 2 },
            EngineError::Contended(id),
            EngineError::LimitExceeded("x"),
            EngineError::WalError("x".into()),
        ];
        let mut codes: Vec<_> = distinct.iter().map(sqlstate).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), distinct.len());
    }
}
