use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotdStartupHandler;
use crate::engine::{Engine, EngineError};
use crate::identity::{Directory, IdentityProvider};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct SlotdHandler {
    engine: Arc<Engine>,
    directory: Arc<Directory>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(engine: Arc<Engine>, directory: Arc<Directory>) -> Self {
        Self {
            engine,
            directory,
            query_parser: Arc::new(SlotdQueryParser),
        }
    }

    /// The startup handshake already checked the password; map the login name to its actor.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client
            .metadata()
            .get("user")
            .map(String::as_str)
            .unwrap_or_default();
        self.directory
            .resolve(user)
            .map_err(|e| user_error("28000", e.to_string()))
    }

    async fn run(&self, actor: Actor, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        tracing::debug!(command = label, actor = actor.id, "executing");

        let result = if is_read(&cmd) {
            execute(&self.engine, &actor, cmd).await
        } else {
            // Detached: a client hanging up must not abort a commit half-way.
            let engine = self.engine.clone();
            tokio::spawn(async move { execute(&engine, &actor, cmd).await })
                .await
                .unwrap_or_else(|e| Err(EngineError::WalError(format!("mutation task failed: {e}"))))
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => respond(outcome, format),
            Err(e) => {
                tracing::debug!(command = label, "rejected: {e}");
                Err(engine_err(e))
            }
        }
    }
}

/// What an executed command produced, before it is encoded for the wire.
enum Outcome {
    Services(Vec<ServiceInfo>),
    Bookings(Vec<Booking>),
    Conflicts(Vec<Booking>),
    Reviews(Vec<Review>),
    Done { tag: &'static str, rows: usize },
}

impl Outcome {
    fn written(tag: &'static str, returning: bool, booking: Booking) -> Self {
        if returning {
            Outcome::Bookings(vec![booking])
        } else {
            Outcome::Done { tag, rows: 1 }
        }
    }
}

fn is_read(cmd: &Command) -> bool {
    matches!(
        cmd,
        Command::SelectServices { .. }
            | Command::SelectService { .. }
            | Command::SelectBookings { .. }
            | Command::SelectConflicts { .. }
            | Command::SelectReviews { .. }
    )
}

async fn execute(engine: &Engine, actor: &Actor, cmd: Command) -> Result<Outcome, EngineError> {
    let done = |tag| Ok(Outcome::Done { tag, rows: 1 });
    match cmd {
        Command::InsertService(new) => {
            engine.create_service(actor, new).await?;
            done("INSERT")
        }
        Command::UpdateService { id, patch } => {
            engine.update_service(actor, id, patch).await?;
            done("UPDATE")
        }
        Command::DeleteService { id } => {
            engine.delete_service(actor, id).await?;
            done("DELETE")
        }
        Command::SelectServices { active } => {
            Ok(Outcome::Services(engine.list_services(active).await))
        }
        Command::SelectService { id } => Ok(Outcome::Services(vec![engine.get_service_info(id).await?])),
        Command::InsertBooking {
            service_id,
            start,
            end,
            returning,
        } => {
            let booking = engine.create_booking(actor, service_id, start, end).await?;
            Ok(Outcome::written("INSERT", returning, booking))
        }
        Command::UpdateBooking {
            id,
            changes,
            returning,
        } => {
            let booking = if changes.status == Some(BookingStatus::Completed) {
                if changes.touches_interval() {
                    return Err(EngineError::Validation(
                        "completion cannot be combined with a reschedule",
                    ));
                }
                engine.complete_booking(actor, id).await?
            } else {
                engine.transition_booking(actor, id, changes).await?
            };
            Ok(Outcome::written("UPDATE", returning, booking))
        }
        Command::DeleteBooking { id, returning } => {
            let booking = engine.delete_booking(actor, id).await?;
            Ok(Outcome::written("DELETE", returning, booking))
        }
        Command::SelectBookings { id: Some(id), filter } => {
            let booking = engine.get_booking(actor, id).await?;
            let rows = if filter.matches(&booking) { vec![booking] } else { vec![] };
            Ok(Outcome::Bookings(rows))
        }
        Command::SelectBookings { id: None, filter } => {
            Ok(Outcome::Bookings(engine.list_bookings(actor, filter).await))
        }
        Command::SelectConflicts {
            service_id,
            start,
            end,
        } => Ok(Outcome::Conflicts(
            engine.check_conflict(service_id, start, end, None).await?,
        )),
        Command::InsertReview {
            booking_id,
            rating,
            comment,
            returning,
        } => {
            let review = engine.create_review(actor, booking_id, rating, comment).await?;
            if returning {
                Ok(Outcome::Reviews(vec![review]))
            } else {
                done("INSERT")
            }
        }
        Command::UpdateReview { id, patch } => {
            engine.update_review(actor, id, patch).await?;
            done("UPDATE")
        }
        Command::DeleteReview { id } => {
            engine.delete_review(actor, id).await?;
            done("DELETE")
        }
        Command::SelectReviews { service_id } => {
            Ok(Outcome::Reviews(engine.list_reviews(service_id).await))
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Services,
    Bookings,
    Conflicts,
    Reviews,
}

impl Table {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "services" => Some(Table::Services),
            "bookings" => Some(Table::Bookings),
            "conflicts" => Some(Table::Conflicts),
            "reviews" => Some(Table::Reviews),
            _ => None,
        }
    }

    fn columns(self) -> Vec<(&'static str, Type)> {
        match self {
            Table::Services => vec![
                ("id", Type::INT8),
                ("title", Type::VARCHAR),
                ("description", Type::VARCHAR),
                ("price_cents", Type::INT8),
                ("duration_minutes", Type::INT8),
                ("active", Type::BOOL),
                ("created_at", Type::INT8),
            ],
            Table::Bookings => vec![
                ("id", Type::INT8),
                ("user_id", Type::INT8),
                ("service_id", Type::INT8),
                ("start", Type::INT8),
                ("end", Type::INT8),
                ("status", Type::VARCHAR),
                ("created_at", Type::INT8),
            ],
            // No owner column: conflict probes are open to every user.
            Table::Conflicts => vec![
                ("id", Type::INT8),
                ("service_id", Type::INT8),
                ("start", Type::INT8),
                ("end", Type::INT8),
                ("status", Type::VARCHAR),
            ],
            Table::Reviews => vec![
                ("id", Type::INT8),
                ("booking_id", Type::INT8),
                ("user_id", Type::INT8),
                ("rating", Type::INT8),
                ("comment", Type::VARCHAR),
                ("created_at", Type::INT8),
            ],
        }
    }

    fn schema(self, format: &Format) -> Vec<FieldInfo> {
        self.columns()
            .into_iter()
            .enumerate()
            .map(|(i, (name, ty))| FieldInfo::new(name.into(), None, None, ty, format.format_for(i)))
            .collect()
    }
}

/// Which table's rows a statement returns, judged from its text. `None` for
/// statements that only report a command tag.
fn result_table(sql: &str) -> Option<Table> {
    let words: Vec<&str> = sql.split_whitespace().collect();
    let first = words.first()?;
    let returns_rows = first.eq_ignore_ascii_case("SELECT")
        || words.iter().any(|w| w.eq_ignore_ascii_case("RETURNING"));
    if !returns_rows {
        return None;
    }
    let at = words.iter().position(|w| {
        ["FROM", "INTO", "UPDATE"]
            .iter()
            .any(|kw| w.eq_ignore_ascii_case(kw))
    })?;
    let name = words.get(at + 1)?;
    let name = name
        .split(|c: char| c == '(' || c == ';')
        .next()
        .unwrap_or_default()
        .trim_matches('"');
    Table::from_name(name)
}

fn describe(sql: &str) -> Vec<FieldInfo> {
    result_table(sql)
        .map(|t| t.schema(&Format::UnifiedText))
        .unwrap_or_default()
}

fn encode_rows<T>(
    table: Table,
    format: &Format,
    items: Vec<T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(table.schema(format));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_service(encoder: &mut DataRowEncoder, s: &ServiceInfo) -> PgWireResult<()> {
    encoder.encode_field(&s.id)?;
    encoder.encode_field(&s.title)?;
    encoder.encode_field(&s.description)?;
    encoder.encode_field(&s.price_cents)?;
    encoder.encode_field(&i64::from(s.duration_minutes))?;
    encoder.encode_field(&s.active)?;
    encoder.encode_field(&s.created_at)
}

fn encode_booking(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id)?;
    encoder.encode_field(&b.user_id)?;
    encoder.encode_field(&b.service_id)?;
    encoder.encode_field(&b.span.start)?;
    encoder.encode_field(&b.span.end)?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.created_at)
}

fn encode_conflict(encoder: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    encoder.encode_field(&b.id)?;
    encoder.encode_field(&b.service_id)?;
    encoder.encode_field(&b.span.start)?;
    encoder.encode_field(&b.span.end)?;
    encoder.encode_field(&b.status.as_str())
}

fn encode_review(encoder: &mut DataRowEncoder, r: &Review) -> PgWireResult<()> {
    encoder.encode_field(&r.id)?;
    encoder.encode_field(&r.booking_id)?;
    encoder.encode_field(&r.user_id)?;
    encoder.encode_field(&i64::from(r.rating))?;
    encoder.encode_field(&r.comment)?;
    encoder.encode_field(&r.created_at)
}

fn respond(outcome: Outcome, format: &Format) -> PgWireResult<Response> {
    Ok(match outcome {
        Outcome::Services(s) => encode_rows(Table::Services, format, s, encode_service),
        Outcome::Bookings(b) => encode_rows(Table::Bookings, format, b, encode_booking),
        Outcome::Conflicts(b) => encode_rows(Table::Conflicts, format, b, encode_conflict),
        Outcome::Reviews(r) => encode_rows(Table::Reviews, format, r, encode_review),
        Outcome::Done { tag, rows } => Response::Execution(Tag::new(tag).with_rows(rows)),
    })
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(actor, cmd, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
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
        Ok(match (result_table(stmt), column_format) {
            (Some(table), Some(format)) => table.schema(format),
            _ => describe(stmt),
        })
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(actor, cmd, &portal.result_column_format).await
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
            describe(&target.statement),
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
        let schema = result_table(&target.statement.statement)
            .map(|t| t.schema(&target.result_column_format))
            .unwrap_or_default();
        Ok(DescribePortalResponse::new(schema))
    }
}

enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split `sql` on `$N` placeholders. Quoted literals and identifiers are
/// plain text, so a `$1` inside `'...'` or `"..."` is never a placeholder.
fn split_placeholders(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut quote = None;
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match (quote, bytes[i]) {
            // A doubled quote closes and reopens, which leaves us inside.
            (Some(q), b) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b @ (b'\'' | b'"')) => quote = Some(b),
            (None, b'$') => {
                let digits = bytes[i + 1..].iter().take_while(|d| d.is_ascii_digit()).count();
                if digits > 0
                    && let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>()
                {
                    pieces.push(Piece::Text(&sql[text_start..i]));
                    pieces.push(Piece::Param(n));
                    i += 1 + digits;
                    text_start = i;
                    continue;
                }
            }
            (None, _) => {}
        }
        i += 1;
    }
    pieces.push(Piece::Text(&sql[text_start..]));
    pieces
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    split_placeholders(sql)
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => Some(n),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

/// One pass over the statement: bound values are copied out as quoted
/// literals and never scanned again for placeholders.
fn substitute(sql: &str, params: &[Option<impl AsRef<[u8]>>]) -> String {
    let mut out = String::with_capacity(sql.len());
    for piece in split_placeholders(sql) {
        match piece {
            Piece::Text(text) => out.push_str(text),
            Piece::Param(n) => match n.checked_sub(1).and_then(|i| params.get(i)) {
                Some(Some(bytes)) => {
                    let text = String::from_utf8_lossy(bytes.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                Some(None) => out.push_str("NULL"),
                // Unbound: leave it for the parser to reject.
                None => {
                    out.push('$');
                    out.push_str(&n.to_string());
                }
            },
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler: Arc<SlotdStartupHandler>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(engine: Arc<Engine>, directory: Arc<Directory>) -> Self {
        Self {
            auth_handler: Arc::new(SlotdStartupHandler::new(directory.clone())),
            handler: Arc::new(SlotdHandler::new(engine, directory)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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
    engine: Arc<Engine>,
    directory: Arc<Directory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotdFactory::new(engine, directory));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::Forbidden(_) => "42501",
        EngineError::NotFound(..) => "P0002",
        EngineError::AlreadyExists(..) => "23505",
        EngineError::HasBookings(_) | EngineError::HasReview(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(msg) = &e {
        tracing::error!("persistence failure: {msg}");
    }
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidStatus(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
