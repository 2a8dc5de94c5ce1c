use std::fmt::Debug;
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

use crate::auth::AllotAuthSource;
use crate::engine::{Allocation, CandidateSource, Engine, EngineError, Quote};
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, HoldFilter, SqlError};
use crate::tenant::TenantManager;

pub struct AllotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AllotQueryParser>,
}

impl AllotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AllotQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let org = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&org).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("organization error: {e}"),
            )))
        })
    }

    /// Parse and execute one statement, recording query metrics.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertUnit { id, name } => {
                engine.create_unit(id, name).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertBucket { spec } => {
                engine.create_bucket(spec).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::SetBucketCapacity {
                bucket_id,
                range,
                quantity,
            } => {
                engine
                    .set_bucket_capacity(bucket_id, range, quantity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(range.nights() as usize)])
            }
            Command::DeleteBucket { id } => {
                engine.release_bucket(id).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::InsertPool { pool } => {
                engine.create_pool(pool).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertPoolVariant { pool_id, variant } => {
                engine
                    .add_pool_variant(pool_id, variant)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertRatePlan { plan } => {
                engine.create_rate_plan(plan).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertRateSeason {
                rate_plan_id,
                season,
            } => {
                engine
                    .add_rate_season(rate_plan_id, season)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertRateOccupancy {
                rate_plan_id,
                occupancy,
            } => {
                engine
                    .set_rate_occupancy(rate_plan_id, occupancy)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertRateFee { rate_plan_id, fee } => {
                engine
                    .add_rate_fee(rate_plan_id, fee)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertAdjustment {
                bucket_id,
                range,
                delta_booked,
                delta_held,
            } => {
                let rows = engine
                    .adjust(bucket_id, range, delta_booked, delta_held)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(rows.len())])
            }
            Command::InsertHold { request } => {
                let allocation = engine.resolve(&request).await.map_err(engine_err)?;
                Ok(vec![allocation_response(&allocation)?])
            }
            Command::DeleteHold { id } => {
                let released = engine.release_hold(id).await.map_err(engine_err)?;
                Ok(vec![deleted(released as usize)])
            }
            Command::InsertBooking { id } => {
                engine.confirm_hold(id).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DeleteBooking { id } => {
                let cancelled = engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![deleted(cancelled as usize)])
            }
            Command::SelectAvailability { unit_id, range } => {
                let days = engine
                    .get_availability(unit_id, range)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = days
                    .into_iter()
                    .map(|day| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&day.bucket_id.to_string())?;
                        encoder.encode_field(&day.night)?;
                        encoder.encode_field(&(day.quantity as i64))?;
                        encoder.encode_field(&(day.booked as i64))?;
                        encoder.encode_field(&(day.held as i64))?;
                        encoder.encode_field(&day.available.map(|a| a as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectHolds { filter } => {
                let holds = match filter {
                    HoldFilter::Id(id) => vec![engine.get_hold(id).await.map_err(engine_err)?],
                    HoldFilter::Unit(unit_id) => engine.list_holds(unit_id).await,
                };
                let schema = Arc::new(holds_schema());
                let rows: Vec<PgWireResult<_>> = holds
                    .into_iter()
                    .map(|hold| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&hold.id.to_string())?;
                        encoder.encode_field(&hold.bucket_id.to_string())?;
                        encoder.encode_field(&hold.unit_id.to_string())?;
                        encoder.encode_field(&hold.range.start)?;
                        encoder.encode_field(&hold.range.end)?;
                        encoder.encode_field(&(hold.quantity as i64))?;
                        encoder.encode_field(&hold.status.as_str().to_string())?;
                        encoder.encode_field(&hold.requires_confirmation)?;
                        encoder.encode_field(&hold.created_at)?;
                        encoder.encode_field(&hold.expires_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBuckets { unit_id } => {
                let buckets = engine.list_buckets(unit_id).await;
                let schema = Arc::new(buckets_schema());
                let rows: Vec<PgWireResult<_>> = buckets
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.unit_id.to_string())?;
                        encoder.encode_field(&b.supplier_id.to_string())?;
                        encoder.encode_field(&b.allocation_type.as_str().to_string())?;
                        encoder.encode_field(&b.priority)?;
                        encoder.encode_field(&b.cost_per_unit)?;
                        encoder.encode_field(&(b.overbooking_limit as i64))?;
                        encoder.encode_field(&b.released)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectQuote {
                bucket_id,
                range,
                quantity,
                occupancy,
                channel,
                market,
                currency,
            } => {
                let quote = engine
                    .quote_bucket(bucket_id, range, quantity, occupancy, channel, market, currency)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(quote_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&quote.currency)?;
                encoder.encode_field(&(quote.nights.len() as i64))?;
                encoder.encode_field(&quote.base_total)?;
                encoder.encode_field(&quote.tax_total)?;
                encoder.encode_field(&quote.fee_total)?;
                encoder.encode_field(&quote.total)?;
                encoder.encode_field(&quote.cost_total)?;
                encoder.encode_field(&segments_json(&quote)?)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

/// A resolved hold comes back as a single row, like `INSERT ... RETURNING`.
fn allocation_response(allocation: &Allocation) -> PgWireResult<Response> {
    let schema = Arc::new(allocation_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&allocation.hold_id.to_string())?;
    encoder.encode_field(&allocation.bucket_id.to_string())?;
    let source = match allocation.source {
        CandidateSource::Direct => "direct",
        CandidateSource::Pool(_) => "pool",
    };
    encoder.encode_field(&source.to_string())?;
    encoder.encode_field(&allocation.source.pool_id().map(|id| id.to_string()))?;
    encoder.encode_field(&allocation.requires_confirmation)?;
    encoder.encode_field(&allocation.expires_at)?;
    encoder.encode_field(&allocation.sell_price)?;
    encoder.encode_field(&allocation.quote.currency)?;
    encoder.encode_field(&allocation.quote.total)?;
    encoder.encode_field(&segments_json(&allocation.quote)?)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn segments_json(quote: &Quote) -> PgWireResult<String> {
    serde_json::to_string(&quote.segments).map_err(|e| PgWireError::ApiError(Box::new(e)))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("bucket_id", Type::VARCHAR),
        field("night", Type::INT4),
        field("quantity", Type::INT8),
        field("booked", Type::INT8),
        field("held", Type::INT8),
        field("available", Type::INT8),
    ]
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("bucket_id", Type::VARCHAR),
        field("unit_id", Type::VARCHAR),
        field("start", Type::INT4),
        field("end", Type::INT4),
        field("quantity", Type::INT8),
        field("status", Type::VARCHAR),
        field("requires_confirmation", Type::BOOL),
        field("created_at", Type::INT8),
        field("expires_at", Type::INT8),
    ]
}

fn buckets_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("unit_id", Type::VARCHAR),
        field("supplier_id", Type::VARCHAR),
        field("allocation_type", Type::VARCHAR),
        field("priority", Type::INT4),
        field("cost_per_unit", Type::INT8),
        field("overbooking_limit", Type::INT8),
        field("released", Type::BOOL),
    ]
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        field("currency", Type::VARCHAR),
        field("nights", Type::INT8),
        field("base_total", Type::INT8),
        field("tax_total", Type::INT8),
        field("fee_total", Type::INT8),
        field("total", Type::INT8),
        field("cost_total", Type::INT8),
        field("segments", Type::VARCHAR),
    ]
}

fn allocation_schema() -> Vec<FieldInfo> {
    vec![
        field("hold_id", Type::VARCHAR),
        field("bucket_id", Type::VARCHAR),
        field("source", Type::VARCHAR),
        field("pool_id", Type::VARCHAR),
        field("requires_confirmation", Type::BOOL),
        field("expires_at", Type::INT8),
        field("sell_price", Type::INT8),
        field("currency", Type::VARCHAR),
        field("total", Type::INT8),
        field("segments", Type::VARCHAR),
    ]
}

/// Result columns for a statement that has not been executed yet.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let target = |table: &str| {
        upper.contains(&format!("FROM {table}")) || upper.contains(&format!("INTO {table}"))
    };
    if upper.trim_start().starts_with("SELECT") {
        if target("AVAILABILITY") {
            return availability_schema();
        }
        if target("HOLDS") {
            return holds_schema();
        }
        if target("BUCKETS") {
            return buckets_schema();
        }
        if target("QUOTES") {
            return quote_schema();
        }
    } else if upper.trim_start().starts_with("INSERT") && target("HOLDS") {
        return allocation_schema();
    }
    vec![]
}

#[async_trait]
impl SimpleQueryHandler for AllotHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AllotQueryParser;

#[async_trait]
impl QueryParser for AllotQueryParser {
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
impl ExtendedQueryHandler for AllotHandler {
    type Statement = String;
    type QueryParser = AllotQueryParser;

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
        let mut responses = self.run(&engine, &sql).await?;
        responses
            .pop()
            .ok_or_else(|| sql_err(SqlError::Empty))
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    sql.split('$')
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Inline bound text parameters as quoted literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AllotFactory {
    handler: Arc<AllotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AllotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AllotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = AllotAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AllotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AllotFactory {
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
    let factory = AllotFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// SQLSTATE for an engine error. Storage faults are the only retryable class.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    if e.is_retryable() { "58030" } else { "P0001" }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
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
