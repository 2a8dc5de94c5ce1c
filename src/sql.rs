use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::ResolveRequest;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUnit {
        id: Ulid,
        name: Option<String>,
    },
    InsertBucket {
        spec: BucketSpec,
    },
    SetBucketCapacity {
        bucket_id: Ulid,
        range: NightRange,
        quantity: u32,
    },
    DeleteBucket {
        id: Ulid,
    },
    InsertPool {
        pool: InventoryPool,
    },
    InsertPoolVariant {
        pool_id: Ulid,
        variant: PoolVariant,
    },
    InsertRatePlan {
        plan: RatePlan,
    },
    InsertRateSeason {
        rate_plan_id: Ulid,
        season: RateSeason,
    },
    InsertRateOccupancy {
        rate_plan_id: Ulid,
        occupancy: RateOccupancy,
    },
    InsertRateFee {
        rate_plan_id: Ulid,
        fee: RateTaxFee,
    },
    InsertAdjustment {
        bucket_id: Ulid,
        range: NightRange,
        delta_booked: i64,
        delta_held: i64,
    },
    InsertHold {
        request: ResolveRequest,
    },
    DeleteHold {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectAvailability {
        unit_id: Ulid,
        range: NightRange,
    },
    SelectHolds {
        filter: HoldFilter,
    },
    SelectBuckets {
        unit_id: Ulid,
    },
    SelectQuote {
        bucket_id: Ulid,
        range: NightRange,
        quantity: u32,
        occupancy: u32,
        channel: String,
        market: String,
        currency: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldFilter {
    Unit(Ulid),
    Id(Ulid),
}

/// Column order assumed when an INSERT names no columns.
fn default_columns(table: &str) -> Option<&'static [&'static str]> {
    Some(match table {
        "units" => &["id", "name"],
        "buckets" => &[
            "id",
            "unit_id",
            "supplier_id",
            "allocation_type",
            "priority",
            "cost_per_unit",
            "overbooking_limit",
        ],
        "bucket_nights" => &["bucket_id", "start", "end", "quantity"],
        "pools" => &["id", "unit_id", "name", "auto_allocate"],
        "pool_variants" => &[
            "pool_id",
            "bucket_id",
            "priority",
            "cost_per_unit",
            "sell_price",
            "max_quantity",
        ],
        "rate_plans" => &[
            "id",
            "unit_id",
            "supplier_id",
            "currency",
            "market",
            "channel",
            "start",
            "end",
            "preferred",
            "fees_before_taxes",
        ],
        "rate_seasons" => &["id", "rate_plan_id", "start", "end", "nightly_rate"],
        "rate_occupancies" => &["rate_plan_id", "occupancy", "multiplier_bps"],
        "rate_fees" => &["id", "rate_plan_id", "name", "kind", "amount"],
        "adjustments" => &["bucket_id", "start", "end", "delta_booked", "delta_held"],
        "holds" => &[
            "id", "unit_id", "start", "end", "quantity", "occupancy", "channel", "market", "currency",
            "ttl_ms",
        ],
        "bookings" => &["id"],
        _ => return None,
    })
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// One VALUES row keyed by column name.
struct Row {
    table: String,
    values: HashMap<String, Expr>,
}

impl Row {
    fn required(&self, col: &'static str) -> Result<&Expr, SqlError> {
        self.values
            .get(col)
            .ok_or_else(|| SqlError::MissingColumn(self.table.clone(), col))
    }

    fn optional(&self, col: &str) -> Option<&Expr> {
        self.values.get(col).filter(|e| !is_null(e))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(col)?)
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.optional(col).map(parse_ulid_expr).transpose()
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.required(col)?)
    }

    fn opt_i64(&self, col: &str) -> Result<Option<i64>, SqlError> {
        self.optional(col).map(parse_i64_expr).transpose()
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        to_u32(self.i64(col)?)
    }

    fn i32(&self, col: &'static str) -> Result<i32, SqlError> {
        to_i32(self.i64(col)?)
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.required(col)?)
    }

    fn opt_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.optional(col).map(parse_string_expr).transpose()
    }

    fn bool_or(&self, col: &str, default: bool) -> Result<bool, SqlError> {
        self.optional(col).map_or(Ok(default), parse_bool)
    }

    /// `start` and `end` as a night range. Ordering is checked by the engine.
    fn range(&self) -> Result<NightRange, SqlError> {
        Ok(NightRange {
            start: self.i32("start")?,
            end: self.i32("end")?,
        })
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let Some(defaults) = default_columns(&table) else {
        return Err(SqlError::UnknownTable(table));
    };
    let row = insert_row(insert, &table, defaults)?;

    match row.table.as_str() {
        "units" => Ok(Command::InsertUnit {
            id: row.ulid("id")?,
            name: row.opt_string("name")?,
        }),
        "buckets" => {
            let kind = row.string("allocation_type")?;
            Ok(Command::InsertBucket {
                spec: BucketSpec {
                    id: row.ulid("id")?,
                    unit_id: row.ulid("unit_id")?,
                    supplier_id: row.ulid("supplier_id")?,
                    allocation_type: AllocationType::parse(&kind)
                        .ok_or_else(|| SqlError::Parse(format!("bad allocation_type: {kind}")))?,
                    priority: row.opt_i64("priority")?.map(to_i32).transpose()?.unwrap_or(0),
                    cost_per_unit: row.opt_i64("cost_per_unit")?.unwrap_or(0),
                    overbooking_limit: row
                        .opt_i64("overbooking_limit")?
                        .map(to_u32)
                        .transpose()?
                        .unwrap_or(0),
                },
            })
        }
        "bucket_nights" => Ok(Command::SetBucketCapacity {
            bucket_id: row.ulid("bucket_id")?,
            range: row.range()?,
            quantity: row.u32("quantity")?,
        }),
        "pools" => Ok(Command::InsertPool {
            pool: InventoryPool {
                id: row.ulid("id")?,
                unit_id: row.ulid("unit_id")?,
                name: row.opt_string("name")?,
                auto_allocate: row.bool_or("auto_allocate", true)?,
                variants: Vec::new(),
            },
        }),
        "pool_variants" => Ok(Command::InsertPoolVariant {
            pool_id: row.ulid("pool_id")?,
            variant: PoolVariant {
                bucket_id: row.ulid("bucket_id")?,
                priority: row.opt_i64("priority")?.map(to_i32).transpose()?.unwrap_or(0),
                cost_per_unit: row.opt_i64("cost_per_unit")?.unwrap_or(0),
                sell_price: row.opt_i64("sell_price")?,
                max_quantity: row.opt_i64("max_quantity")?.map(to_u32).transpose()?,
            },
        }),
        "rate_plans" => Ok(Command::InsertRatePlan {
            plan: RatePlan {
                id: row.ulid("id")?,
                unit_id: row.ulid("unit_id")?,
                supplier_id: row.opt_ulid("supplier_id")?,
                currency: row.string("currency")?,
                market: row.string("market")?,
                channel: row.string("channel")?,
                validity: row.range()?,
                preferred: row.bool_or("preferred", true)?,
                fees_before_taxes: row.bool_or("fees_before_taxes", false)?,
                seasons: Vec::new(),
                occupancies: Vec::new(),
                fees: Vec::new(),
            },
        }),
        "rate_seasons" => Ok(Command::InsertRateSeason {
            rate_plan_id: row.ulid("rate_plan_id")?,
            season: RateSeason {
                id: row.ulid("id")?,
                range: row.range()?,
                nightly_rate: row.i64("nightly_rate")?,
            },
        }),
        "rate_occupancies" => Ok(Command::InsertRateOccupancy {
            rate_plan_id: row.ulid("rate_plan_id")?,
            occupancy: RateOccupancy {
                occupancy: row.u32("occupancy")?,
                multiplier_bps: row.u32("multiplier_bps")?,
            },
        }),
        "rate_fees" => {
            let kind = row.string("kind")?;
            let amount = row.i64("amount")?;
            Ok(Command::InsertRateFee {
                rate_plan_id: row.ulid("rate_plan_id")?,
                fee: RateTaxFee {
                    id: row.ulid("id")?,
                    name: row.string("name")?,
                    kind: FeeKind::parse(&kind, amount)
                        .ok_or_else(|| SqlError::Parse(format!("bad fee kind/amount: {kind} {amount}")))?,
                },
            })
        }
        "adjustments" => Ok(Command::InsertAdjustment {
            bucket_id: row.ulid("bucket_id")?,
            range: row.range()?,
            delta_booked: row.opt_i64("delta_booked")?.unwrap_or(0),
            delta_held: row.opt_i64("delta_held")?.unwrap_or(0),
        }),
        "holds" => Ok(Command::InsertHold {
            request: ResolveRequest {
                hold_id: row.ulid("id")?,
                unit_id: row.ulid("unit_id")?,
                range: row.range()?,
                quantity: row.u32("quantity")?,
                occupancy: row.opt_i64("occupancy")?.map(to_u32).transpose()?.unwrap_or(1),
                channel: row.string("channel")?,
                market: row.string("market")?,
                currency: row.string("currency")?,
                ttl_ms: row.opt_i64("ttl_ms")?,
            },
        }),
        "bookings" => Ok(Command::InsertBooking { id: row.ulid("id")? }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "buckets" => Ok(Command::DeleteBucket { id }),
        "holds" => Ok(Command::DeleteHold { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability {
            unit_id: filters.ulid("unit_id")?,
            range: filters.range()?,
        }),
        "holds" => {
            let filter = match (filters.opt_ulid("id")?, filters.opt_ulid("unit_id")?) {
                (Some(id), _) => HoldFilter::Id(id),
                (None, Some(unit_id)) => HoldFilter::Unit(unit_id),
                (None, None) => return Err(SqlError::MissingFilter("unit_id")),
            };
            Ok(Command::SelectHolds { filter })
        }
        "buckets" => Ok(Command::SelectBuckets {
            unit_id: filters.ulid("unit_id")?,
        }),
        "quotes" => Ok(Command::SelectQuote {
            bucket_id: filters.ulid("bucket_id")?,
            range: filters.range()?,
            quantity: filters.u32_or("quantity", 1)?,
            occupancy: filters.u32_or("occupancy", 1)?,
            channel: filters.string("channel")?,
            market: filters.string("market")?,
            currency: filters.string("currency")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// WHERE clause conjunction: `col = value`, `start >= n`, `"end" <= n`.
#[derive(Default)]
struct Filters {
    eq: HashMap<String, Expr>,
    start: Option<Night>,
    end: Option<Night>,
}

impl Filters {
    fn collect(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                ast::BinaryOperator::And => {
                    self.collect(left)?;
                    self.collect(right)?;
                }
                ast::BinaryOperator::Eq => {
                    if let Some(col) = expr_column_name(left) {
                        self.eq.insert(col, (**right).clone());
                    }
                }
                ast::BinaryOperator::GtEq => {
                    if expr_column_name(left).as_deref() == Some("start") {
                        self.start = Some(to_i32(parse_i64_expr(right)?)?);
                    }
                }
                ast::BinaryOperator::LtEq => {
                    if expr_column_name(left).as_deref() == Some("end") {
                        self.end = Some(to_i32(parse_i64_expr(right)?)?);
                    }
                }
                _ => {}
            },
            Expr::Nested(inner) => self.collect(inner)?,
            _ => {}
        }
        Ok(())
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        self.opt_ulid(col)?.ok_or(SqlError::MissingFilter(col))
    }

    fn opt_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.eq.get(col).map(parse_ulid_expr).transpose()
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        self.eq
            .get(col)
            .map(parse_string_expr)
            .transpose()?
            .ok_or(SqlError::MissingFilter(col))
    }

    fn u32_or(&self, col: &str, default: u32) -> Result<u32, SqlError> {
        match self.eq.get(col) {
            Some(e) => to_u32(parse_i64_expr(e)?),
            None => Ok(default),
        }
    }

    fn range(&self) -> Result<NightRange, SqlError> {
        Ok(NightRange {
            start: self.start.ok_or(SqlError::MissingFilter("start"))?,
            end: self.end.ok_or(SqlError::MissingFilter("end"))?,
        })
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

/// The single VALUES row of an INSERT, keyed by the named columns (or the
/// table's default column order when none are given).
fn insert_row(insert: &ast::Insert, table: &str, defaults: &'static [&'static str]) -> Result<Row, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let rows = match body.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let values = match rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table.to_string(), columns.len(), values.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }

    Ok(Row {
        table: table.to_string(),
        values: columns.into_iter().zip(values.iter().cloned()).collect(),
    })
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn to_u32(v: i64) -> Result<u32, SqlError> {
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn to_i32(v: i64) -> Result<i32, SqlError> {
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(String, &'static str),
    WrongArity(String, usize, usize),
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
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    fn other() -> Ulid {
        Ulid::from_string(OTHER).unwrap()
    }

    #[test]
    fn parse_insert_unit() {
        let cmd = parse_sql(&format!("INSERT INTO units (id, name) VALUES ('{ID}', 'Double room')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertUnit {
                id: id(),
                name: Some("Double room".into())
            }
        );
        let cmd = parse_sql(&format!("INSERT INTO units VALUES ('{ID}')")).unwrap();
        assert_eq!(cmd, Command::InsertUnit { id: id(), name: None });
    }

    #[test]
    fn parse_insert_bucket_with_defaults() {
        let sql = format!(
            "INSERT INTO buckets (id, unit_id, supplier_id, allocation_type) VALUES ('{ID}', '{OTHER}', '{OTHER}', 'on_request')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBucket { spec } => {
                assert_eq!(spec.id, id());
                assert_eq!(spec.unit_id, other());
                assert_eq!(spec.allocation_type, AllocationType::OnRequest);
                assert_eq!((spec.priority, spec.cost_per_unit, spec.overbooking_limit), (0, 0, 0));
            }
            cmd => panic!("expected InsertBucket, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_bucket_columns_in_any_order() {
        let sql = format!(
            "INSERT INTO buckets (overbooking_limit, allocation_type, priority, cost_per_unit, supplier_id, unit_id, id) \
             VALUES (2, 'committed', -1, 4500, '{OTHER}', '{OTHER}', '{ID}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBucket { spec } => {
                assert_eq!(spec.id, id());
                assert_eq!(spec.priority, -1);
                assert_eq!(spec.cost_per_unit, 4500);
                assert_eq!(spec.overbooking_limit, 2);
            }
            cmd => panic!("expected InsertBucket, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_bad_allocation_type() {
        let sql = format!(
            "INSERT INTO buckets (id, unit_id, supplier_id, allocation_type) VALUES ('{ID}', '{ID}', '{ID}', 'free_sale')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_bucket_nights() {
        let sql = format!(r#"INSERT INTO bucket_nights (bucket_id, start, "end", quantity) VALUES ('{ID}', 20000, 20007, 12)"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetBucketCapacity {
                bucket_id: id(),
                range: NightRange::new(20_000, 20_007),
                quantity: 12
            }
        );
    }

    #[test]
    fn parse_pool_and_variant() {
        let sql = format!("INSERT INTO pools (id, unit_id, name, auto_allocate) VALUES ('{ID}', '{OTHER}', 'Block', false)");
        match parse_sql(&sql).unwrap() {
            Command::InsertPool { pool } => {
                assert!(!pool.auto_allocate);
                assert_eq!(pool.name.as_deref(), Some("Block"));
                assert!(pool.variants.is_empty());
            }
            cmd => panic!("expected InsertPool, got {cmd:?}"),
        }

        let sql = format!(
            "INSERT INTO pool_variants (pool_id, bucket_id, priority, cost_per_unit, sell_price, max_quantity) VALUES ('{ID}', '{OTHER}', 1, 80, NULL, 4)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertPoolVariant {
                pool_id: id(),
                variant: PoolVariant {
                    bucket_id: other(),
                    priority: 1,
                    cost_per_unit: 80,
                    sell_price: None,
                    max_quantity: Some(4),
                }
            }
        );
    }

    #[test]
    fn parse_rate_plan() {
        let sql = format!(
            r#"INSERT INTO rate_plans (id, unit_id, supplier_id, currency, market, channel, start, "end", preferred)
               VALUES ('{ID}', '{OTHER}', NULL, 'EUR', 'DE', 'web', 20000, 20365, true)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertRatePlan { plan } => {
                assert_eq!(plan.supplier_id, None);
                assert_eq!(plan.validity, NightRange::new(20_000, 20_365));
                assert!(plan.preferred);
                assert!(!plan.fees_before_taxes);
            }
            cmd => panic!("expected InsertRatePlan, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_rate_children() {
        let sql = format!(
            r#"INSERT INTO rate_seasons (id, rate_plan_id, start, "end", nightly_rate) VALUES ('{ID}', '{OTHER}', 20000, 20010, 12000)"#
        );
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::InsertRateSeason { season: RateSeason { nightly_rate: 12000, .. }, .. }
        ));

        let sql = format!("INSERT INTO rate_occupancies VALUES ('{OTHER}', 1, 8500)");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertRateOccupancy {
                rate_plan_id: other(),
                occupancy: RateOccupancy { occupancy: 1, multiplier_bps: 8_500 }
            }
        );

        let sql = format!("INSERT INTO rate_fees (id, rate_plan_id, name, kind, amount) VALUES ('{ID}', '{OTHER}', 'City tax', 'per_night', 250)");
        match parse_sql(&sql).unwrap() {
            Command::InsertRateFee { fee, .. } => assert_eq!(fee.kind, FeeKind::PerNight(250)),
            cmd => panic!("expected InsertRateFee, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_adjustment_with_negative_delta() {
        let sql = format!(r#"INSERT INTO adjustments (bucket_id, start, "end", delta_held) VALUES ('{ID}', 20000, 20002, -3)"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertAdjustment {
                bucket_id: id(),
                range: NightRange::new(20_000, 20_002),
                delta_booked: 0,
                delta_held: -3
            }
        );
    }

    #[test]
    fn parse_insert_hold_request() {
        let sql = format!(
            r#"INSERT INTO holds (id, unit_id, start, "end", quantity, occupancy, channel, market, currency)
               VALUES ('{ID}', '{OTHER}', 20000, 20003, 2, 2, 'web', 'DE', 'EUR')"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertHold { request } => {
                assert_eq!(request.hold_id, id());
                assert_eq!(request.unit_id, other());
                assert_eq!(request.range.nights(), 3);
                assert_eq!(request.quantity, 2);
                assert_eq!(request.currency, "EUR");
                assert_eq!(request.ttl_ms, None);
            }
            cmd => panic!("expected InsertHold, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_hold_missing_currency() {
        let sql = format!(
            r#"INSERT INTO holds (id, unit_id, start, "end", quantity, channel, market) VALUES ('{ID}', '{OTHER}', 1, 2, 1, 'web', 'DE')"#
        );
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn(t, "currency")) if t == "holds"
        ));
    }

    #[test]
    fn parse_bookings_and_deletes() {
        assert_eq!(
            parse_sql(&format!("INSERT INTO bookings (id) VALUES ('{ID}')")).unwrap(),
            Command::InsertBooking { id: id() }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM bookings WHERE id = '{ID}'")).unwrap(),
            Command::DeleteBooking { id: id() }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM holds WHERE id = '{ID}'")).unwrap(),
            Command::DeleteHold { id: id() }
        );
        assert_eq!(
            parse_sql(&format!("DELETE FROM buckets WHERE id = '{ID}'")).unwrap(),
            Command::DeleteBucket { id: id() }
        );
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(r#"SELECT * FROM availability WHERE unit_id = '{ID}' AND start >= 20000 AND "end" <= 20007"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                unit_id: id(),
                range: NightRange::new(20_000, 20_007)
            }
        );
        let sql = format!("SELECT * FROM availability WHERE unit_id = '{ID}' AND start >= 20000");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_select_holds_by_id_or_unit() {
        assert_eq!(
            parse_sql(&format!("SELECT * FROM holds WHERE id = '{ID}'")).unwrap(),
            Command::SelectHolds { filter: HoldFilter::Id(id()) }
        );
        assert_eq!(
            parse_sql(&format!("SELECT * FROM holds WHERE unit_id = '{ID}'")).unwrap(),
            Command::SelectHolds { filter: HoldFilter::Unit(id()) }
        );
        assert!(parse_sql("SELECT * FROM holds").is_err());
    }

    #[test]
    fn parse_select_quote() {
        let sql = format!(
            r#"SELECT * FROM quotes WHERE bucket_id = '{ID}' AND start >= 20000 AND "end" <= 20005
               AND quantity = 2 AND channel = 'web' AND market = 'DE' AND currency = 'EUR'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectQuote { bucket_id, range, quantity, occupancy, currency, .. } => {
                assert_eq!(bucket_id, id());
                assert_eq!(range.nights(), 5);
                assert_eq!(quantity, 2);
                assert_eq!(occupancy, 1);
                assert_eq!(currency, "EUR");
            }
            cmd => panic!("expected SelectQuote, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO foobar (id) VALUES ('{ID}')")),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO units (id, colour) VALUES ('{ID}', 'red')")),
            Err(SqlError::UnknownColumn(c)) if c == "colour"
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO units (id, name) VALUES ('{ID}')")),
            Err(SqlError::WrongArity(..))
        ));
        assert!(matches!(
            parse_sql(&format!("INSERT INTO bookings (id) VALUES ('{ID}'), ('{OTHER}')")),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("INSERT INTO bookings (id) VALUES ('not-a-ulid')"),
            Err(SqlError::Parse(_))
        ));
    }
}
