// Database connection, schema bootstrap, CSV seeding and read queries
use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use std::path::Path;
use std::str::FromStr;

// Schema preserved exactly for compatibility with the previous back office:
// eight tables, NUMERIC(19,5) for every monetary column.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS fx (
        currency_id VARCHAR(3) PRIMARY KEY,
        rate NUMERIC(19,5) NOT NULL CHECK (rate > 0),
        initial NUMERIC(19,5) NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS bond (
        bond_id VARCHAR(6) PRIMARY KEY,
        currency_id VARCHAR(3) NOT NULL REFERENCES fx (currency_id),
        price NUMERIC(19,5),
        initial_price NUMERIC(19,5)
    )",
    "CREATE TABLE IF NOT EXISTS desk (
        desk_id VARCHAR(5) PRIMARY KEY,
        cash NUMERIC(19,5) NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS trader (
        trader_id VARCHAR(8) PRIMARY KEY,
        desk_id VARCHAR(5) NOT NULL REFERENCES desk (desk_id)
    )",
    "CREATE TABLE IF NOT EXISTS book (
        book_id VARCHAR(5) PRIMARY KEY,
        trader_id VARCHAR(8) NOT NULL REFERENCES trader (trader_id)
    )",
    "CREATE TABLE IF NOT EXISTS bond_record (
        id BIGSERIAL PRIMARY KEY,
        trader_id VARCHAR(8) NOT NULL REFERENCES trader (trader_id),
        book_id VARCHAR(5) NOT NULL REFERENCES book (book_id),
        bond_id VARCHAR(6) NOT NULL REFERENCES bond (bond_id),
        position BIGINT NOT NULL DEFAULT 0 CHECK (position >= 0),
        UNIQUE (trader_id, book_id, bond_id)
    )",
    "CREATE TABLE IF NOT EXISTS event_log (
        event_id BIGINT PRIMARY KEY,
        desk_id VARCHAR(5) NOT NULL REFERENCES desk (desk_id),
        trader_id VARCHAR(8) NOT NULL REFERENCES trader (trader_id),
        book_id VARCHAR(5) NOT NULL REFERENCES book (book_id),
        buy_sell VARCHAR(4) NOT NULL,
        quantity BIGINT NOT NULL,
        bond_id VARCHAR(6) NOT NULL REFERENCES bond (bond_id),
        position BIGINT NOT NULL,
        price NUMERIC(19,5) NOT NULL,
        fx_rate NUMERIC(19,5) NOT NULL,
        value NUMERIC(19,5) NOT NULL,
        cash NUMERIC(19,5) NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS fx_event_log (
        event_id BIGINT PRIMARY KEY,
        currency_id VARCHAR(3) NOT NULL REFERENCES fx (currency_id),
        rate NUMERIC(19,5) NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS price_event_log (
        event_id BIGINT PRIMARY KEY,
        bond_id VARCHAR(6) NOT NULL REFERENCES bond (bond_id),
        price NUMERIC(19,5) NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS event_exception_log (
        event_id BIGINT PRIMARY KEY,
        desk_id VARCHAR(5) NOT NULL REFERENCES desk (desk_id),
        trader_id VARCHAR(8) NOT NULL REFERENCES trader (trader_id),
        book_id VARCHAR(5) NOT NULL REFERENCES book (book_id),
        buy_sell VARCHAR(4) NOT NULL,
        quantity BIGINT NOT NULL,
        bond_id VARCHAR(6) NOT NULL REFERENCES bond (bond_id),
        price NUMERIC(19,5),
        exclusion_type VARCHAR(20) NOT NULL
    )",
];

// Create a connection pool to PostgreSQL
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Create the eight tables if they do not exist yet.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    for ddl in SCHEMA {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

// ============================================================================
// CSV SEEDING
// ============================================================================

/// Read a seed CSV, skipping the header row.
fn read_csv_rows(path: &Path) -> Result<Vec<Vec<String>>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file {}", path.display()))?;
    let rows = contents
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split(',').map(|cell| cell.trim().to_string()).collect())
        .collect();
    Ok(rows)
}

fn csv_cell<'a>(row: &'a [String], idx: usize, path: &Path) -> Result<&'a str> {
    row.get(idx)
        .map(|s| s.as_str())
        .ok_or_else(|| anyhow!("Malformed row in {}: {:?}", path.display(), row))
}

/// Seed `fx`, `bond` and `desk` from the startup CSVs.
///
/// Inserts are `ON CONFLICT DO NOTHING` so a restart against an already
/// seeded database leaves existing rows (and any applied events) untouched.
pub async fn seed_reference_data(pool: &PgPool, data_dir: &str) -> Result<()> {
    let dir = Path::new(data_dir);

    let fx_path = dir.join("initial_fx.csv");
    for row in read_csv_rows(&fx_path)? {
        let currency_id = csv_cell(&row, 0, &fx_path)?;
        let rate = Decimal::from_str(csv_cell(&row, 1, &fx_path)?)
            .with_context(|| format!("Bad FX rate for {}", currency_id))?;
        sqlx::query(
            "INSERT INTO fx (currency_id, rate, initial) VALUES ($1, $2, $2)
             ON CONFLICT (currency_id) DO NOTHING",
        )
        .bind(currency_id)
        .bind(rate)
        .execute(pool)
        .await?;
    }

    let bond_path = dir.join("bond_details.csv");
    for row in read_csv_rows(&bond_path)? {
        sqlx::query(
            "INSERT INTO bond (bond_id, currency_id) VALUES ($1, $2)
             ON CONFLICT (bond_id) DO NOTHING",
        )
        .bind(csv_cell(&row, 0, &bond_path)?)
        .bind(csv_cell(&row, 1, &bond_path)?)
        .execute(pool)
        .await?;
    }

    let desk_path = dir.join("initial_cash.csv");
    for row in read_csv_rows(&desk_path)? {
        let desk_id = csv_cell(&row, 0, &desk_path)?;
        let cash = Decimal::from_str(csv_cell(&row, 1, &desk_path)?)
            .with_context(|| format!("Bad initial cash for desk {}", desk_id))?;
        sqlx::query(
            "INSERT INTO desk (desk_id, cash) VALUES ($1, $2)
             ON CONFLICT (desk_id) DO NOTHING",
        )
        .bind(desk_id)
        .bind(cash)
        .execute(pool)
        .await?;
    }

    Ok(())
}

// ============================================================================
// SEQUENCING BOUNDARY
// ============================================================================

/// Largest event id recorded in any of the four logs; 0 on empty logs.
///
/// This is the release boundary: exclusion rows advance it exactly like
/// accepted trades and market updates.
pub async fn last_event_id(pool: &PgPool) -> Result<i64> {
    let row = sqlx::query(
        "SELECT GREATEST(
            COALESCE((SELECT MAX(event_id) FROM event_log), 0),
            COALESCE((SELECT MAX(event_id) FROM event_exception_log), 0),
            COALESCE((SELECT MAX(event_id) FROM fx_event_log), 0),
            COALESCE((SELECT MAX(event_id) FROM price_event_log), 0)
        ) AS last_id",
    )
    .fetch_one(pool)
    .await?;

    Ok(row.get("last_id"))
}

// ============================================================================
// LOG SCANS (report reconstruction)
// ============================================================================

/// Denormalized `event_log` row; the deltas replay uses are the logged
/// `value` and `quantity`, not recomputed market data.
#[derive(Debug, Clone)]
pub struct TradeLogRow {
    pub event_id: i64,
    pub desk: String,
    pub trader: String,
    pub book: String,
    pub buy_sell: String,
    pub quantity: i64,
    pub bond: String,
    pub position: i64,
    pub price: Decimal,
    pub fx_rate: Decimal,
    pub value: Decimal,
    pub cash: Decimal,
}

fn trade_log_from_row(row: &sqlx::postgres::PgRow) -> TradeLogRow {
    TradeLogRow {
        event_id: row.get("event_id"),
        desk: row.get("desk_id"),
        trader: row.get("trader_id"),
        book: row.get("book_id"),
        buy_sell: row.get("buy_sell"),
        quantity: row.get("quantity"),
        bond: row.get("bond_id"),
        position: row.get("position"),
        price: row.get("price"),
        fx_rate: row.get("fx_rate"),
        value: row.get("value"),
        cash: row.get("cash"),
    }
}

/// Trade log rows with `from_exclusive < event_id <= to_inclusive`,
/// ascending when advancing and descending when backtracking.
pub async fn trade_logs_between(
    pool: &PgPool,
    from_exclusive: i64,
    to_inclusive: i64,
    ascending: bool,
) -> Result<Vec<TradeLogRow>> {
    let order = if ascending { "ASC" } else { "DESC" };
    let sql = format!(
        "SELECT event_id, desk_id, trader_id, book_id, buy_sell, quantity, bond_id,
                position, price, fx_rate, value, cash
         FROM event_log
         WHERE event_id > $1 AND event_id <= $2
         ORDER BY event_id {}",
        order
    );

    let rows = sqlx::query(&sql)
        .bind(from_exclusive)
        .bind(to_inclusive)
        .fetch_all(pool)
        .await?;

    Ok(rows.iter().map(trade_log_from_row).collect())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExclusionRow {
    pub event_id: i64,
    pub desk: String,
    pub trader: String,
    pub book: String,
    pub buy_sell: String,
    pub quantity: i64,
    pub bond: String,
    pub price: Option<Decimal>,
    pub exclusion_type: String,
}

/// Exception log rows with `event_id <= target`, ascending.
pub async fn exclusions_up_to(pool: &PgPool, target: i64) -> Result<Vec<ExclusionRow>> {
    let rows = sqlx::query(
        "SELECT event_id, desk_id, trader_id, book_id, buy_sell, quantity, bond_id,
                price, exclusion_type
         FROM event_exception_log
         WHERE event_id <= $1
         ORDER BY event_id ASC",
    )
    .bind(target)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ExclusionRow {
            event_id: row.get("event_id"),
            desk: row.get("desk_id"),
            trader: row.get("trader_id"),
            book: row.get("book_id"),
            buy_sell: row.get("buy_sell"),
            quantity: row.get("quantity"),
            bond: row.get("bond_id"),
            price: row.get("price"),
            exclusion_type: row.get("exclusion_type"),
        })
        .collect())
}

/// Per-currency rate as of `target`: latest `fx_event_log` entry at or
/// before it, falling back to the seeded initial rate.
pub async fn fx_rates_as_of(pool: &PgPool, target: i64) -> Result<Vec<(String, Decimal)>> {
    let rows = sqlx::query(
        "SELECT f.currency_id, COALESCE(l.rate, f.initial) AS rate
         FROM fx f
         LEFT JOIN LATERAL (
             SELECT rate FROM fx_event_log
             WHERE currency_id = f.currency_id AND event_id <= $1
             ORDER BY event_id DESC LIMIT 1
         ) l ON TRUE
         ORDER BY f.currency_id",
    )
    .bind(target)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("currency_id"), row.get("rate")))
        .collect())
}

/// Per-bond price as of `target`: latest `price_event_log` entry at or
/// before it, falling back to `initial_price` (NULL when the bond had no
/// price event yet at that point).
pub async fn bond_prices_as_of(
    pool: &PgPool,
    target: i64,
) -> Result<Vec<(String, Option<Decimal>)>> {
    let rows = sqlx::query(
        "SELECT b.bond_id, COALESCE(l.price, b.initial_price) AS price
         FROM bond b
         LEFT JOIN LATERAL (
             SELECT price FROM price_event_log
             WHERE bond_id = b.bond_id AND event_id <= $1
             ORDER BY event_id DESC LIMIT 1
         ) l ON TRUE
         ORDER BY b.bond_id",
    )
    .bind(target)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("bond_id"), row.get("price")))
        .collect())
}

// ============================================================================
// REFERENCE SNAPSHOT (report cache initialization)
// ============================================================================

#[derive(Debug, Clone)]
pub struct BondRow {
    pub bond_id: String,
    pub currency_id: String,
    pub price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct PositionRow {
    pub desk: String,
    pub trader: String,
    pub book: String,
    pub bond: String,
    pub position: i64,
}

/// The current reference store, as one consistent read per table.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSnapshot {
    pub fx: Vec<(String, Decimal)>,
    pub bonds: Vec<BondRow>,
    pub desks: Vec<(String, Decimal)>,
    pub positions: Vec<PositionRow>,
}

pub async fn reference_snapshot(pool: &PgPool) -> Result<ReferenceSnapshot> {
    let fx = sqlx::query("SELECT currency_id, rate FROM fx ORDER BY currency_id")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| (row.get("currency_id"), row.get("rate")))
        .collect();

    let bonds = sqlx::query("SELECT bond_id, currency_id, price FROM bond ORDER BY bond_id")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| BondRow {
            bond_id: row.get("bond_id"),
            currency_id: row.get("currency_id"),
            price: row.get("price"),
        })
        .collect();

    let desks = sqlx::query("SELECT desk_id, cash FROM desk ORDER BY desk_id")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| (row.get("desk_id"), row.get("cash")))
        .collect();

    let positions = sqlx::query(
        "SELECT t.desk_id, br.trader_id, br.book_id, br.bond_id, br.position
         FROM bond_record br
         JOIN trader t ON t.trader_id = br.trader_id
         ORDER BY t.desk_id, br.trader_id, br.book_id, br.bond_id",
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| PositionRow {
        desk: row.get("desk_id"),
        trader: row.get("trader_id"),
        book: row.get("book_id"),
        bond: row.get("bond_id"),
        position: row.get("position"),
    })
    .collect();

    Ok(ReferenceSnapshot {
        fx,
        bonds,
        desks,
        positions,
    })
}

// ============================================================================
// LIVE DASHBOARD QUERIES
// ============================================================================

#[derive(Debug, serde::Serialize)]
pub struct LiveDeskRow {
    pub desk: String,
    pub cash: Decimal,
}

pub async fn live_desks(pool: &PgPool) -> Result<Vec<LiveDeskRow>> {
    let rows = sqlx::query("SELECT desk_id, cash FROM desk ORDER BY desk_id")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| LiveDeskRow {
            desk: row.get("desk_id"),
            cash: row.get("cash"),
        })
        .collect())
}

#[derive(Debug, serde::Serialize)]
pub struct LivePositionRow {
    pub desk: String,
    pub trader: String,
    pub book: String,
    pub position: i64,
    pub value: Option<Decimal>,
}

pub async fn live_position_groups(pool: &PgPool) -> Result<Vec<LivePositionRow>> {
    let rows = sqlx::query(
        "SELECT t.desk_id, br.trader_id, br.book_id,
                CAST(SUM(br.position) AS BIGINT) AS position,
                SUM(br.position * b.price / f.rate) AS value
         FROM bond_record br
         JOIN trader t ON t.trader_id = br.trader_id
         JOIN bond b ON b.bond_id = br.bond_id
         JOIN fx f ON f.currency_id = b.currency_id
         GROUP BY t.desk_id, br.trader_id, br.book_id
         HAVING SUM(br.position) > 0
         ORDER BY t.desk_id, br.trader_id, br.book_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| LivePositionRow {
            desk: row.get("desk_id"),
            trader: row.get("trader_id"),
            book: row.get("book_id"),
            position: row.get("position"),
            value: row.get("value"),
        })
        .collect())
}

#[derive(Debug, serde::Serialize)]
pub struct LiveBondRow {
    pub desk: String,
    pub trader: String,
    pub book: String,
    pub bond: String,
    pub position: i64,
    pub value: Option<Decimal>,
}

pub async fn live_bond_positions(pool: &PgPool) -> Result<Vec<LiveBondRow>> {
    let rows = sqlx::query(
        "SELECT t.desk_id, br.trader_id, br.book_id, br.bond_id, br.position,
                br.position * b.price / f.rate AS value
         FROM bond_record br
         JOIN trader t ON t.trader_id = br.trader_id
         JOIN bond b ON b.bond_id = br.bond_id
         JOIN fx f ON f.currency_id = b.currency_id
         WHERE br.position > 0
         ORDER BY t.desk_id, br.trader_id, br.book_id, br.bond_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| LiveBondRow {
            desk: row.get("desk_id"),
            trader: row.get("trader_id"),
            book: row.get("book_id"),
            bond: row.get("bond_id"),
            position: row.get("position"),
            value: row.get("value"),
        })
        .collect())
}

#[derive(Debug, serde::Serialize)]
pub struct LiveCurrencyRow {
    pub desk: String,
    pub currency: String,
    pub position: i64,
    pub value: Option<Decimal>,
}

pub async fn live_currency_groups(pool: &PgPool) -> Result<Vec<LiveCurrencyRow>> {
    let rows = sqlx::query(
        "SELECT t.desk_id, b.currency_id,
                CAST(SUM(br.position) AS BIGINT) AS position,
                SUM(br.position * b.price / f.rate) AS value
         FROM bond_record br
         JOIN trader t ON t.trader_id = br.trader_id
         JOIN bond b ON b.bond_id = br.bond_id
         JOIN fx f ON f.currency_id = b.currency_id
         GROUP BY t.desk_id, b.currency_id
         HAVING SUM(br.position) > 0
         ORDER BY t.desk_id, b.currency_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| LiveCurrencyRow {
            desk: row.get("desk_id"),
            currency: row.get("currency_id"),
            position: row.get("position"),
            value: row.get("value"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_csv_rows_skips_header_and_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "currency_id,rate").unwrap();
        writeln!(file, "JPX,136.14").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "GBX, 0.8").unwrap();

        let rows = read_csv_rows(file.path()).unwrap();
        assert_eq!(
            rows,
            vec![
                vec!["JPX".to_string(), "136.14".to_string()],
                vec!["GBX".to_string(), "0.8".to_string()],
            ]
        );
    }

    #[test]
    fn read_csv_rows_reports_missing_file() {
        let err = read_csv_rows(Path::new("definitely/not/here.csv")).unwrap_err();
        assert!(err.to_string().contains("not/here.csv"));
    }
}
