//! The event processor: one released event, one store transaction.
//!
//! Reference mutations and the log append for an event commit together or
//! not at all. Business exclusions (no market price, cash overlimit,
//! quantity overlimit) are recorded in the exception log inside the same
//! transaction and are not errors to the caller; only reference-data
//! inconsistencies abort the event.

use crate::db_adapter::{data_error, BondState, DbAdapter};
use crate::events::{Event, FxEvent, PriceEvent, Side, TradeEvent};
use crate::valuation::trade_value;
use anyhow::Result;
use rand::Rng;
use rust_decimal::Decimal;
use sqlx::{Error as SqlxError, Executor, PgPool};
use std::time::Duration as StdDuration;
use tokio::time::sleep;
use tracing::debug;

// Configuration constants for concurrency control
const MAX_RETRY_ATTEMPTS: u32 = 5;
const BASE_RETRY_DELAY_MS: u64 = 10;

/// PostgreSQL SQLSTATE codes for retryable errors
/// Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
mod pg_error_codes {
    // Class 40 — Transaction Rollback
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
}

/// Determines if a database error is retryable based on PostgreSQL SQLSTATE codes
fn is_retryable_error(error: &anyhow::Error) -> bool {
    let mut current_error: &dyn std::error::Error = error.as_ref();

    loop {
        if let Some(sqlx_error) = current_error.downcast_ref::<SqlxError>() {
            return match sqlx_error {
                SqlxError::Database(db_error) => {
                    if let Some(sqlstate) = db_error.code() {
                        let sqlstate_str = sqlstate.as_ref();
                        let is_retryable = matches!(
                            sqlstate_str,
                            pg_error_codes::SERIALIZATION_FAILURE
                                | pg_error_codes::DEADLOCK_DETECTED
                        );

                        if is_retryable {
                            debug!(
                                sqlstate = sqlstate_str,
                                message = db_error.message(),
                                "detected retryable database error"
                            );
                        }

                        is_retryable
                    } else {
                        false
                    }
                }
                _ => false,
            };
        }

        match current_error.source() {
            Some(source) => current_error = source,
            None => break,
        }
    }

    false
}

/// Macro for executing transactions with READ COMMITTED isolation and retry logic
macro_rules! with_event_tx {
    ($pool:expr, $tx_var:ident, $body:block) => {{
        let mut attempt = 1;
        loop {
            let mut $tx_var = $pool.begin().await?;

            $tx_var
                .execute(sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"))
                .await?;

            let result: Result<_> = async { $body }.await;

            match result {
                Ok(value) => {
                    $tx_var.commit().await?;
                    break Ok(value);
                }
                Err(e) => {
                    $tx_var.rollback().await.ok();

                    if is_retryable_error(&e) && attempt < MAX_RETRY_ATTEMPTS {
                        let jitter = rand::thread_rng().gen_range(0..5);
                        let delay_ms = BASE_RETRY_DELAY_MS * attempt as u64 + jitter;
                        sleep(StdDuration::from_millis(delay_ms)).await;
                        attempt += 1;
                        continue;
                    } else {
                        break Err(e);
                    }
                }
            }
        }
    }};
}

/// Exclusion taxonomy for rejected trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    NoMarketPrice,
    CashOverlimit,
    QuantityOverlimit,
}

impl Exclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exclusion::NoMarketPrice => "NO_MARKET_PRICE",
            Exclusion::CashOverlimit => "CASH_OVERLIMIT",
            Exclusion::QuantityOverlimit => "QUANTITY_OVERLIMIT",
        }
    }
}

/// What a committed event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    MarketData,
    TradeApplied,
    TradeExcluded(Exclusion),
}

pub struct EventProcessor {
    pool: PgPool,
}

impl EventProcessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply one released event inside its own transaction.
    ///
    /// On error the transaction is rolled back, no log row exists, and the
    /// release boundary derived from the logs has not advanced.
    pub async fn process(&self, event: &Event) -> Result<Outcome> {
        let outcome = with_event_tx!(self.pool, tx, {
            match event {
                Event::Fx(e) => apply_fx(&mut tx, e).await,
                Event::Price(e) => apply_price(&mut tx, e).await,
                Event::Trade(e) => apply_trade(&mut tx, e).await,
            }
        })?;

        match outcome {
            Outcome::TradeExcluded(exclusion) => debug!(
                event_id = event.event_id(),
                exclusion = exclusion.as_str(),
                "trade excluded"
            ),
            _ => debug!(
                event_id = event.event_id(),
                event_type = event.event_type(),
                "event applied"
            ),
        }

        Ok(outcome)
    }
}

async fn apply_fx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &FxEvent,
) -> Result<Outcome> {
    let updated = DbAdapter::update_fx_rate(tx, &event.ccy, event.rate).await?;
    if !updated {
        return Err(data_error(format!("unknown currency {}", event.ccy)));
    }

    DbAdapter::insert_fx_event_log(tx, event.event_id, &event.ccy, event.rate).await?;
    Ok(Outcome::MarketData)
}

async fn apply_price(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &PriceEvent,
) -> Result<Outcome> {
    let updated = DbAdapter::update_bond_price(tx, &event.bond_id, event.market_price).await?;
    if !updated {
        return Err(data_error(format!("unknown bond {}", event.bond_id)));
    }

    DbAdapter::insert_price_event_log(tx, event.event_id, &event.bond_id, event.market_price)
        .await?;
    Ok(Outcome::MarketData)
}

async fn apply_trade(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &TradeEvent,
) -> Result<Outcome> {
    let bond = DbAdapter::get_bond(tx, &event.bond_id)
        .await?
        .ok_or_else(|| data_error(format!("unknown bond {}", event.bond_id)))?;

    let rate = DbAdapter::get_fx_rate(tx, &bond.currency_id)
        .await?
        .ok_or_else(|| data_error(format!("unknown currency {}", bond.currency_id)))?;

    let cash = DbAdapter::get_desk_cash(tx, &event.desk)
        .await?
        .ok_or_else(|| data_error(format!("unknown desk {}", event.desk)))?;

    // Trader and book come into existence on first sighting, before
    // validation, so exclusions carry full context too.
    DbAdapter::find_or_create_trader(tx, &event.trader, &event.desk).await?;
    DbAdapter::find_or_create_book(tx, &event.book, &event.trader).await?;

    match event.side {
        Side::Buy => apply_buy(tx, event, &bond, rate, cash).await,
        Side::Sell => apply_sell(tx, event, &bond, rate, cash).await,
    }
}

async fn apply_buy(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &TradeEvent,
    bond: &BondState,
    rate: Decimal,
    cash: Decimal,
) -> Result<Outcome> {
    let Some(price) = bond.price else {
        return log_exclusion(tx, event, None, Exclusion::NoMarketPrice).await;
    };

    let value = trade_value(event.quantity, price, rate);
    if cash < value {
        return log_exclusion(tx, event, Some(price), Exclusion::CashOverlimit).await;
    }

    let new_cash = cash - value;
    DbAdapter::update_desk_cash(tx, &event.desk, new_cash).await?;
    let position =
        DbAdapter::adjust_position(tx, &event.trader, &event.book, &event.bond_id, event.quantity)
            .await?;

    DbAdapter::insert_event_log(
        tx,
        event.event_id,
        &event.desk,
        &event.trader,
        &event.book,
        event.side,
        event.quantity,
        &event.bond_id,
        position,
        price,
        rate,
        value,
        new_cash,
    )
    .await?;

    Ok(Outcome::TradeApplied)
}

async fn apply_sell(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &TradeEvent,
    bond: &BondState,
    rate: Decimal,
    cash: Decimal,
) -> Result<Outcome> {
    let position =
        DbAdapter::get_position(tx, &event.trader, &event.book, &event.bond_id).await?;

    let Some(position) = position else {
        return log_exclusion(tx, event, bond.price, Exclusion::QuantityOverlimit).await;
    };
    if position < event.quantity {
        return log_exclusion(tx, event, bond.price, Exclusion::QuantityOverlimit).await;
    }

    // A held position implies a past buy, which implies a price; the guard
    // keeps a corrupted history from panicking the writer.
    let Some(price) = bond.price else {
        return log_exclusion(tx, event, None, Exclusion::NoMarketPrice).await;
    };

    let value = trade_value(event.quantity, price, rate);
    let new_cash = cash + value;
    DbAdapter::update_desk_cash(tx, &event.desk, new_cash).await?;
    let new_position = DbAdapter::adjust_position(
        tx,
        &event.trader,
        &event.book,
        &event.bond_id,
        -event.quantity,
    )
    .await?;

    DbAdapter::insert_event_log(
        tx,
        event.event_id,
        &event.desk,
        &event.trader,
        &event.book,
        event.side,
        event.quantity,
        &event.bond_id,
        new_position,
        price,
        rate,
        value,
        new_cash,
    )
    .await?;

    Ok(Outcome::TradeApplied)
}

async fn log_exclusion(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &TradeEvent,
    price: Option<Decimal>,
    exclusion: Exclusion,
) -> Result<Outcome> {
    DbAdapter::insert_exception_log(
        tx,
        event.event_id,
        &event.desk,
        &event.trader,
        &event.book,
        event.side,
        event.quantity,
        &event.bond_id,
        price,
        exclusion.as_str(),
    )
    .await?;

    Ok(Outcome::TradeExcluded(exclusion))
}
