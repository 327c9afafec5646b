//! Database adapter layer for the per-event transactions
//! Keeps every reference mutation and log append behind one narrow surface

use crate::events::Side;
use crate::valuation::round5;
use anyhow::Result;
use rust_decimal::Decimal;
use sqlx::Row;

/// Fatal reference-data inconsistency (unknown currency/bond/desk, trader or
/// book sighted under a different owner). Surfaces upstream as a 400; never
/// logged as a business exclusion.
#[derive(Debug)]
pub struct DataError(pub String);

impl std::fmt::Display for DataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "data error: {}", self.0)
    }
}

impl std::error::Error for DataError {}

pub fn data_error(message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(DataError(message.into()))
}

/// Bond reference state read inside a trade/price transaction.
#[derive(Debug)]
pub struct BondState {
    pub currency_id: String,
    pub price: Option<Decimal>,
}

/// Transactional write helpers used by the event processor.
pub struct DbAdapter;

impl DbAdapter {
    /// Update the live FX rate. Returns false when the currency is unknown.
    pub async fn update_fx_rate(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        currency_id: &str,
        rate: Decimal,
    ) -> Result<bool> {
        let rows_affected = sqlx::query("UPDATE fx SET rate = $1 WHERE currency_id = $2")
            .bind(round5(rate))
            .bind(currency_id)
            .execute(&mut **tx)
            .await?
            .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Update the live bond price; the first price also becomes the
    /// immutable `initial_price`. Returns false when the bond is unknown.
    pub async fn update_bond_price(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        bond_id: &str,
        price: Decimal,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            "UPDATE bond SET
                price = $1,
                initial_price = COALESCE(initial_price, $1)
             WHERE bond_id = $2",
        )
        .bind(round5(price))
        .bind(bond_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        Ok(rows_affected > 0)
    }

    /// Read a bond's currency and current price, locking the row for the
    /// rest of the transaction.
    pub async fn get_bond(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        bond_id: &str,
    ) -> Result<Option<BondState>> {
        let row = sqlx::query("SELECT currency_id, price FROM bond WHERE bond_id = $1 FOR UPDATE")
            .bind(bond_id)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row.map(|row| BondState {
            currency_id: row.get("currency_id"),
            price: row.get("price"),
        }))
    }

    pub async fn get_fx_rate(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        currency_id: &str,
    ) -> Result<Option<Decimal>> {
        let row = sqlx::query("SELECT rate FROM fx WHERE currency_id = $1")
            .bind(currency_id)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row.map(|row| row.get("rate")))
    }

    /// Read desk cash, locking the desk row for the rest of the transaction.
    pub async fn get_desk_cash(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        desk_id: &str,
    ) -> Result<Option<Decimal>> {
        let row = sqlx::query("SELECT cash FROM desk WHERE desk_id = $1 FOR UPDATE")
            .bind(desk_id)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row.map(|row| row.get("cash")))
    }

    pub async fn update_desk_cash(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        desk_id: &str,
        cash: Decimal,
    ) -> Result<()> {
        sqlx::query("UPDATE desk SET cash = $1 WHERE desk_id = $2")
            .bind(round5(cash))
            .bind(desk_id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    /// Get-or-create the trader under its desk. A trader sighted under a
    /// different desk is a data error.
    pub async fn find_or_create_trader(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        trader_id: &str,
        desk_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO trader (trader_id, desk_id) VALUES ($1, $2)
             ON CONFLICT (trader_id) DO NOTHING",
        )
        .bind(trader_id)
        .bind(desk_id)
        .execute(&mut **tx)
        .await?;

        let owner: String = sqlx::query("SELECT desk_id FROM trader WHERE trader_id = $1")
            .bind(trader_id)
            .fetch_one(&mut **tx)
            .await?
            .get("desk_id");

        if owner != desk_id {
            return Err(data_error(format!(
                "trader {} belongs to desk {}, not {}",
                trader_id, owner, desk_id
            )));
        }

        Ok(())
    }

    /// Get-or-create the book under its trader; same ownership discipline.
    pub async fn find_or_create_book(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        book_id: &str,
        trader_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO book (book_id, trader_id) VALUES ($1, $2)
             ON CONFLICT (book_id) DO NOTHING",
        )
        .bind(book_id)
        .bind(trader_id)
        .execute(&mut **tx)
        .await?;

        let owner: String = sqlx::query("SELECT trader_id FROM book WHERE book_id = $1")
            .bind(book_id)
            .fetch_one(&mut **tx)
            .await?
            .get("trader_id");

        if owner != trader_id {
            return Err(data_error(format!(
                "book {} belongs to trader {}, not {}",
                book_id, owner, trader_id
            )));
        }

        Ok(())
    }

    /// Current position for the (trader, book, bond) triple, locked.
    pub async fn get_position(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        trader_id: &str,
        book_id: &str,
        bond_id: &str,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT position FROM bond_record
             WHERE trader_id = $1 AND book_id = $2 AND bond_id = $3
             FOR UPDATE",
        )
        .bind(trader_id)
        .bind(book_id)
        .bind(bond_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|row| row.get("position")))
    }

    /// Apply a position delta, creating the record at 0 first for a fresh
    /// buy. Returns the resulting position; the `position >= 0` CHECK is the
    /// final guard behind the sell validator.
    pub async fn adjust_position(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        trader_id: &str,
        book_id: &str,
        bond_id: &str,
        delta: i64,
    ) -> Result<i64> {
        sqlx::query(
            "INSERT INTO bond_record (trader_id, book_id, bond_id, position)
             VALUES ($1, $2, $3, 0)
             ON CONFLICT (trader_id, book_id, bond_id) DO NOTHING",
        )
        .bind(trader_id)
        .bind(book_id)
        .bind(bond_id)
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query(
            "UPDATE bond_record SET position = position + $4
             WHERE trader_id = $1 AND book_id = $2 AND bond_id = $3
             RETURNING position",
        )
        .bind(trader_id)
        .bind(book_id)
        .bind(bond_id)
        .bind(delta)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.get("position"))
    }

    // ------------------------------------------------------------------
    // Log appends. All monetary columns cross the 5 dp rounding boundary
    // exactly once, here.
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_event_log(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event_id: i64,
        desk_id: &str,
        trader_id: &str,
        book_id: &str,
        side: Side,
        quantity: i64,
        bond_id: &str,
        position: i64,
        price: Decimal,
        fx_rate: Decimal,
        value: Decimal,
        cash: Decimal,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO event_log
             (event_id, desk_id, trader_id, book_id, buy_sell, quantity, bond_id,
              position, price, fx_rate, value, cash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(event_id)
        .bind(desk_id)
        .bind(trader_id)
        .bind(book_id)
        .bind(side.as_str())
        .bind(quantity)
        .bind(bond_id)
        .bind(position)
        .bind(round5(price))
        .bind(round5(fx_rate))
        .bind(round5(value))
        .bind(round5(cash))
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn insert_fx_event_log(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event_id: i64,
        currency_id: &str,
        rate: Decimal,
    ) -> Result<()> {
        sqlx::query("INSERT INTO fx_event_log (event_id, currency_id, rate) VALUES ($1, $2, $3)")
            .bind(event_id)
            .bind(currency_id)
            .bind(round5(rate))
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    pub async fn insert_price_event_log(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event_id: i64,
        bond_id: &str,
        price: Decimal,
    ) -> Result<()> {
        sqlx::query("INSERT INTO price_event_log (event_id, bond_id, price) VALUES ($1, $2, $3)")
            .bind(event_id)
            .bind(bond_id)
            .bind(round5(price))
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_exception_log(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        event_id: i64,
        desk_id: &str,
        trader_id: &str,
        book_id: &str,
        side: Side,
        quantity: i64,
        bond_id: &str,
        price: Option<Decimal>,
        exclusion_type: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO event_exception_log
             (event_id, desk_id, trader_id, book_id, buy_sell, quantity, bond_id,
              price, exclusion_type)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(event_id)
        .bind(desk_id)
        .bind(trader_id)
        .bind(book_id)
        .bind(side.as_str())
        .bind(quantity)
        .bind(bond_id)
        .bind(price.map(round5))
        .bind(exclusion_type)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}
