//! Historical report engine.
//!
//! Reconstructs the portfolio as of a target event id by replaying (or
//! reversing) the trade log over a cached working set, then resynchronizing
//! FX rates and bond prices to their values at that point. Replay uses the
//! `value`/`quantity` stored in the log itself, so a report reproduces the
//! history as it was applied, not a counterfactual from later market data.

use crate::database::{self, ReferenceSnapshot, TradeLogRow};
use crate::valuation::format_money;
use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::debug;

/// The five report kinds and their CSV surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Cash,
    Position,
    Bond,
    Currency,
    Exclusion,
}

impl ReportKind {
    pub const ALL: [ReportKind; 5] = [
        ReportKind::Cash,
        ReportKind::Position,
        ReportKind::Bond,
        ReportKind::Currency,
        ReportKind::Exclusion,
    ];

    /// File stem used in download filenames and bulk output.
    pub fn file_stem(&self) -> &'static str {
        match self {
            ReportKind::Cash => "cash_level_portfolio",
            ReportKind::Position => "position_level_portfolio",
            ReportKind::Bond => "bond_level_portfolio",
            ReportKind::Currency => "currency_level_portfolio",
            ReportKind::Exclusion => "exclusions",
        }
    }

    fn header(&self) -> &'static str {
        match self {
            ReportKind::Cash => "Desk,Cash",
            ReportKind::Position => "Desk,Trader,Book,Position,Value",
            ReportKind::Bond => "Desk,Trader,Book,BondID,Position,Value",
            ReportKind::Currency => "Desk,Currency,Position,Value",
            ReportKind::Exclusion => {
                "EventID,Desk,Trader,Book,BuySell,Quantity,BondID,Price,ExclusionType"
            }
        }
    }
}

/// (desk, trader, book, bond) — BTreeMap keys give the lexicographic row
/// order every report is emitted in.
type PositionKey = (String, String, String, String);

#[derive(Debug, Clone)]
struct BondSnapshot {
    currency: String,
    price: Option<Decimal>,
}

/// In-memory snapshot of reference state pinned to a specific event id.
#[derive(Debug, Default)]
struct WorkingSet {
    fx: HashMap<String, Decimal>,
    bonds: HashMap<String, BondSnapshot>,
    desks: BTreeMap<String, Decimal>,
    positions: BTreeMap<PositionKey, i64>,
}

impl WorkingSet {
    fn from_snapshot(snapshot: ReferenceSnapshot) -> Self {
        let mut working = WorkingSet::default();
        for (currency, rate) in snapshot.fx {
            working.fx.insert(currency, rate);
        }
        for bond in snapshot.bonds {
            working.bonds.insert(
                bond.bond_id,
                BondSnapshot {
                    currency: bond.currency_id,
                    price: bond.price,
                },
            );
        }
        for (desk, cash) in snapshot.desks {
            working.desks.insert(desk, cash);
        }
        for row in snapshot.positions {
            working
                .positions
                .insert((row.desk, row.trader, row.book, row.bond), row.position);
        }
        working
    }

    /// Apply one logged trade in event order.
    fn apply_forward(&mut self, row: &TradeLogRow) {
        let key = (
            row.desk.clone(),
            row.trader.clone(),
            row.book.clone(),
            row.bond.clone(),
        );
        let cash = self.desks.entry(row.desk.clone()).or_insert(Decimal::ZERO);
        let position = self.positions.entry(key).or_insert(0);

        if row.buy_sell == "buy" {
            *cash -= row.value;
            *position += row.quantity;
        } else {
            *cash += row.value;
            *position -= row.quantity;
        }
    }

    /// Undo one logged trade while walking the log backwards.
    fn apply_reverse(&mut self, row: &TradeLogRow) {
        let key = (
            row.desk.clone(),
            row.trader.clone(),
            row.book.clone(),
            row.bond.clone(),
        );
        let cash = self.desks.entry(row.desk.clone()).or_insert(Decimal::ZERO);
        let position = self.positions.entry(key).or_insert(0);

        if row.buy_sell == "buy" {
            *cash += row.value;
            *position -= row.quantity;
        } else {
            *cash -= row.value;
            *position += row.quantity;
        }
    }

    /// Pin market data to the target id: rates and prices as of that point.
    fn resync(&mut self, fx: Vec<(String, Decimal)>, prices: Vec<(String, Option<Decimal>)>) {
        for (currency, rate) in fx {
            self.fx.insert(currency, rate);
        }
        for (bond_id, price) in prices {
            if let Some(bond) = self.bonds.get_mut(&bond_id) {
                bond.price = price;
            }
        }
    }

    /// Mark-to-market value of one triple; None while the bond has no price.
    fn value_of(&self, bond_id: &str, position: i64) -> Option<Decimal> {
        let bond = self.bonds.get(bond_id)?;
        let price = bond.price?;
        let rate = self.fx.get(&bond.currency)?;
        Some(Decimal::from(position) * price / rate)
    }

    fn currency_of(&self, bond_id: &str) -> Option<&str> {
        self.bonds.get(bond_id).map(|b| b.currency.as_str())
    }

    fn render_cash(&self) -> String {
        let mut csv = String::from(ReportKind::Cash.header());
        csv.push('\n');
        for (desk, cash) in &self.desks {
            let _ = writeln!(csv, "{},{}", desk, format_money(*cash));
        }
        csv
    }

    fn render_positions(&self) -> String {
        let mut groups: BTreeMap<(String, String, String), (i64, Decimal)> = BTreeMap::new();
        for ((desk, trader, book, bond), position) in &self.positions {
            let entry = groups
                .entry((desk.clone(), trader.clone(), book.clone()))
                .or_insert((0, Decimal::ZERO));
            entry.0 += position;
            if let Some(value) = self.value_of(bond, *position) {
                entry.1 += value;
            }
        }

        let mut csv = String::from(ReportKind::Position.header());
        csv.push('\n');
        for ((desk, trader, book), (position, value)) in groups {
            if position <= 0 {
                continue;
            }
            let _ = writeln!(
                csv,
                "{},{},{},{},{}",
                desk,
                trader,
                book,
                position,
                format_money(value)
            );
        }
        csv
    }

    fn render_bonds(&self) -> String {
        let mut csv = String::from(ReportKind::Bond.header());
        csv.push('\n');
        for ((desk, trader, book, bond), position) in &self.positions {
            if *position <= 0 {
                continue;
            }
            let value = self
                .value_of(bond, *position)
                .map(format_money)
                .unwrap_or_default();
            let _ = writeln!(csv, "{},{},{},{},{},{}", desk, trader, book, bond, position, value);
        }
        csv
    }

    fn render_currencies(&self) -> String {
        let mut groups: BTreeMap<(String, String), (i64, Decimal)> = BTreeMap::new();
        for ((desk, _trader, _book, bond), position) in &self.positions {
            let Some(currency) = self.currency_of(bond) else {
                continue;
            };
            let entry = groups
                .entry((desk.clone(), currency.to_string()))
                .or_insert((0, Decimal::ZERO));
            entry.0 += position;
            if let Some(value) = self.value_of(bond, *position) {
                entry.1 += value;
            }
        }

        let mut csv = String::from(ReportKind::Currency.header());
        csv.push('\n');
        for ((desk, currency), (position, value)) in groups {
            if position <= 0 {
                continue;
            }
            let _ = writeln!(
                csv,
                "{},{},{},{}",
                desk,
                currency,
                position,
                format_money(value)
            );
        }
        csv
    }
}

/// The report engine: one cached working set, moved between target ids.
///
/// Callers share it behind a mutex; a `generate` call is one uninterrupted
/// move-then-render, so nobody observes a half-moved cache.
pub struct ReportEngine {
    working: WorkingSet,
    state_id: i64,
}

impl Default for ReportEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportEngine {
    pub fn new() -> Self {
        Self {
            working: WorkingSet::default(),
            // Negative means uninitialized; the first call seeds the cache.
            state_id: -1,
        }
    }

    /// Produce one report as of `target_id`.
    pub async fn generate(
        &mut self,
        pool: &PgPool,
        target_id: i64,
        kind: ReportKind,
    ) -> Result<String> {
        if target_id < 0 {
            return Err(anyhow!("target_id must be non-negative, got {}", target_id));
        }

        if kind == ReportKind::Exclusion {
            // Exclusions never mutate state; they are a straight log filter.
            let rows = database::exclusions_up_to(pool, target_id).await?;
            let mut csv = String::from(ReportKind::Exclusion.header());
            csv.push('\n');
            for row in rows {
                let price = row.price.map(format_money).unwrap_or_default();
                let _ = writeln!(
                    csv,
                    "{},{},{},{},{},{},{},{},{}",
                    row.event_id,
                    row.desk,
                    row.trader,
                    row.book,
                    row.buy_sell,
                    row.quantity,
                    row.bond,
                    price,
                    row.exclusion_type
                );
            }
            return Ok(csv);
        }

        self.move_to(pool, target_id).await?;

        Ok(match kind {
            ReportKind::Cash => self.working.render_cash(),
            ReportKind::Position => self.working.render_positions(),
            ReportKind::Bond => self.working.render_bonds(),
            ReportKind::Currency => self.working.render_currencies(),
            ReportKind::Exclusion => unreachable!("handled above"),
        })
    }

    /// Write all five reports to `{output_dir}/output_{target_id}/` and
    /// return that directory.
    pub async fn write_reports(
        &mut self,
        pool: &PgPool,
        target_id: i64,
        output_dir: &str,
    ) -> Result<PathBuf> {
        let dir = PathBuf::from(output_dir).join(format!("output_{}", target_id));
        std::fs::create_dir_all(&dir)?;

        for kind in ReportKind::ALL {
            let csv = self.generate(pool, target_id, kind).await?;
            let path = dir.join(format!("{}_{}.csv", kind.file_stem(), target_id));
            std::fs::write(&path, csv)?;
        }

        Ok(dir)
    }

    /// Move the working set to `target_id`.
    ///
    /// Every call re-reads the release boundary first: if live events ran
    /// past a fresh cache, or the cached id is ahead of the logs (store was
    /// rebuilt underneath us), the cache resets to the current reference
    /// store before replaying.
    async fn move_to(&mut self, pool: &PgPool, target_id: i64) -> Result<()> {
        let last_released = database::last_event_id(pool).await?;

        if self.state_id < 0 || self.state_id > last_released {
            debug!(
                state_id = self.state_id,
                last_released, "resetting report cache from reference store"
            );
            self.working = WorkingSet::from_snapshot(database::reference_snapshot(pool).await?);
            self.state_id = last_released;
        }

        if self.state_id < target_id {
            let rows =
                database::trade_logs_between(pool, self.state_id, target_id, true).await?;
            for row in &rows {
                self.working.apply_forward(row);
            }
        } else if self.state_id > target_id {
            let rows =
                database::trade_logs_between(pool, target_id, self.state_id, false).await?;
            for row in &rows {
                self.working.apply_reverse(row);
            }
        }

        self.working.resync(
            database::fx_rates_as_of(pool, target_id).await?,
            database::bond_prices_as_of(pool, target_id).await?,
        );
        self.state_id = target_id;

        Ok(())
    }
}
