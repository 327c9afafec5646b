//! Event types shared by the intake endpoint, the sequencer and the processor.
//!
//! Monetary fields are decoded from their string form directly into
//! `Decimal`; they never pass through binary floating point.

use anyhow::{anyhow, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Trade direction. Stored and rendered as the long form everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Parse from string (API boundary conversion)
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            _ => Err(anyhow!("Invalid buy/sell: '{}', expected 'buy' or 'sell'", s)),
        }
    }

    /// Lowercase string slice for database storage and CSV output
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FxEvent {
    pub event_id: i64,
    pub ccy: String,
    pub rate: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceEvent {
    pub event_id: i64,
    pub bond_id: String,
    pub market_price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    pub event_id: i64,
    pub desk: String,
    pub trader: String,
    pub book: String,
    pub side: Side,
    pub quantity: i64,
    pub bond_id: String,
}

/// Tagged event variant held by the sequencer's ordering buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Fx(FxEvent),
    Price(PriceEvent),
    Trade(TradeEvent),
}

impl Event {
    pub fn event_id(&self) -> i64 {
        match self {
            Event::Fx(e) => e.event_id,
            Event::Price(e) => e.event_id,
            Event::Trade(e) => e.event_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Fx(_) => "FXEvent",
            Event::Price(_) => "PriceEvent",
            Event::Trade(_) => "TradeEvent",
        }
    }

    /// Decode an event from the form-encoded intake body.
    ///
    /// Shape errors (missing keys, unparseable numbers, unknown event type)
    /// surface to the caller as a 400; they are not business exclusions.
    pub fn from_form(fields: &HashMap<String, String>) -> Result<Event> {
        let event_id = parse_field::<i64>(fields, "EventID")?;
        if event_id <= 0 {
            return Err(anyhow!("EventID must be a positive integer, got {}", event_id));
        }

        let event_type = required(fields, "EventType")?;
        match event_type {
            "FXEvent" => {
                let rate = parse_field::<Decimal>(fields, "rate")?;
                if rate <= Decimal::ZERO {
                    return Err(anyhow!("FX rate must be positive, got {}", rate));
                }
                Ok(Event::Fx(FxEvent {
                    event_id,
                    ccy: required(fields, "ccy")?.to_string(),
                    rate,
                }))
            }
            "PriceEvent" => Ok(Event::Price(PriceEvent {
                event_id,
                bond_id: required(fields, "BondID")?.to_string(),
                market_price: parse_field::<Decimal>(fields, "MarketPrice")?,
            })),
            "TradeEvent" => {
                let quantity = parse_field::<i64>(fields, "Quantity")?;
                if quantity <= 0 {
                    return Err(anyhow!("Quantity must be positive, got {}", quantity));
                }
                Ok(Event::Trade(TradeEvent {
                    event_id,
                    desk: required(fields, "Desk")?.to_string(),
                    trader: required(fields, "Trader")?.to_string(),
                    book: required(fields, "Book")?.to_string(),
                    side: Side::parse(required(fields, "BuySell")?)?,
                    quantity,
                    bond_id: required(fields, "BondID")?.to_string(),
                }))
            }
            other => Err(anyhow!("Unknown event type: {}", other)),
        }
    }
}

fn required<'a>(fields: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    fields
        .get(key)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("Missing field: {}", key))
}

fn parse_field<T: FromStr>(fields: &HashMap<String, String>, key: &str) -> Result<T> {
    let raw = required(fields, key)?;
    raw.parse::<T>()
        .map_err(|_| anyhow!("Field {} has invalid value: '{}'", key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn decodes_fx_event() {
        let event = Event::from_form(&form(&[
            ("EventID", "5"),
            ("EventType", "FXEvent"),
            ("ccy", "JPX"),
            ("rate", "135"),
        ]))
        .unwrap();
        assert_eq!(
            event,
            Event::Fx(FxEvent {
                event_id: 5,
                ccy: "JPX".to_string(),
                rate: Decimal::from(135),
            })
        );
    }

    #[test]
    fn decodes_price_event_with_exact_decimal() {
        let event = Event::from_form(&form(&[
            ("EventID", "1"),
            ("EventType", "PriceEvent"),
            ("BondID", "B34678"),
            ("MarketPrice", "10090.5"),
        ]))
        .unwrap();
        match event {
            Event::Price(e) => {
                assert_eq!(e.market_price, Decimal::from_str("10090.5").unwrap());
                assert_eq!(e.market_price.scale(), 1);
            }
            other => panic!("expected price event, got {:?}", other),
        }
    }

    #[test]
    fn decodes_trade_event() {
        let event = Event::from_form(&form(&[
            ("EventID", "2"),
            ("EventType", "TradeEvent"),
            ("Desk", "NY"),
            ("Trader", "T6899554"),
            ("Book", "NY00"),
            ("BuySell", "buy"),
            ("Quantity", "533"),
            ("BondID", "B34678"),
        ]))
        .unwrap();
        assert_eq!(event.event_id(), 2);
        assert_eq!(event.event_type(), "TradeEvent");
        match event {
            Event::Trade(e) => {
                assert_eq!(e.side, Side::Buy);
                assert_eq!(e.quantity, 533);
            }
            other => panic!("expected trade event, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_event_type() {
        let err = Event::from_form(&form(&[("EventID", "1"), ("EventType", "DividendEvent")]))
            .unwrap_err();
        assert!(err.to_string().contains("Unknown event type"));
    }

    #[test]
    fn rejects_missing_and_malformed_fields() {
        assert!(Event::from_form(&form(&[("EventType", "FXEvent")])).is_err());
        assert!(Event::from_form(&form(&[
            ("EventID", "zero"),
            ("EventType", "FXEvent"),
            ("ccy", "JPX"),
            ("rate", "135"),
        ]))
        .is_err());
        assert!(Event::from_form(&form(&[
            ("EventID", "1"),
            ("EventType", "TradeEvent"),
            ("Desk", "NY"),
            ("Trader", "T1"),
            ("Book", "NY00"),
            ("BuySell", "short"),
            ("Quantity", "10"),
            ("BondID", "B00001"),
        ]))
        .is_err());
    }

    #[test]
    fn rejects_non_positive_quantity_and_rate() {
        assert!(Event::from_form(&form(&[
            ("EventID", "1"),
            ("EventType", "FXEvent"),
            ("ccy", "JPX"),
            ("rate", "0"),
        ]))
        .is_err());
        assert!(Event::from_form(&form(&[
            ("EventID", "1"),
            ("EventType", "TradeEvent"),
            ("Desk", "NY"),
            ("Trader", "T1"),
            ("Book", "NY00"),
            ("BuySell", "sell"),
            ("Quantity", "-5"),
            ("BondID", "B00001"),
        ]))
        .is_err());
    }
}
