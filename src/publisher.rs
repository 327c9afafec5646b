//! Timer-driven event publisher.
//!
//! Reads the JSON event feed once, splits it into a market-data queue
//! (price and FX updates) and a trade queue, and POSTs the head of each
//! queue to the intake endpoint on its own interval. Market data flows
//! faster than trades, mirroring the shape of the feed. The server absorbs
//! duplicates, so a failed POST simply goes back on the queue.

use crate::config::PublisherConfig;
use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

type FormFields = HashMap<String, String>;

/// The event feed, split by event class with feed order preserved.
#[derive(Debug, Default)]
pub struct EventFeed {
    market_data: VecDeque<FormFields>,
    trade_events: VecDeque<FormFields>,
}

impl EventFeed {
    /// Load a feed file: a JSON array of event objects carrying `EventID`,
    /// `EventType` and the per-type payload fields.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event feed {}", path.display()))?;
        let events: Vec<serde_json::Map<String, Value>> =
            serde_json::from_str(&contents).context("Event feed is not a JSON array of objects")?;

        let mut feed = EventFeed::default();
        for event in &events {
            let fields = form_fields(event);
            match event.get("EventType").and_then(Value::as_str) {
                Some("PriceEvent") | Some("FXEvent") => feed.market_data.push_back(fields),
                Some("TradeEvent") => feed.trade_events.push_back(fields),
                other => {
                    warn!(event_type = ?other, "skipping feed entry with unknown event type");
                }
            }
        }

        info!(
            market_data = feed.market_data.len(),
            trade_events = feed.trade_events.len(),
            "loaded event feed"
        );
        Ok(feed)
    }

    pub fn next_market_data(&mut self) -> Option<FormFields> {
        self.market_data.pop_front()
    }

    pub fn next_trade_event(&mut self) -> Option<FormFields> {
        self.trade_events.pop_front()
    }

    pub fn requeue_market_data(&mut self, fields: FormFields) {
        self.market_data.push_front(fields);
    }

    pub fn requeue_trade_event(&mut self, fields: FormFields) {
        self.trade_events.push_front(fields);
    }

    pub fn is_empty(&self) -> bool {
        self.market_data.is_empty() && self.trade_events.is_empty()
    }
}

/// Flatten a feed object into the form body the intake endpoint expects.
fn form_fields(event: &serde_json::Map<String, Value>) -> FormFields {
    event
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

async fn post_event(client: &Client, server_url: &str, fields: &FormFields) -> Result<()> {
    let response = client
        .post(format!("{}/api/events/", server_url))
        .form(fields)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        warn!(
            status = %status,
            event_id = fields.get("EventID").map(String::as_str).unwrap_or("?"),
            "intake rejected event"
        );
    }
    Ok(())
}

/// Run the publisher until the feed is drained.
pub async fn run(config: &PublisherConfig, data_dir: &str) -> Result<()> {
    let feed_path = Path::new(data_dir).join(&config.feed_file);
    let feed = Arc::new(Mutex::new(EventFeed::load(&feed_path)?));
    let client = Client::new();

    let mut scheduler = JobScheduler::new().await?;

    let market_feed = feed.clone();
    let market_client = client.clone();
    let market_url = config.server_url.clone();
    let market_job = Job::new_repeated_async(
        Duration::from_secs(config.market_data_interval_secs),
        move |_id, _scheduler| {
            let feed = market_feed.clone();
            let client = market_client.clone();
            let server_url = market_url.clone();
            Box::pin(async move {
                let next = feed.lock().await.next_market_data();
                if let Some(fields) = next {
                    info!(
                        event_id = fields.get("EventID").map(String::as_str).unwrap_or("?"),
                        "publishing market data"
                    );
                    if let Err(e) = post_event(&client, &server_url, &fields).await {
                        warn!(error = %e, "market data POST failed, requeueing");
                        feed.lock().await.requeue_market_data(fields);
                    }
                }
            })
        },
    )?;
    scheduler.add(market_job).await?;

    let trade_feed = feed.clone();
    let trade_client = client.clone();
    let trade_url = config.server_url.clone();
    let trade_job = Job::new_repeated_async(
        Duration::from_secs(config.trade_event_interval_secs),
        move |_id, _scheduler| {
            let feed = trade_feed.clone();
            let client = trade_client.clone();
            let server_url = trade_url.clone();
            Box::pin(async move {
                let next = feed.lock().await.next_trade_event();
                if let Some(fields) = next {
                    info!(
                        event_id = fields.get("EventID").map(String::as_str).unwrap_or("?"),
                        "publishing trade event"
                    );
                    if let Err(e) = post_event(&client, &server_url, &fields).await {
                        warn!(error = %e, "trade event POST failed, requeueing");
                        feed.lock().await.requeue_trade_event(fields);
                    }
                }
            })
        },
    )?;
    scheduler.add(trade_job).await?;

    scheduler.start().await?;

    // Stop once both queues drain; the intake side needs no teardown.
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if feed.lock().await.is_empty() {
            break;
        }
    }
    scheduler.shutdown().await?;
    info!("event feed drained, publisher stopping");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FEED: &str = r#"[
        {"EventID": 1, "EventType": "PriceEvent", "BondID": "B34678", "MarketPrice": 10000},
        {"EventID": 2, "EventType": "TradeEvent", "Desk": "NY", "Trader": "T6899554",
         "Book": "NY00", "BuySell": "buy", "Quantity": 533, "BondID": "B34678"},
        {"EventID": 5, "EventType": "FXEvent", "ccy": "JPX", "rate": 136.14}
    ]"#;

    fn feed_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn splits_feed_by_event_class_preserving_order() {
        let file = feed_file(FEED);
        let mut feed = EventFeed::load(file.path()).unwrap();

        let first = feed.next_market_data().unwrap();
        assert_eq!(first["EventType"], "PriceEvent");
        assert_eq!(first["EventID"], "1");
        assert_eq!(first["MarketPrice"], "10000");

        let second = feed.next_market_data().unwrap();
        assert_eq!(second["EventType"], "FXEvent");
        assert_eq!(second["rate"], "136.14");
        assert!(feed.next_market_data().is_none());

        let trade = feed.next_trade_event().unwrap();
        assert_eq!(trade["BuySell"], "buy");
        assert_eq!(trade["Quantity"], "533");
        assert!(feed.is_empty());
    }

    #[test]
    fn requeue_puts_the_event_back_at_the_front() {
        let file = feed_file(FEED);
        let mut feed = EventFeed::load(file.path()).unwrap();

        let first = feed.next_market_data().unwrap();
        feed.requeue_market_data(first.clone());
        assert_eq!(feed.next_market_data().unwrap(), first);
    }

    #[test]
    fn load_rejects_non_array_feed() {
        let file = feed_file(r#"{"EventID": 1}"#);
        assert!(EventFeed::load(file.path()).is_err());
    }
}
