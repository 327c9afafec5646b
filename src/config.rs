//! Configuration management for the portfolio engine
//! Supports environment variables and default values for server, data and publisher settings

use serde::{Deserialize, Serialize};
use std::env;

/// Configuration for the portfolio engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub data: DataConfig,
    pub publisher: PublisherConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the intake/report API listens on (default: 8000)
    pub port: u16,
}

/// Filesystem locations for seed data and report output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the seed CSVs and the event feed (default: "data")
    pub data_dir: String,

    /// Directory bulk report output is written under (default: "out")
    pub output_dir: String,
}

/// Event publisher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Base URL of the intake server (default: "http://localhost:8000")
    pub server_url: String,

    /// Seconds between market data publications (default: 2)
    pub market_data_interval_secs: u64,

    /// Seconds between trade event publications (default: 5)
    pub trade_event_interval_secs: u64,

    /// Feed file name inside `data_dir` (default: "events.json")
    pub feed_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            output_dir: "out".to_string(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8000".to_string(),
            market_data_interval_secs: 2,
            trade_event_interval_secs: 5,
            feed_file: "events.json".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            data: DataConfig::default(),
            publisher: PublisherConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(port) = env::var("ENGINE_PORT") {
            config.server.port = port.parse().unwrap_or(config.server.port);
        }

        if let Ok(data_dir) = env::var("ENGINE_DATA_DIR") {
            config.data.data_dir = data_dir;
        }

        if let Ok(output_dir) = env::var("ENGINE_OUTPUT_DIR") {
            config.data.output_dir = output_dir;
        }

        if let Ok(server_url) = env::var("PUBLISHER_SERVER_URL") {
            config.publisher.server_url = server_url;
        }

        if let Ok(interval) = env::var("PUBLISHER_MARKET_DATA_INTERVAL_SECS") {
            config.publisher.market_data_interval_secs = interval
                .parse()
                .unwrap_or(config.publisher.market_data_interval_secs);
        }

        if let Ok(interval) = env::var("PUBLISHER_TRADE_EVENT_INTERVAL_SECS") {
            config.publisher.trade_event_interval_secs = interval
                .parse()
                .unwrap_or(config.publisher.trade_event_interval_secs);
        }

        if let Ok(feed_file) = env::var("PUBLISHER_FEED_FILE") {
            config.publisher.feed_file = feed_file;
        }

        config.validate();

        config
    }

    /// Validate configuration values
    fn validate(&mut self) {
        if self.publisher.market_data_interval_secs == 0 {
            eprintln!("Invalid market data interval: 0, using default");
            self.publisher.market_data_interval_secs = 2;
        }

        if self.publisher.trade_event_interval_secs == 0 {
            eprintln!("Invalid trade event interval: 0, using default");
            self.publisher.trade_event_interval_secs = 5;
        }

        while self.publisher.server_url.ends_with('/') {
            self.publisher.server_url.pop();
        }
    }

    /// Print current configuration for debugging
    pub fn print_config(&self) {
        println!("🔧 Portfolio Engine Configuration:");
        println!("   Server Port: {}", self.server.port);
        println!("   Data Dir: {}", self.data.data_dir);
        println!("   Output Dir: {}", self.data.output_dir);
        println!("   Publisher Target: {}", self.publisher.server_url);
        println!(
            "   Publish Intervals: market={}s trade={}s",
            self.publisher.market_data_interval_secs, self.publisher.trade_event_interval_secs
        );
    }
}
