//! Topic namespace: allow-list validation and `all@ASSET` expansion.
//!
//! Clients name streams as `channel@ASSET`; upstream subjects are
//! `channel.ASSET` with a lower-case channel and an upper-case asset.

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use std::collections::HashSet;
use std::fmt;

/// Reserved channel whose assets bypass the asset allow-list.
pub const MARKETS_CHANNEL: &str = "markets";
/// Pseudo-channel expanding to every configured channel.
pub const ALL_CHANNEL: &str = "all";
/// The only assets accepted on the markets channel.
pub const MARKETS_ASSETS: [&str; 2] = ["DATA", "SNAPSHOT"];

/// A concrete upstream topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    channel: String,
    asset: String,
}

impl Topic {
    /// Build a topic, normalizing case.
    pub fn new(channel: &str, asset: &str) -> Self {
        Self {
            channel: channel.trim().to_lowercase(),
            asset: asset.trim().to_uppercase(),
        }
    }

    /// Upstream subject, `channel.ASSET`.
    pub fn subject(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.channel, self.asset)
    }
}

/// Allow-listed channels and assets.
#[derive(Debug, Clone)]
pub struct TopicNamespace {
    /// Lower-cased channels, in configured order.
    channels: Vec<String>,
    /// Upper-cased assets, minus ignored ones.
    assets: HashSet<String>,
}

impl TopicNamespace {
    pub fn new(channels: &[String], assets: &[String], ignored_assets: &[String]) -> Self {
        let mut seen = HashSet::new();
        let channels = channels
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .collect();

        let ignored: HashSet<String> = ignored_assets
            .iter()
            .map(|a| a.trim().to_uppercase())
            .collect();
        let assets = assets
            .iter()
            .map(|a| a.trim().to_uppercase())
            .filter(|a| !a.is_empty() && !ignored.contains(a))
            .collect();

        Self { channels, assets }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(&config.channels, &config.assets, &config.ignored_assets)
    }

    /// Configured channels, lower-cased.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Case-insensitive channel allow-list check.
    pub fn is_valid_channel(&self, channel: &str) -> bool {
        let channel = channel.to_lowercase();
        self.channels.iter().any(|c| *c == channel)
    }

    /// Case-insensitive asset allow-list check.
    pub fn is_valid_asset(&self, asset: &str) -> bool {
        self.assets.contains(&asset.to_uppercase())
    }

    /// Validate a comma separated `channel@ASSET` list and expand it into
    /// concrete topics. The whole list is rejected if any entry is invalid.
    pub fn expand(&self, topics: &str) -> Result<Vec<Topic>> {
        let mut seen = HashSet::new();
        let mut expanded = Vec::new();

        for entry in topics.split(',') {
            let entry = entry.trim();
            let parts: Vec<&str> = entry.split('@').collect();
            if parts.len() != 2 || parts.iter().any(|p| p.trim().is_empty()) {
                return Err(GatewayError::InvalidTopicFormat(entry.to_string()));
            }

            let channel = parts[0].trim().to_lowercase();
            let asset = parts[1].trim().to_uppercase();

            if channel == MARKETS_CHANNEL {
                if !MARKETS_ASSETS.contains(&asset.as_str()) {
                    return Err(GatewayError::InvalidMarketsTopic { channel, asset });
                }
                push_unique(&mut expanded, &mut seen, Topic::new(&channel, &asset));
            } else if channel == ALL_CHANNEL {
                if !self.is_valid_asset(&asset) {
                    return Err(GatewayError::InvalidTopic { channel, asset });
                }
                for configured in self.channels.iter().filter(|c| *c != MARKETS_CHANNEL) {
                    push_unique(&mut expanded, &mut seen, Topic::new(configured, &asset));
                }
            } else if self.is_valid_channel(&channel) && self.is_valid_asset(&asset) {
                push_unique(&mut expanded, &mut seen, Topic::new(&channel, &asset));
            } else {
                return Err(GatewayError::InvalidTopic { channel, asset });
            }
        }

        Ok(expanded)
    }
}

fn push_unique(out: &mut Vec<Topic>, seen: &mut HashSet<Topic>, topic: Topic) {
    if seen.insert(topic.clone()) {
        out.push(topic);
    }
}
