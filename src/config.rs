//! Configuration
//!
//! `StripenetConfig` is read from YAML. Every field has a default, so an
//! empty document is a valid configuration.
//!
//! ```yaml
//! layout:
//!   stripe_size: 1048576
//!   stripe_count: 4
//! wire:
//!   format: self-describing
//!   reply_pool_size: 8
//!   pool_wait: 10s
//! recovery:
//!   obd_timeout: 100s
//!   policy: connect
//! locking:
//!   disabled: false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::recovery::{ImportConfig, RecoveryPolicy};
use crate::stripe::{StripeLayout, TargetIndex, PAGE_SIZE};
use crate::wire::{MsgFormat, ReplyPoolConfig};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StripenetConfig {
    pub layout: LayoutConfig,
    pub wire: WireConfig,
    pub recovery: RecoveryConfig,
    pub locking: LockingConfig,
}

/// Default striping of new objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Bytes per stripe unit; a multiple of the page size
    pub stripe_size: u64,
    pub stripe_count: u32,
    /// Stripe slots covered by the emergency reserve
    pub reserve_slots: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            stripe_size: 1024 * 1024,
            stripe_count: 1,
            reserve_slots: 16,
        }
    }
}

/// Envelope format names as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    #[default]
    SelfDescribing,
    Legacy,
}

impl From<WireFormat> for MsgFormat {
    fn from(format: WireFormat) -> Self {
        match format {
            WireFormat::SelfDescribing => MsgFormat::SelfDescribing,
            WireFormat::Legacy => MsgFormat::Legacy,
        }
    }
}

/// Message codec and reply pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    pub format: WireFormat,
    /// Preallocated reply states
    pub reply_pool_size: usize,
    pub max_reply_size: usize,
    /// How long a reply allocation waits for a pooled state
    pub pool_wait: String,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            format: WireFormat::SelfDescribing,
            reply_pool_size: 4,
            max_reply_size: 16 * 1024,
            pool_wait: "10s".to_string(),
        }
    }
}

/// Import recovery settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub obd_timeout: String,
    pub max_resends: u32,
    pub policy: RecoveryPolicy,
    pub replayable: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            obd_timeout: "100s".to_string(),
            max_resends: 10,
            policy: RecoveryPolicy::Connect,
            replayable: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Skip extent locking entirely
    pub disabled: bool,
}

impl StripenetConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = if text.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.layout.stripe_size == 0 || self.layout.stripe_size % PAGE_SIZE != 0 {
            return Err(Error::Config(format!(
                "layout.stripe_size {} is not a positive multiple of {}",
                self.layout.stripe_size, PAGE_SIZE
            )));
        }
        if self.layout.stripe_count == 0 {
            return Err(Error::Config("layout.stripe_count must be at least 1".into()));
        }
        if self.wire.max_reply_size == 0 {
            return Err(Error::Config("wire.max_reply_size must be positive".into()));
        }
        parse_duration(&self.wire.pool_wait)?;
        parse_duration(&self.recovery.obd_timeout)?;
        Ok(())
    }

    /// Layout of a new object over `stripe_count` consecutive targets
    /// starting at `first_target`.
    pub fn layout(&self, first_target: TargetIndex) -> Result<StripeLayout> {
        let targets = (0..self.layout.stripe_count)
            .map(|i| first_target + i)
            .collect();
        StripeLayout::new(self.layout.stripe_size, targets)
    }

    pub fn msg_format(&self) -> MsgFormat {
        self.wire.format.into()
    }

    pub fn reply_pool(&self) -> Result<ReplyPoolConfig> {
        Ok(ReplyPoolConfig {
            prealloc: self.wire.reply_pool_size,
            max_reply_size: self.wire.max_reply_size,
            wait: parse_duration(&self.wire.pool_wait)?,
        })
    }

    pub fn import(&self) -> Result<ImportConfig> {
        Ok(ImportConfig {
            obd_timeout: parse_duration(&self.recovery.obd_timeout)?,
            max_resends: self.recovery.max_resends,
            policy: self.recovery.policy,
            replayable: self.recovery.replayable,
        })
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration such as "10s", "5m", "1h30m" or "2d"; a bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            's' | 'S' => 1,
            'm' | 'M' => 60,
            'h' | 'H' => 3600,
            'd' | 'D' => 86400,
            _ => return Err(Error::DurationParse(format!("unknown duration unit: {}", c))),
        };
        total_secs += num * multiplier;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_secs += num;
    }

    if total_secs == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_secs(total_secs))
}
