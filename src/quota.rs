//! Space accounting implementations of the `QuotaCapability` port.

use dashmap::DashMap;
use tracing::debug;

use crate::domain::QuotaCapability;
use crate::error::{Error, Result};

/// Never refuses anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl QuotaCapability for Unlimited {
    fn check(&self, _owner: &str, _bytes: u64) -> Result<()> {
        Ok(())
    }

    fn acquire(&self, _owner: &str, _bytes: u64) -> Result<()> {
        Ok(())
    }

    fn release(&self, _owner: &str, _bytes: u64) {}
}

#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    limit: u64,
    used: u64,
}

impl Usage {
    fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// Per-owner byte limits kept in memory. Owners without a limit are
/// unrestricted.
#[derive(Debug, Default)]
pub struct MemoryQuota {
    owners: DashMap<String, Usage>,
}

impl MemoryQuota {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `owner`'s limit, keeping what it already uses.
    pub fn set_limit(&self, owner: &str, limit: u64) {
        self.owners.entry(owner.to_string()).or_default().limit = limit;
    }

    pub fn used(&self, owner: &str) -> u64 {
        self.owners.get(owner).map_or(0, |u| u.used)
    }

    fn exceeded(owner: &str, bytes: u64, usage: &Usage) -> Error {
        Error::QuotaExceeded {
            owner: owner.to_string(),
            requested: bytes,
            available: usage.available(),
        }
    }
}

impl QuotaCapability for MemoryQuota {
    fn check(&self, owner: &str, bytes: u64) -> Result<()> {
        match self.owners.get(owner) {
            Some(usage) if usage.available() < bytes => Err(Self::exceeded(owner, bytes, &usage)),
            _ => Ok(()),
        }
    }

    fn acquire(&self, owner: &str, bytes: u64) -> Result<()> {
        let Some(mut usage) = self.owners.get_mut(owner) else {
            return Ok(());
        };
        if usage.available() < bytes {
            return Err(Self::exceeded(owner, bytes, &usage));
        }
        usage.used += bytes;
        debug!(owner, bytes, used = usage.used, limit = usage.limit, "quota charged");
        Ok(())
    }

    fn release(&self, owner: &str, bytes: u64) {
        if let Some(mut usage) = self.owners.get_mut(owner) {
            usage.used = usage.used.saturating_sub(bytes);
        }
    }
}
