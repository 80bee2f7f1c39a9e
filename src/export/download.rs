//! Time-boxed, single-use download tokens.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SharedClock};
use crate::error::{Error, Result};

/// A link handed to a downloader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadLink {
    /// Opaque bearer token
    pub token: String,
    /// Export it unlocks
    pub export_id: String,
    /// Last instant the token is accepted
    pub expires_at: DateTime<Utc>,
}

/// Outstanding tokens.
pub struct DownloadLinks {
    clock: SharedClock,
    links: DashMap<String, DownloadLink>,
}

impl DownloadLinks {
    /// Empty registry.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            links: DashMap::new(),
        }
    }

    /// Issues a token for `export_id` valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a non-positive `ttl`.
    pub fn issue(&self, export_id: &str, ttl: Duration) -> Result<DownloadLink> {
        if ttl <= Duration::zero() {
            return Err(Error::invalid("link lifetime must be positive"));
        }
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let link = DownloadLink {
            token: hex::encode(raw),
            export_id: export_id.to_string(),
            expires_at: self.clock.now() + ttl,
        };

        let now = self.clock.now();
        self.links.retain(|_, l| l.expires_at >= now);
        self.links.insert(link.token.clone(), link.clone());
        Ok(link)
    }

    /// Consumes a token, returning the export it unlocks.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown, used or expired token.
    pub fn redeem(&self, token: &str) -> Result<String> {
        let (_, link) = self
            .links
            .remove(token)
            .ok_or_else(|| Error::not_found("download link"))?;
        if link.expires_at < self.clock.now() {
            return Err(Error::not_found("download link"));
        }
        Ok(link.export_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn links() -> (Arc<ManualClock>, DownloadLinks) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()));
        (clock.clone(), DownloadLinks::new(clock))
    }

    #[test]
    fn tokens_are_single_use() {
        let (_, links) = links();
        let link = links.issue("exp-1", Duration::minutes(10)).unwrap();
        assert_eq!(link.token.len(), 64);
        assert_eq!(links.redeem(&link.token).unwrap(), "exp-1");
        assert!(matches!(links.redeem(&link.token), Err(Error::NotFound(_))));
    }

    #[test]
    fn expired_tokens_are_refused() {
        let (clock, links) = links();
        let link = links.issue("exp-1", Duration::minutes(10)).unwrap();
        clock.advance(Duration::minutes(11));
        assert!(matches!(links.redeem(&link.token), Err(Error::NotFound(_))));
        assert!(links.issue("exp-1", Duration::zero()).is_err());
    }

}
