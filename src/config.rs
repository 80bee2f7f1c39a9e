//! Environment-driven configuration.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::export::DEFAULT_MAX_RECORDS;
use crate::signing::Ed25519Signer;
use crate::storage::evidence::DEFAULT_RETENTION_DAYS;
use crate::storage::validation::DEFAULT_MAX_PAYLOAD;
use crate::tsa::HashAlgorithm;

/// Default listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
/// Default log origin.
pub const DEFAULT_ORIGIN: &str = "custodian.local/log";

/// Time-stamp authority settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsaConfig {
    /// RFC 3161 endpoint
    pub url: String,
    /// Imprint algorithm
    pub hash: HashAlgorithm,
    /// Requested policy OID
    pub policy: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Attempts per time-stamp
    pub attempts: u32,
}

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Postgres URL; `None` keeps the log in memory
    pub database_url: Option<String>,
    /// Listen address
    pub bind: SocketAddr,
    /// Log origin identifier
    pub origin: String,
    /// Hex Ed25519 seed for checkpoints; `None` generates one per run
    pub signing_key: Option<String>,
    /// Hex Ed25519 seed for export indexes; defaults to `signing_key`
    pub export_key: Option<String>,
    /// Time-stamp authority; `None` disables stamping
    pub tsa: Option<TsaConfig>,
    /// Upper bound on one evidence submission
    pub max_payload_bytes: usize,
    /// Retention applied to every write
    pub retention_days: i64,
    /// Largest export scope
    pub max_export_records: usize,
    /// Checkpoint cadence
    pub checkpoint_interval: Duration,
    /// Gap, hold and retention sweep cadence
    pub sweep_interval: Duration,
    /// Primary object-lock bucket
    pub s3_bucket: Option<String>,
    /// Escrow bucket for held evidence
    pub s3_escrow_bucket: Option<String>,
}

impl Config {
    /// Reads the process environment. Call `dotenv` first to pick up a
    /// `.env` file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` naming the first malformed variable.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`. Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` naming the first malformed variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let signing_key = get("CUSTODIAN_SIGNING_KEY");
        if let Some(seed) = &signing_key {
            Ed25519Signer::from_hex(seed).map_err(|e| bad("CUSTODIAN_SIGNING_KEY", e))?;
        }
        let export_key = get("CUSTODIAN_EXPORT_KEY");
        if let Some(seed) = &export_key {
            Ed25519Signer::from_hex(seed).map_err(|e| bad("CUSTODIAN_EXPORT_KEY", e))?;
        }

        let tsa = match get("CUSTODIAN_TSA_URL") {
            None => None,
            Some(url) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(bad("CUSTODIAN_TSA_URL", "must be an http(s) URL"));
                }
                let policy = get("CUSTODIAN_TSA_POLICY");
                if let Some(oid) = &policy {
                    if !is_dotted_oid(oid) {
                        return Err(bad("CUSTODIAN_TSA_POLICY", "must be a dotted OID"));
                    }
                }
                let attempts: u32 = parse(&get, "CUSTODIAN_TSA_ATTEMPTS", 3)?;
                if attempts == 0 {
                    return Err(bad("CUSTODIAN_TSA_ATTEMPTS", "must be at least 1"));
                }
                Some(TsaConfig {
                    url,
                    hash: parse(&get, "CUSTODIAN_TSA_HASH", HashAlgorithm::Sha256)?,
                    policy,
                    timeout: Duration::from_secs(positive(&get, "CUSTODIAN_TSA_TIMEOUT_SECS", 30)?),
                    attempts,
                })
            }
        };

        let bind = parse(&get, "CUSTODIAN_BIND", SocketAddr::from(([127, 0, 0, 1], 3000)))?;
        let retention_days: i64 = parse(&get, "CUSTODIAN_RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?;
        if retention_days <= 0 {
            return Err(bad("CUSTODIAN_RETENTION_DAYS", "must be positive"));
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            bind,
            origin: get("CUSTODIAN_ORIGIN").unwrap_or_else(|| DEFAULT_ORIGIN.to_string()),
            signing_key,
            export_key,
            tsa,
            max_payload_bytes: positive(&get, "CUSTODIAN_MAX_PAYLOAD_BYTES", DEFAULT_MAX_PAYLOAD)?,
            retention_days,
            max_export_records: positive(&get, "CUSTODIAN_MAX_EXPORT_RECORDS", DEFAULT_MAX_RECORDS)?,
            checkpoint_interval: Duration::from_secs(positive(&get, "CUSTODIAN_CHECKPOINT_SECS", 300)?),
            sweep_interval: Duration::from_secs(positive(&get, "CUSTODIAN_SWEEP_SECS", 3600)?),
            s3_bucket: get("CUSTODIAN_S3_BUCKET"),
            s3_escrow_bucket: get("CUSTODIAN_S3_ESCROW_BUCKET"),
        })
    }

    /// Checkpoint signer. Without a configured seed a fresh key is
    /// generated, so checkpoints from earlier runs will not verify.
    ///
    /// # Errors
    ///
    /// Returns `Error::Signature` for a malformed seed.
    pub fn checkpoint_signer(&self) -> Result<Ed25519Signer> {
        match &self.signing_key {
            Some(seed) => Ed25519Signer::from_hex(seed),
            None => {
                tracing::warn!("CUSTODIAN_SIGNING_KEY not set, using an ephemeral checkpoint key");
                Ok(Ed25519Signer::generate())
            }
        }
    }

    /// Export index signer, falling back to the checkpoint seed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Signature` for a malformed seed.
    pub fn export_signer(&self) -> Result<Option<Ed25519Signer>> {
        self.export_key
            .as_deref()
            .map(Ed25519Signer::from_hex)
            .transpose()
    }
}

fn bad(name: &str, problem: impl std::fmt::Display) -> Error {
    Error::invalid(format!("{name}: {problem}"))
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| bad(name, format!("'{raw}': {e}"))),
    }
}

fn positive<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr + Default + PartialOrd,
    T::Err: std::fmt::Display,
{
    let value = parse(get, name, default)?;
    if value <= T::default() {
        return Err(bad(name, "must be positive"));
    }
    Ok(value)
}

fn is_dotted_oid(value: &str) -> bool {
    let arcs: Vec<&str> = value.split('.').collect();
    arcs.len() >= 2 && arcs.iter().all(|a| !a.is_empty() && a.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.bind.to_string(), DEFAULT_BIND);
        assert_eq!(config.origin, DEFAULT_ORIGIN);
        assert_eq!(config.database_url, None);
        assert_eq!(config.tsa, None);
        assert_eq!(config.retention_days, 730);
        assert_eq!(config.max_payload_bytes, 100 * 1024 * 1024);
        assert_eq!(config.checkpoint_interval, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
        assert!(config.export_signer().unwrap().is_none());
    }

    #[test]
    fn tsa_settings() {
        let config = config(&[
            ("CUSTODIAN_TSA_URL", "https://tsa.example/tsr"),
            ("CUSTODIAN_TSA_HASH", "sha512"),
            ("CUSTODIAN_TSA_POLICY", "1.2.3.4.1"),
            ("CUSTODIAN_TSA_TIMEOUT_SECS", "5"),
        ])
        .unwrap();
        let tsa = config.tsa.unwrap();
        assert_eq!(tsa.hash, HashAlgorithm::Sha512);
        assert_eq!(tsa.policy.as_deref(), Some("1.2.3.4.1"));
        assert_eq!(tsa.timeout, Duration::from_secs(5));
        assert_eq!(tsa.attempts, 3);
    }

    #[test]
    fn malformed_values_are_validation_errors() {
        for vars in [
            [("CUSTODIAN_BIND", "localhost")],
            [("CUSTODIAN_RETENTION_DAYS", "0")],
            [("CUSTODIAN_CHECKPOINT_SECS", "soon")],
            [("CUSTODIAN_SIGNING_KEY", "zz")],
            [("CUSTODIAN_TSA_URL", "ftp://tsa")],
        ] {
            let err = config(&vars).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{vars:?}: {err}");
            assert!(err.to_string().contains(vars[0].0));
        }
    }

    #[test]
    fn seeds_produce_stable_keys() {
        let seed = "07".repeat(32);
        let config = config(&[("CUSTODIAN_SIGNING_KEY", seed.as_str())]).unwrap();
        assert_eq!(
            config.checkpoint_signer().unwrap().public_key_hex(),
            Ed25519Signer::from_seed(&[7u8; 32]).public_key_hex()
        );
    }
}
