use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

use super::der::{self, DerError, Reader, TAG_BOOLEAN, TAG_INTEGER, TAG_OCTET_STRING, TAG_OID, TAG_SEQUENCE};
use crate::error::{Error, Result};

/// Digest used for the message imprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256
    #[default]
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Dotted OID.
    pub const fn oid(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "2.16.840.1.101.3.4.2.1",
            HashAlgorithm::Sha384 => "2.16.840.1.101.3.4.2.2",
            HashAlgorithm::Sha512 => "2.16.840.1.101.3.4.2.3",
        }
    }

    /// Looks an algorithm up by OID.
    pub fn from_oid(oid: &str) -> Option<Self> {
        [Self::Sha256, Self::Sha384, Self::Sha512]
            .into_iter()
            .find(|alg| alg.oid() == oid)
    }

    /// Digest of `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Digest length in bytes.
    pub const fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Short name.
    pub const fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(Error::invalid(format!("unsupported hash algorithm '{s}'"))),
        }
    }
}

/// An RFC 3161 `TimeStampReq`, version 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeStampRequest {
    /// Imprint digest algorithm
    pub algorithm: HashAlgorithm,
    /// Digest of the time-stamped data
    pub imprint: Vec<u8>,
    /// Requested policy OID
    pub policy: Option<String>,
    /// Replay-protection nonce, positive
    pub nonce: u64,
    /// Ask the authority to include its certificate
    pub cert_req: bool,
}

impl TimeStampRequest {
    /// Builds a request over `payload` with a fresh random nonce.
    pub fn new(payload: &[u8], algorithm: HashAlgorithm, policy: Option<String>) -> Self {
        Self {
            algorithm,
            imprint: algorithm.digest(payload),
            policy,
            nonce: fresh_nonce(),
            cert_req: true,
        }
    }

    /// DER encoding.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the policy is not a valid OID.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let algorithm = der::sequence(&[&der::oid(self.algorithm.oid())?, &der::null()]);
        let imprint = der::sequence(&[&algorithm, &der::octet_string(&self.imprint)]);
        let policy = match &self.policy {
            Some(policy) => der::oid(policy)
                .map_err(|_| Error::invalid(format!("invalid TSA policy OID '{policy}'")))?,
            None => Vec::new(),
        };
        Ok(der::sequence(&[
            &der::unsigned(1),
            &imprint,
            &policy,
            &der::unsigned(self.nonce),
            &der::boolean(self.cert_req),
        ]))
    }

    /// Parses a DER request.
    ///
    /// # Errors
    ///
    /// Returns `DerError` for malformed input or an unknown digest.
    pub fn from_der(bytes: &[u8]) -> std::result::Result<Self, DerError> {
        let mut outer = Reader::new(bytes);
        let mut req = outer.enter(TAG_SEQUENCE)?;
        outer.finish()?;

        if der::read_u64(req.expect(TAG_INTEGER)?.content)? != 1 {
            return Err(DerError::BadValue("version"));
        }
        let (algorithm, imprint) = read_imprint(&mut req)?;
        let policy = req
            .optional(TAG_OID)?
            .map(|tlv| der::read_oid(tlv.content))
            .transpose()?;
        let nonce = req
            .optional(TAG_INTEGER)?
            .map(|tlv| der::read_u64(tlv.content))
            .transpose()?
            .unwrap_or(0);
        let cert_req = req
            .optional(TAG_BOOLEAN)?
            .is_some_and(|tlv| tlv.content != [0]);

        Ok(Self {
            algorithm,
            imprint,
            policy,
            nonce,
            cert_req,
        })
    }
}

/// Reads a `MessageImprint` sequence.
pub(crate) fn read_imprint(
    reader: &mut Reader<'_>,
) -> std::result::Result<(HashAlgorithm, Vec<u8>), DerError> {
    let mut imprint = reader.enter(TAG_SEQUENCE)?;
    let mut algorithm = imprint.enter(TAG_SEQUENCE)?;
    let oid = der::read_oid(algorithm.expect(TAG_OID)?.content)?;
    let algorithm = HashAlgorithm::from_oid(&oid).ok_or(DerError::BadValue("hash algorithm"))?;
    let digest = imprint.expect(TAG_OCTET_STRING)?.content.to_vec();
    if digest.len() != algorithm.output_len() {
        return Err(DerError::BadValue("message imprint"));
    }
    Ok((algorithm, digest))
}

/// A random positive 63-bit nonce.
fn fresh_nonce() -> u64 {
    (rand::random::<u64>() >> 1).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = TimeStampRequest::new(b"payload", HashAlgorithm::Sha384, Some("1.2.3.4".into()));
        let parsed = TimeStampRequest::from_der(&req.to_der().unwrap()).unwrap();
        assert_eq!(parsed, req);
        assert_eq!(parsed.imprint.len(), 48);
    }

    #[test]
    fn nonces_are_fresh() {
        let a = TimeStampRequest::new(b"x", HashAlgorithm::Sha256, None);
        let b = TimeStampRequest::new(b"x", HashAlgorithm::Sha256, None);
        assert_eq!(a.imprint, b.imprint);
        assert_ne!(a.nonce, b.nonce);
        assert!(a.nonce > 0);
    }

    #[test]
    fn encoding_starts_with_version_and_sha256_imprint() {
        let req = TimeStampRequest {
            algorithm: HashAlgorithm::Sha256,
            imprint: vec![0xAA; 32],
            policy: None,
            nonce: 7,
            cert_req: true,
        };
        let der = req.to_der().unwrap();
        // SEQUENCE, INTEGER 1, SEQUENCE { SEQUENCE { OID sha256, NULL }, OCTET STRING }
        assert_eq!(der[2..5], [0x02, 0x01, 0x01]);
        assert_eq!(der[7..9], [0x30, 0x0D]);
        assert!(der.ends_with(&[0x02, 0x01, 0x07, 0x01, 0x01, 0xFF]));
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!("SHA-512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert_eq!("sha256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert!("md5".parse::<HashAlgorithm>().is_err());
        assert!(TimeStampRequest::new(b"x", HashAlgorithm::Sha256, Some("bogus".into()))
            .to_der()
            .is_err());
    }
}
