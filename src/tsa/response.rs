use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::der::{
    self, context, DerError, Reader, TAG_BIT_STRING, TAG_BOOLEAN, TAG_GENERALIZED_TIME,
    TAG_INTEGER, TAG_OCTET_STRING, TAG_OID, TAG_SEQUENCE, TAG_SET, TAG_UTF8_STRING,
};
use super::request::{read_imprint, HashAlgorithm};

/// `id-signedData`
pub const OID_SIGNED_DATA: &str = "1.2.840.113549.1.7.2";
/// `id-ct-TSTInfo`
pub const OID_TST_INFO: &str = "1.2.840.113549.1.9.16.1.4";

/// PKIStatus values that mean the token was issued.
pub const STATUS_GRANTED: i64 = 0;
/// Granted with modifications.
pub const STATUS_GRANTED_WITH_MODS: i64 = 1;

/// A parsed `TimeStampResp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeStampResponse {
    /// PKIStatus
    pub status: i64,
    /// Free-text status, joined
    pub status_text: Option<String>,
    /// Raw failInfo bits, if present
    pub fail_info: Option<Vec<u8>>,
    /// DER `TimeStampToken` (a CMS `ContentInfo`), present when granted
    pub token: Option<Vec<u8>>,
}

impl TimeStampResponse {
    /// Whether the authority issued a token.
    pub fn granted(&self) -> bool {
        matches!(self.status, STATUS_GRANTED | STATUS_GRANTED_WITH_MODS)
    }

    /// Human-readable reason for a refusal.
    pub fn reason(&self) -> String {
        if let Some(text) = &self.status_text {
            return text.clone();
        }
        let name = match self.status {
            2 => "rejection",
            3 => "waiting",
            4 => "revocationWarning",
            5 => "revocationNotification",
            _ => "unknown status",
        };
        match &self.fail_info {
            Some(bits) => format!("{name} (failInfo {})", hex::encode(bits)),
            None => name.to_string(),
        }
    }

    /// Parses a DER response.
    ///
    /// # Errors
    ///
    /// Returns `DerError` for malformed input.
    pub fn from_der(bytes: &[u8]) -> Result<Self, DerError> {
        let mut outer = Reader::new(bytes);
        let mut resp = outer.enter(TAG_SEQUENCE)?;
        outer.finish()?;

        let mut info = resp.enter(TAG_SEQUENCE)?;
        let status = der::read_i64(info.expect(TAG_INTEGER)?.content)?;
        let status_text = match info.optional(TAG_SEQUENCE)? {
            Some(free_text) => {
                let mut strings = Reader::new(free_text.content);
                let mut parts = Vec::new();
                while !strings.is_empty() {
                    let tlv = strings.expect(TAG_UTF8_STRING)?;
                    parts.push(String::from_utf8_lossy(tlv.content).into_owned());
                }
                Some(parts.join("; "))
            }
            None => None,
        };
        let fail_info = info
            .optional(TAG_BIT_STRING)?
            .map(|tlv| tlv.content.to_vec());

        let token = resp.optional(TAG_SEQUENCE)?.map(|tlv| tlv.raw.to_vec());

        Ok(Self {
            status,
            status_text,
            fail_info,
            token,
        })
    }
}

/// The fields of a `TSTInfo` this crate relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TstInfo {
    /// Policy the token was issued under
    pub policy: String,
    /// Imprint digest algorithm
    pub algorithm: HashAlgorithm,
    /// Imprint digest
    #[serde(with = "hex_bytes")]
    pub imprint: Vec<u8>,
    /// Serial number, big-endian
    #[serde(with = "hex_bytes")]
    pub serial: Vec<u8>,
    /// Time asserted by the authority
    pub gen_time: DateTime<Utc>,
    /// Echoed request nonce
    pub nonce: Option<u64>,
}

impl TstInfo {
    /// Extracts the `TSTInfo` from a DER `TimeStampToken`.
    ///
    /// The CMS signature itself is not checked; certificate-chain validation
    /// belongs to the relying party.
    ///
    /// # Errors
    ///
    /// Returns `DerError` if the token is not a signed-data `TSTInfo`.
    pub fn from_token(token: &[u8]) -> Result<Self, DerError> {
        let mut outer = Reader::new(token);
        let mut content_info = outer.enter(TAG_SEQUENCE)?;
        outer.finish()?;
        if der::read_oid(content_info.expect(TAG_OID)?.content)? != OID_SIGNED_DATA {
            return Err(DerError::BadValue("content type"));
        }
        let mut explicit = content_info.enter(context(0))?;
        let mut signed_data = explicit.enter(TAG_SEQUENCE)?;
        signed_data.expect(TAG_INTEGER)?;
        signed_data.expect(TAG_SET)?;

        let mut encap = signed_data.enter(TAG_SEQUENCE)?;
        if der::read_oid(encap.expect(TAG_OID)?.content)? != OID_TST_INFO {
            return Err(DerError::BadValue("encapsulated content type"));
        }
        let mut econtent = encap.enter(context(0))?;
        let tst_der = econtent.expect(TAG_OCTET_STRING)?.content;

        Self::from_der(tst_der)
    }

    /// Parses a bare DER `TSTInfo`.
    ///
    /// # Errors
    ///
    /// Returns `DerError` for malformed input.
    pub fn from_der(bytes: &[u8]) -> Result<Self, DerError> {
        let mut outer = Reader::new(bytes);
        let mut tst = outer.enter(TAG_SEQUENCE)?;
        outer.finish()?;

        if der::read_u64(tst.expect(TAG_INTEGER)?.content)? != 1 {
            return Err(DerError::BadValue("version"));
        }
        let policy = der::read_oid(tst.expect(TAG_OID)?.content)?;
        let (algorithm, imprint) = read_imprint(&mut tst)?;
        let serial = tst.expect(TAG_INTEGER)?.content.to_vec();
        let gen_time = der::read_generalized_time(tst.expect(TAG_GENERALIZED_TIME)?.content)?;
        // accuracy and ordering are not used
        tst.optional(TAG_SEQUENCE)?;
        tst.optional(TAG_BOOLEAN)?;
        let nonce = tst
            .optional(TAG_INTEGER)?
            .map(|tlv| der::read_u64(tlv.content))
            .transpose()?;

        Ok(Self {
            policy,
            algorithm,
            imprint,
            serial,
            gen_time,
            nonce,
        })
    }

    /// Whether the token covers `payload`.
    pub fn covers(&self, payload: &[u8]) -> bool {
        self.algorithm.digest(payload) == self.imprint
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        hex::decode(String::deserialize(deserializer)?).map_err(|e| Error::custom(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsa::mock::{encode_response, encode_token};
    use chrono::TimeZone;

    fn info() -> TstInfo {
        TstInfo {
            policy: "1.3.6.1.4.1.4146.2.3".into(),
            algorithm: HashAlgorithm::Sha256,
            imprint: HashAlgorithm::Sha256.digest(b"evidence"),
            serial: vec![0x01, 0x02],
            gen_time: Utc.with_ymd_and_hms(2025, 8, 1, 10, 0, 0).unwrap(),
            nonce: Some(42),
        }
    }

    #[test]
    fn granted_response_carries_token() {
        let token = encode_token(&info()).unwrap();
        let resp = TimeStampResponse::from_der(&encode_response(0, None, Some(token.as_slice()))).unwrap();
        assert!(resp.granted());
        assert_eq!(resp.token.as_deref(), Some(token.as_slice()));

        let parsed = TstInfo::from_token(&token).unwrap();
        assert_eq!(parsed, info());
        assert!(parsed.covers(b"evidence"));
        assert!(!parsed.covers(b"evidencE"));
    }

    #[test]
    fn rejection_keeps_reason() {
        let resp =
            TimeStampResponse::from_der(&encode_response(2, Some("bad digest"), None)).unwrap();
        assert!(!resp.granted());
        assert_eq!(resp.reason(), "bad digest");
        assert!(resp.token.is_none());

        let bare = TimeStampResponse::from_der(&encode_response(5, None, None)).unwrap();
        assert_eq!(bare.reason(), "revocationNotification");
    }

    #[test]
    fn garbage_is_not_a_token() {
        assert!(TstInfo::from_token(b"\x30\x03\x02\x01\x01").is_err());
        assert!(TimeStampResponse::from_der(b"not der").is_err());
    }
}
