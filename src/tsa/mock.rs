//! In-process time-stamp authority for tests and local runs.
//!
//! Tokens carry a well-formed `TSTInfo` inside a CMS envelope with no
//! signer infos, so they parse like real tokens but prove nothing.

use async_trait::async_trait;
use chrono::SubsecRound;
use parking_lot::Mutex;

use super::client::TsaTransport;
use super::der::{self, context, DerError, TAG_SET, TAG_UTF8_STRING};
use super::request::TimeStampRequest;
use super::response::{TstInfo, OID_SIGNED_DATA, OID_TST_INFO};
use crate::clock::{self, Clock, SharedClock};
use crate::error::{Error, Result};

/// Policy stamped on tokens when the request names none.
pub const MOCK_POLICY: &str = "1.3.6.1.4.1.55555.1.1";

/// How the authority answers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Grant every request
    #[default]
    Grant,
    /// Refuse with this PKIStatus and text
    Reject {
        /// PKIStatus
        status: u8,
        /// statusString
        reason: String,
    },
    /// Grant but echo a different nonce
    WrongNonce,
    /// Grant but stamp a different digest
    WrongImprint,
}

#[derive(Default)]
struct State {
    behavior: Behavior,
    fail_remaining: u32,
    requests: u64,
    nonces: Vec<u64>,
}

/// A scriptable authority implementing [`TsaTransport`].
pub struct MockAuthority {
    clock: SharedClock,
    state: Mutex<State>,
}

impl Default for MockAuthority {
    fn default() -> Self {
        Self::new(clock::system())
    }
}

impl MockAuthority {
    /// Authority whose `genTime` follows `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    /// Changes how later requests are answered.
    pub fn set_behavior(&self, behavior: Behavior) {
        self.state.lock().behavior = behavior;
    }

    /// Makes the next `n` requests fail as unreachable.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_remaining = n;
    }

    /// Requests received so far, failed ones included.
    pub fn requests(&self) -> u64 {
        self.state.lock().requests
    }

    /// Nonces of every request received.
    pub fn nonces(&self) -> Vec<u64> {
        self.state.lock().nonces.clone()
    }

    fn answer(
        &self,
        request: &TimeStampRequest,
        serial: u64,
        behavior: &Behavior,
    ) -> Result<Vec<u8>> {
        if let Behavior::Reject { status, reason } = behavior {
            return Ok(encode_response(*status, Some(reason.as_str()), None));
        }

        let mut imprint = request.imprint.clone();
        if *behavior == Behavior::WrongImprint {
            if let Some(first) = imprint.first_mut() {
                *first ^= 0xFF;
            }
        }
        let nonce = match behavior {
            Behavior::WrongNonce => request.nonce.wrapping_add(1),
            _ => request.nonce,
        };
        let info = TstInfo {
            policy: request.policy.clone().unwrap_or_else(|| MOCK_POLICY.to_string()),
            algorithm: request.algorithm,
            imprint,
            serial: der::unsigned(serial)[2..].to_vec(),
            gen_time: self.clock.now().trunc_subsecs(0),
            nonce: Some(nonce),
        };
        let token = encode_token(&info)?;
        Ok(encode_response(0, None, Some(token.as_slice())))
    }
}

#[async_trait]
impl TsaTransport for MockAuthority {
    async fn send(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let parsed = TimeStampRequest::from_der(&request);
        let (serial, behavior) = {
            let mut state = self.state.lock();
            state.requests += 1;
            if let Ok(parsed) = &parsed {
                state.nonces.push(parsed.nonce);
            }
            if state.fail_remaining > 0 {
                state.fail_remaining -= 1;
                return Err(Error::TsaUnavailable("mock authority: connection refused".into()));
            }
            (state.requests, state.behavior.clone())
        };

        match parsed {
            Ok(parsed) => self.answer(&parsed, serial, &behavior),
            Err(e) => Ok(encode_response(2, Some(format!("badDataFormat: {e}").as_str()), None)),
        }
    }
}

/// Wraps a `TSTInfo` in a signer-less CMS `SignedData` `ContentInfo`.
///
/// # Errors
///
/// Returns `DerError` if the policy is not a valid OID.
pub fn encode_token(info: &TstInfo) -> std::result::Result<Vec<u8>, DerError> {
    let algorithm = der::sequence(&[&der::oid(info.algorithm.oid())?, &der::null()]);
    let imprint = der::sequence(&[&algorithm, &der::octet_string(&info.imprint)]);
    let nonce = info.nonce.map(der::unsigned).unwrap_or_default();
    let tst = der::sequence(&[
        &der::unsigned(1),
        &der::oid(&info.policy)?,
        &imprint,
        &der::tlv(der::TAG_INTEGER, &info.serial),
        &der::generalized_time(&info.gen_time),
        &nonce,
    ]);

    let encap = der::sequence(&[
        &der::oid(OID_TST_INFO)?,
        &der::tlv(context(0), &der::octet_string(&tst)),
    ]);
    let signed_data = der::sequence(&[
        &der::unsigned(3),
        &der::tlv(TAG_SET, &algorithm),
        &encap,
        &der::tlv(TAG_SET, &[]),
    ]);
    Ok(der::sequence(&[
        &der::oid(OID_SIGNED_DATA)?,
        &der::tlv(context(0), &signed_data),
    ]))
}

/// Encodes a `TimeStampResp`.
pub fn encode_response(status: u8, reason: Option<&str>, token: Option<&[u8]>) -> Vec<u8> {
    let text = reason
        .map(|r| der::sequence(&[&der::tlv(TAG_UTF8_STRING, r.as_bytes())]))
        .unwrap_or_default();
    let status_info = der::sequence(&[&der::unsigned(u64::from(status)), &text]);
    der::sequence(&[&status_info, token.unwrap_or_default()])
}
