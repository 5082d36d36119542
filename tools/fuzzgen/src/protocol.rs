//! Multi-part request/response messages.
//!
//! Requests:
//!
//! ```text
//! termination:   [session id][1, outcome]
//! value request: [session id][decision id: u64 LE][tag: u8][lo][hi]
//! ```
//!
//! Responses are `[status]`, `[OK_TERMINAL][outcome]` or `[OK_VALUE][payload]`.

use crate::codec::{RawValue, Scalar, TypeTag};
use crate::errors::FuzzError;
use crate::tree::DecisionSignature;
use std::fmt;

pub const TERMINATION_FLAG: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    OkTerminal = 10,
    OkValue = 11,
    ErrFewParts = 20,
    ErrTermTakes2 = 21,
    ErrValueTakes5 = 22,
    ErrWrongValueId = 23,
    /// Part count is right but a part cannot be decoded.
    ErrBadPayload = 24,
    /// The server could not serve an otherwise valid request.
    ErrInternal = 25,
}

impl Status {
    const ALL: [Status; 8] = [
        Self::OkTerminal,
        Self::OkValue,
        Self::ErrFewParts,
        Self::ErrTermTakes2,
        Self::ErrValueTakes5,
        Self::ErrWrongValueId,
        Self::ErrBadPayload,
        Self::ErrInternal,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Self::OkTerminal | Self::OkValue)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OkTerminal => "OK_TERMINAL",
            Self::OkValue => "OK_VALUE",
            Self::ErrFewParts => "ERR_FEW_PARTS",
            Self::ErrTermTakes2 => "ERR_TERM_TAKES_2",
            Self::ErrValueTakes5 => "ERR_VALUE_TAKES_5",
            Self::ErrWrongValueId => "ERR_WRONG_VALUEID",
            Self::ErrBadPayload => "ERR_BAD_PAYLOAD",
            Self::ErrInternal => "ERR_INTERNAL",
        };
        write!(f, "{name}({})", self.code())
    }
}

/// Opaque client-chosen session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub Vec<u8>);

impl SessionId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().all(|c| c.is_ascii_graphic()) => f.write_str(text),
            _ => {
                for byte in &self.0 {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Terminate {
        session: SessionId,
        success: bool,
    },
    Value {
        session: SessionId,
        decision: DecisionSignature,
    },
}

impl Request {
    pub fn session(&self) -> &SessionId {
        match self {
            Self::Terminate { session, .. } | Self::Value { session, .. } => session,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    FewParts(usize),
    TermTakes2(usize),
    ValueTakes5(usize),
    BadPayload(String),
}

impl ParseError {
    pub fn status(&self) -> Status {
        match self {
            Self::FewParts(_) => Status::ErrFewParts,
            Self::TermTakes2(_) => Status::ErrTermTakes2,
            Self::ValueTakes5(_) => Status::ErrValueTakes5,
            Self::BadPayload(_) => Status::ErrBadPayload,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FewParts(n) => write!(f, "message has {n} part(s), need at least 2"),
            Self::TermTakes2(n) => write!(f, "termination has {n} parts, need exactly 2"),
            Self::ValueTakes5(n) => write!(f, "value request has {n} parts, need exactly 5"),
            Self::BadPayload(reason) => f.write_str(reason),
        }
    }
}

fn is_termination_part(part: &[u8]) -> bool {
    part.len() == 2 && part[0] == TERMINATION_FLAG
}

/// Classifies a message. Checks run in a fixed order: part count, termination
/// shape, value-request shape, then payload decoding.
pub fn parse_request(parts: &[Vec<u8>]) -> Result<Request, ParseError> {
    if parts.len() < 2 {
        return Err(ParseError::FewParts(parts.len()));
    }
    let session = SessionId(parts[0].clone());

    if is_termination_part(&parts[1]) {
        if parts.len() != 2 {
            return Err(ParseError::TermTakes2(parts.len()));
        }
        return Ok(Request::Terminate {
            session,
            success: parts[1][1] != 0,
        });
    }

    if parts.len() != 5 {
        return Err(ParseError::ValueTakes5(parts.len()));
    }

    let decision_id = <[u8; 8]>::try_from(parts[1].as_slice())
        .map(u64::from_le_bytes)
        .map_err(|_| {
            ParseError::BadPayload(format!(
                "decision id must be 8 bytes, got {}",
                parts[1].len()
            ))
        })?;
    let tag = match parts[2].as_slice() {
        [byte] => TypeTag::from_u8(*byte)
            .ok_or_else(|| ParseError::BadPayload(format!("unknown type tag {byte}")))?,
        other => {
            return Err(ParseError::BadPayload(format!(
                "type tag must be 1 byte, got {}",
                other.len()
            )))
        }
    };
    let bound = |part: &[u8]| {
        RawValue::from_payload(tag, part).map_err(|e| ParseError::BadPayload(e.to_string()))
    };
    let lo = bound(&parts[3])?;
    let hi = bound(&parts[4])?;
    check_bounds(lo.to_scalar(), hi.to_scalar())?;

    Ok(Request::Value {
        session,
        decision: DecisionSignature {
            decision_id,
            tag,
            lo,
            hi,
        },
    })
}

fn check_bounds(lo: Scalar, hi: Scalar) -> Result<(), ParseError> {
    match lo.partial_cmp(&hi) {
        Some(std::cmp::Ordering::Greater) => Err(ParseError::BadPayload(format!(
            "lower bound {lo} exceeds upper bound {hi}"
        ))),
        Some(_) => Ok(()),
        None => Err(ParseError::BadPayload(format!(
            "bounds {lo} and {hi} are unordered"
        ))),
    }
}

pub fn encode_termination(session: &SessionId, success: bool) -> Vec<Vec<u8>> {
    vec![
        session.0.clone(),
        vec![TERMINATION_FLAG, u8::from(success)],
    ]
}

pub fn encode_value_request(
    session: &SessionId,
    decision_id: u64,
    lo: Scalar,
    hi: Scalar,
) -> Vec<Vec<u8>> {
    vec![
        session.0.clone(),
        decision_id.to_le_bytes().to_vec(),
        vec![lo.tag().as_u8()],
        lo.to_raw().payload(),
        hi.to_raw().payload(),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Option<Vec<u8>>,
}

impl Response {
    pub fn error(status: Status) -> Self {
        Self {
            status,
            payload: None,
        }
    }

    pub fn terminal(success: bool) -> Self {
        Self {
            status: Status::OkTerminal,
            payload: Some(vec![u8::from(success)]),
        }
    }

    pub fn value(value: RawValue) -> Self {
        Self {
            status: Status::OkValue,
            payload: Some(value.payload()),
        }
    }

    pub fn into_parts(self) -> Vec<Vec<u8>> {
        let mut parts = vec![vec![self.status.code()]];
        parts.extend(self.payload);
        parts
    }

    pub fn from_parts(parts: &[Vec<u8>]) -> Result<Self, FuzzError> {
        let code = match parts.first().map(Vec::as_slice) {
            Some([code]) => *code,
            _ => {
                return Err(FuzzError::Protocol(
                    "response must start with a 1-byte status part".to_string(),
                ))
            }
        };
        let status = Status::from_code(code)
            .ok_or_else(|| FuzzError::Protocol(format!("unknown status code {code}")))?;
        Ok(Self {
            status,
            payload: parts.get(1).cloned(),
        })
    }

    /// Decodes an `OK_VALUE` payload as `tag`.
    pub fn value_as(&self, tag: TypeTag) -> Result<Scalar, FuzzError> {
        match (self.status, &self.payload) {
            (Status::OkValue, Some(payload)) => Ok(RawValue::from_payload(tag, payload)?.to_scalar()),
            (status, _) => Err(FuzzError::Protocol(format!(
                "expected OK_VALUE with payload, got {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid() -> SessionId {
        SessionId::from("s1")
    }

    #[test]
    fn part_counts_map_to_status_codes() {
        let err = parse_request(&[b"s1".to_vec()]).expect_err("one part");
        assert_eq!(err.status().code(), 20);

        let mut term = encode_termination(&sid(), true);
        term.push(vec![0]);
        let err = parse_request(&term).expect_err("three part termination");
        assert_eq!(err.status().code(), 21);

        let mut value = encode_value_request(&sid(), 7, Scalar::I32(0), Scalar::I32(100));
        value.pop();
        let err = parse_request(&value).expect_err("four part value");
        assert_eq!(err.status().code(), 22);
    }

    #[test]
    fn termination_and_value_requests_decode() {
        assert_eq!(
            parse_request(&encode_termination(&sid(), false)).expect("term"),
            Request::Terminate {
                session: sid(),
                success: false
            }
        );
        let request = parse_request(&encode_value_request(
            &sid(),
            7,
            Scalar::I32(-5),
            Scalar::I32(100),
        ))
        .expect("value");
        let Request::Value { decision, .. } = request else {
            panic!("expected a value request");
        };
        assert_eq!(decision.decision_id, 7);
        assert_eq!(decision.tag, TypeTag::I32);
        assert_eq!(decision.lo.to_scalar(), Scalar::I32(-5));
    }

    #[test]
    fn undecodable_parts_are_bad_payloads() {
        let mut parts = encode_value_request(&sid(), 7, Scalar::U8(0), Scalar::U8(1));
        parts[2] = vec![99];
        assert_eq!(
            parse_request(&parts).expect_err("tag").status(),
            Status::ErrBadPayload
        );

        let parts = encode_value_request(&sid(), 7, Scalar::U8(9), Scalar::U8(1));
        assert_eq!(
            parse_request(&parts).expect_err("inverted").status(),
            Status::ErrBadPayload
        );

        let mut parts = encode_value_request(&sid(), 7, Scalar::F64(0.0), Scalar::F64(1.0));
        parts[3] = f64::NAN.to_le_bytes().to_vec();
        assert_eq!(
            parse_request(&parts).expect_err("nan").status(),
            Status::ErrBadPayload
        );

        let mut parts = encode_value_request(&sid(), 7, Scalar::U8(0), Scalar::U8(1));
        parts[1] = vec![1, 2, 3];
        assert_eq!(
            parse_request(&parts).expect_err("short id").status(),
            Status::ErrBadPayload
        );
    }

    #[test]
    fn responses_round_trip_through_parts() {
        let parts = Response::terminal(true).into_parts();
        assert_eq!(parts, vec![vec![10], vec![1]]);
        let parts = Response::value(Scalar::I32(42).to_raw()).into_parts();
        assert_eq!(parts, vec![vec![11], 42i32.to_le_bytes().to_vec()]);
        let decoded = Response::from_parts(&parts).expect("decode");
        assert_eq!(decoded.value_as(TypeTag::I32).expect("i32"), Scalar::I32(42));
        assert_eq!(Response::error(Status::ErrFewParts).into_parts(), vec![vec![20]]);
        assert!(Response::from_parts(&[vec![99]]).is_err());
    }

    #[test]
    fn session_ids_render_readably() {
        assert_eq!(SessionId::from("run-1").to_string(), "run-1");
        assert_eq!(SessionId(vec![0, 255]).to_string(), "00ff");
    }
}
