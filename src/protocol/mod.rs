//! Management channel wire protocol.
//!
//! One TCP connection per host controller carries size-prefixed frames in
//! both directions. Every frame is either a request or a response; both
//! peers may send requests, and every request is answered by exactly one
//! response carrying the same correlation id.
//!
//! ```text
//! frame    := size:i32 kind:i8 payload
//! request  := opcode:i16 correlation_id:i32 body
//! response := correlation_id:i32 status:i16 body
//! ```
//!
//! Opcodes are collected in the [`Op`] enum and inbound requests decode into
//! the tagged [`Request`] type, so command numbers exist in exactly one
//! place.

pub mod host_info;
mod response;

use bytes::Bytes;
use nom::{
    IResult,
    number::complete::{be_i8, be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::constants::{FRAME_KIND_REQUEST, FRAME_KIND_RESPONSE};
use crate::error::{Error, Result};
use crate::parser::{bytes_to_string_opt, parse_nullable_string};
use crate::types::CorrelationId;

pub use host_info::{HostInfo, IgnoredResourceType, parse_host_info};
pub use response::{WireResponse, encode_request_frame};

/// Opcodes of the management channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Host → master: join the domain with a [`HostInfo`] body; the
    /// response carries the configuration snapshot.
    RegisterHost,
    /// Host → master: report the local outcome of applying the snapshot.
    CompleteRegistration,
    /// Either direction: liveness probe; the response carries the
    /// responder's connection id.
    Ping,
    /// Master → host: execute a transformed operation remotely.
    ExecuteOperation,
    /// Host → master: leave the domain gracefully.
    UnregisterHost,
    Unknown(i16),
}

impl From<i16> for Op {
    fn from(value: i16) -> Self {
        match value {
            0x01 => Op::RegisterHost,
            0x02 => Op::CompleteRegistration,
            0x03 => Op::Ping,
            0x04 => Op::ExecuteOperation,
            0x05 => Op::UnregisterHost,
            n => Op::Unknown(n),
        }
    }
}

impl From<Op> for i16 {
    fn from(op: Op) -> Self {
        match op {
            Op::RegisterHost => 0x01,
            Op::CompleteRegistration => 0x02,
            Op::Ping => 0x03,
            Op::ExecuteOperation => 0x04,
            Op::UnregisterHost => 0x05,
            Op::Unknown(n) => n,
        }
    }
}

impl Op {
    /// Static label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::RegisterHost => "register_host",
            Op::CompleteRegistration => "complete_registration",
            Op::Ping => "ping",
            Op::ExecuteOperation => "execute_operation",
            Op::UnregisterHost => "unregister_host",
            Op::Unknown(_) => "unknown",
        }
    }
}

/// Header of a decoded request frame.
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub op: Op,
    pub correlation_id: CorrelationId,
}

/// Local outcome a host reports for the registration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Commit,
    Rollback,
}

/// Body of a `CompleteRegistration` request.
#[derive(Debug, Clone)]
pub struct CompletionData {
    pub outcome: CompletionOutcome,
    pub message: Option<String>,
}

/// Body of an `UnregisterHost` request.
#[derive(Debug, Clone)]
pub struct UnregisterData {
    pub reason: Option<String>,
}

/// A decoded inbound request.
#[derive(Debug, Clone)]
pub enum Request {
    RegisterHost(HostInfo),
    CompleteRegistration(CompletionData),
    Ping,
    ExecuteOperation(Bytes),
    UnregisterHost(UnregisterData),
    Unknown(i16, Bytes),
}

/// A raw inbound response.
///
/// The body stays opaque here; the caller that issued the request knows
/// which shape to expect for its opcode.
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub correlation_id: CorrelationId,
    pub status: i16,
    pub body: Bytes,
}

/// A parsed management frame, request or response.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(RequestHeader, Request),
    Response(ResponseFrame),
}

impl Frame {
    /// Parse one frame payload (everything after the size prefix).
    pub fn parse(data: Bytes) -> Result<Frame> {
        let input = NomBytes::new(data.clone());
        match parse_frame(input) {
            Ok((_, frame)) => Ok(frame),
            Err(_) => Err(Error::Parse(data)),
        }
    }
}

fn parse_frame(s: NomBytes) -> IResult<NomBytes, Frame> {
    let (s, kind) = be_i8(s)?;
    match kind {
        k if k == FRAME_KIND_REQUEST => parse_request(s),
        k if k == FRAME_KIND_RESPONSE => parse_response(s),
        _ => Err(nom::Err::Failure(nom::error::Error::new(
            s,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

fn parse_request(s: NomBytes) -> IResult<NomBytes, Frame> {
    let (s, opcode) = be_i16(s)?;
    let (s, correlation_id) = be_i32(s)?;
    let op = Op::from(opcode);
    let header = RequestHeader {
        op,
        correlation_id: CorrelationId::new(correlation_id),
    };

    let (s, request) = match op {
        Op::RegisterHost => {
            let (s, info) = parse_host_info(s)?;
            (s, Request::RegisterHost(info))
        }
        Op::CompleteRegistration => {
            let (s, data) = parse_completion(s)?;
            (s, Request::CompleteRegistration(data))
        }
        Op::Ping => (s, Request::Ping),
        Op::ExecuteOperation => {
            let body = s.into_bytes();
            (NomBytes::new(Bytes::new()), Request::ExecuteOperation(body))
        }
        Op::UnregisterHost => {
            let (s, reason) = parse_nullable_string(s)?;
            let reason = bytes_to_string_opt(reason)?;
            (s, Request::UnregisterHost(UnregisterData { reason }))
        }
        Op::Unknown(n) => {
            let body = s.into_bytes();
            (NomBytes::new(Bytes::new()), Request::Unknown(n, body))
        }
    };

    Ok((s, Frame::Request(header, request)))
}

fn parse_completion(s: NomBytes) -> IResult<NomBytes, CompletionData> {
    let (s, raw) = be_i8(s)?;
    let outcome = match raw {
        0 => CompletionOutcome::Commit,
        1 => CompletionOutcome::Rollback,
        _ => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                s,
                nom::error::ErrorKind::Tag,
            )));
        }
    };
    let (s, message) = parse_nullable_string(s)?;
    let message = bytes_to_string_opt(message)?;
    Ok((s, CompletionData { outcome, message }))
}

fn parse_response(s: NomBytes) -> IResult<NomBytes, Frame> {
    let (s, correlation_id) = be_i32(s)?;
    let (s, status) = be_i16(s)?;
    let body = s.into_bytes();
    Ok((
        NomBytes::new(Bytes::new()),
        Frame::Response(ResponseFrame {
            correlation_id: CorrelationId::new(correlation_id),
            status,
            body,
        }),
    ))
}
