//! PPTP Control Messages
//!
//! Encodes and parses the four control-connection messages the probe
//! exchanges. All integers are big-endian.
//!
//! # Common Header (12 bytes)
//!
//! ```text
//! 0      2      4             8      10     12
//! ┌──────┬──────┬─────────────┬──────┬──────┐
//! │ len  │ type │ magic cookie│ ctrl │ rsvd │
//! └──────┴──────┴─────────────┴──────┴──────┘
//! ```
//!
//! `type` is 1 (control message). `ctrl` selects the message below.

use crate::error::ProbeError;

/// Magic cookie carried by every control message
pub const MAGIC_COOKIE: u32 = 0x1A2B_3C4D;

/// PPTP message type for control messages
pub const MESSAGE_TYPE_CONTROL: u16 = 1;

/// Protocol version 1.0
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Control message types
pub const CTRL_START_CONTROL_REQUEST: u16 = 1;
pub const CTRL_START_CONTROL_REPLY: u16 = 2;
pub const CTRL_OUTGOING_CALL_REQUEST: u16 = 7;
pub const CTRL_OUTGOING_CALL_REPLY: u16 = 8;

/// Fixed message sizes
pub const START_CONTROL_LEN: usize = 156;
pub const OUTGOING_CALL_REQUEST_LEN: usize = 168;
pub const OUTGOING_CALL_REPLY_LEN: usize = 32;

/// Width of padded string fields
pub const STRING_FIELD_LEN: usize = 64;

/// Upper bound on any message we are willing to read
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Offset of the result code in a Start-Control-Connection-Reply
const START_REPLY_RESULT_OFFSET: usize = 14;

/// Offset of the result code in an Outgoing-Call-Reply
const CALL_REPLY_RESULT_OFFSET: usize = 16;

/// Asynchronous + synchronous framing
const FRAMING_CAPABILITIES: u32 = 0x0000_0003;

/// Analog + digital bearer
const BEARER_CAPABILITIES: u32 = 0x0000_0003;

/// Call-reply result codes treated as an established call
///
/// Codes 2..=5 nominally report a failure (general error, no carrier, busy,
/// no dial tone), yet servers answering with them have a working PPTP
/// stack. This over-accepts on purpose and is not an authentication
/// verdict.
pub const ACCEPTED_CALL_RESULTS: std::ops::RangeInclusive<u8> = 0..=5;

/// Check whether an Outgoing-Call-Reply result code counts as success
pub fn is_call_established(result_code: u8) -> bool {
    ACCEPTED_CALL_RESULTS.contains(&result_code)
}

/// Start-Control-Connection-Request
#[derive(Debug, Clone)]
pub struct StartControlRequest {
    pub max_channels: u16,
    pub firmware_revision: u16,
    pub host_name: String,
    pub vendor_name: String,
}

impl Default for StartControlRequest {
    fn default() -> Self {
        Self {
            max_channels: 1,
            firmware_revision: 1,
            host_name: "pfleet".to_string(),
            vendor_name: "pfleet".to_string(),
        }
    }
}

impl StartControlRequest {
    /// Encode to the 156-byte wire format
    ///
    /// Layout after the common header:
    /// - Protocol version (2)
    /// - Reserved (2)
    /// - Framing capabilities (4)
    /// - Bearer capabilities (4)
    /// - Maximum channels (2)
    /// - Firmware revision (2)
    /// - Host name (64)
    /// - Vendor name (64)
    pub fn encode(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(START_CONTROL_LEN);
        put_header(&mut msg, START_CONTROL_LEN as u16, CTRL_START_CONTROL_REQUEST);

        msg.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        msg.extend_from_slice(&[0x00, 0x00]);
        msg.extend_from_slice(&FRAMING_CAPABILITIES.to_be_bytes());
        msg.extend_from_slice(&BEARER_CAPABILITIES.to_be_bytes());
        msg.extend_from_slice(&self.max_channels.to_be_bytes());
        msg.extend_from_slice(&self.firmware_revision.to_be_bytes());
        put_padded(&mut msg, &self.host_name);
        put_padded(&mut msg, &self.vendor_name);

        debug_assert_eq!(msg.len(), START_CONTROL_LEN);
        msg
    }
}

/// Parsed Start-Control-Connection-Reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartControlReply {
    pub protocol_version: u16,
    pub result_code: u8,
    pub error_code: u8,
}

impl StartControlReply {
    /// Result code 1 means the control connection was opened
    pub fn is_success(&self) -> bool {
        self.result_code == 1
    }

    /// Parse a complete message (header included)
    pub fn parse(msg: &[u8]) -> Result<Self, ProbeError> {
        check_header(msg, CTRL_START_CONTROL_REPLY)?;
        require_len(msg, START_REPLY_RESULT_OFFSET + 2)?;

        Ok(Self {
            protocol_version: be_u16(msg, 12),
            result_code: msg[START_REPLY_RESULT_OFFSET],
            error_code: msg[START_REPLY_RESULT_OFFSET + 1],
        })
    }
}

/// Outgoing-Call-Request
///
/// The login is placed in the phone-number field; servers that route
/// calls by it reject unknown values, which makes it a cheap credential
/// probe short of full PPP authentication.
#[derive(Debug, Clone)]
pub struct OutgoingCallRequest {
    pub call_id: u16,
    pub call_serial: u16,
    pub min_bps: u32,
    pub max_bps: u32,
    pub bearer_type: u32,
    pub framing_type: u32,
    pub recv_window: u16,
    pub phone_number: String,
}

impl OutgoingCallRequest {
    /// Request carrying `login` as the phone number
    pub fn for_login(call_id: u16, login: &str) -> Self {
        Self {
            call_id,
            call_serial: call_id,
            min_bps: 2_400,
            max_bps: 10_000_000,
            bearer_type: BEARER_CAPABILITIES,
            framing_type: FRAMING_CAPABILITIES,
            recv_window: 64,
            phone_number: login.to_string(),
        }
    }

    /// Encode to the 168-byte wire format
    ///
    /// Layout after the common header:
    /// - Call ID (2), call serial number (2)
    /// - Minimum BPS (4), maximum BPS (4)
    /// - Bearer type (4), framing type (4)
    /// - Receive window (2), processing delay (2)
    /// - Phone number length (2), reserved (2)
    /// - Phone number (64), subaddress (64)
    pub fn encode(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(OUTGOING_CALL_REQUEST_LEN);
        put_header(
            &mut msg,
            OUTGOING_CALL_REQUEST_LEN as u16,
            CTRL_OUTGOING_CALL_REQUEST,
        );

        msg.extend_from_slice(&self.call_id.to_be_bytes());
        msg.extend_from_slice(&self.call_serial.to_be_bytes());
        msg.extend_from_slice(&self.min_bps.to_be_bytes());
        msg.extend_from_slice(&self.max_bps.to_be_bytes());
        msg.extend_from_slice(&self.bearer_type.to_be_bytes());
        msg.extend_from_slice(&self.framing_type.to_be_bytes());
        msg.extend_from_slice(&self.recv_window.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());

        let phone_len = self.phone_number.len().min(STRING_FIELD_LEN) as u16;
        msg.extend_from_slice(&phone_len.to_be_bytes());
        msg.extend_from_slice(&[0x00, 0x00]);
        put_padded(&mut msg, &self.phone_number);
        put_padded(&mut msg, "");

        debug_assert_eq!(msg.len(), OUTGOING_CALL_REQUEST_LEN);
        msg
    }
}

/// Parsed Outgoing-Call-Reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingCallReply {
    pub call_id: u16,
    pub peer_call_id: u16,
    pub result_code: u8,
    pub error_code: u8,
}

impl OutgoingCallReply {
    /// See [`ACCEPTED_CALL_RESULTS`]
    pub fn is_established(&self) -> bool {
        is_call_established(self.result_code)
    }

    /// Parse a complete message (header included)
    pub fn parse(msg: &[u8]) -> Result<Self, ProbeError> {
        check_header(msg, CTRL_OUTGOING_CALL_REPLY)?;
        require_len(msg, CALL_REPLY_RESULT_OFFSET + 2)?;

        Ok(Self {
            call_id: be_u16(msg, 12),
            peer_call_id: be_u16(msg, 14),
            result_code: msg[CALL_REPLY_RESULT_OFFSET],
            error_code: msg[CALL_REPLY_RESULT_OFFSET + 1],
        })
    }
}

fn put_header(msg: &mut Vec<u8>, len: u16, ctrl_type: u16) {
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(&MESSAGE_TYPE_CONTROL.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(&ctrl_type.to_be_bytes());
    msg.extend_from_slice(&[0x00, 0x00]);
}

/// Write `value` into a zero-padded 64-byte field (truncated if longer)
fn put_padded(msg: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(STRING_FIELD_LEN);
    msg.extend_from_slice(&bytes[..n]);
    msg.resize(msg.len() + (STRING_FIELD_LEN - n), 0);
}

fn be_u16(msg: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([msg[at], msg[at + 1]])
}

fn be_u32(msg: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([msg[at], msg[at + 1], msg[at + 2], msg[at + 3]])
}

fn require_len(msg: &[u8], needed: usize) -> Result<(), ProbeError> {
    if msg.len() < needed {
        return Err(ProbeError::ShortResponse {
            expected: needed,
            got: msg.len(),
        });
    }
    Ok(())
}

/// Validate the common header: cookie first, then control type
fn check_header(msg: &[u8], expected_ctrl: u16) -> Result<(), ProbeError> {
    require_len(msg, 12)?;

    let cookie = be_u32(msg, 4);
    if cookie != MAGIC_COOKIE {
        return Err(ProbeError::BadMagicCookie(cookie));
    }

    let ctrl = be_u16(msg, 8);
    if ctrl != expected_ctrl {
        return Err(ProbeError::WrongMessageType {
            expected: expected_ctrl,
            found: ctrl,
        });
    }

    Ok(())
}

/// Build a Start-Control-Connection-Reply (used by synthetic servers)
pub fn encode_start_control_reply(result_code: u8) -> Vec<u8> {
    let mut msg = Vec::with_capacity(START_CONTROL_LEN);
    put_header(&mut msg, START_CONTROL_LEN as u16, CTRL_START_CONTROL_REPLY);
    msg.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    msg.push(result_code);
    msg.push(0);
    msg.extend_from_slice(&FRAMING_CAPABILITIES.to_be_bytes());
    msg.extend_from_slice(&BEARER_CAPABILITIES.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    put_padded(&mut msg, "server");
    put_padded(&mut msg, "vendor");
    msg
}

/// Build an Outgoing-Call-Reply (used by synthetic servers)
pub fn encode_outgoing_call_reply(peer_call_id: u16, result_code: u8) -> Vec<u8> {
    let mut msg = Vec::with_capacity(OUTGOING_CALL_REPLY_LEN);
    put_header(
        &mut msg,
        OUTGOING_CALL_REPLY_LEN as u16,
        CTRL_OUTGOING_CALL_REPLY,
    );
    msg.extend_from_slice(&0x0042u16.to_be_bytes());
    msg.extend_from_slice(&peer_call_id.to_be_bytes());
    msg.push(result_code);
    msg.push(0);
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&10_000_000u32.to_be_bytes());
    msg.extend_from_slice(&64u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&0u32.to_be_bytes());
    msg
}
