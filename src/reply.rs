//! Dashboard reply parsing
//!
//! Replies look like `ErrorID,{values},Command(...);`. The status code and the
//! brace-delimited values are read structurally; the echoed command is ignored
//! so numbers inside it never leak into the result. Replies without that
//! shape fall back to every signed integer in the text, in order.

use crate::snapshot::CommandId;
use crate::{DobotError, Result};

/// Substring the controller sends when it is not in TCP control mode
pub const WRONG_CONTROL_MODE_MARKER: &str = "Not Tcp";

/// A parsed reply that carried at least a status code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    /// Status code; negative means the controller refused the command
    pub code: i64,
    /// Every extracted integer, starting with the status code
    pub values: Vec<i64>,
    pub raw: String,
}

impl CommandAck {
    pub fn is_rejected(&self) -> bool {
        self.code < 0
    }

    /// Fail with [`DobotError::Rejected`] on a negative status code
    pub fn into_accepted(self) -> Result<Self> {
        if self.is_rejected() {
            return Err(DobotError::Rejected {
                code: self.code,
                reply: self.raw,
            });
        }
        Ok(self)
    }

    /// The id the controller assigned, which follows the status code
    pub fn command_id(&self) -> Result<CommandId> {
        let value = self
            .values
            .get(1)
            .copied()
            .ok_or_else(|| DobotError::Protocol(format!("Reply carries no command id: {}", self.raw)))?;

        CommandId::try_from(value)
            .map_err(|_| DobotError::Protocol(format!("Negative command id {} in reply: {}", value, self.raw)))
    }
}

/// Parse one dashboard reply
pub fn parse_reply(text: &str) -> Result<CommandAck> {
    if text.contains(WRONG_CONTROL_MODE_MARKER) {
        return Err(DobotError::WrongControlMode {
            reply: text.trim().to_string(),
        });
    }

    let values = match split_structured(text) {
        Some((code, braced)) => {
            let mut values = vec![code];
            values.extend(extract_integers(braced));
            values
        }
        None => extract_integers(text),
    };

    match values.first() {
        Some(&code) => Ok(CommandAck {
            code,
            values,
            raw: text.trim().to_string(),
        }),
        None => Err(DobotError::EmptyReply {
            reply: text.trim().to_string(),
        }),
    }
}

/// Split `code,{values},...` into the code and the brace contents
fn split_structured(text: &str) -> Option<(i64, &str)> {
    let (code, rest) = text.trim().split_once(',')?;
    let code = code.trim().parse::<i64>().ok()?;
    let rest = rest.trim_start().strip_prefix('{')?;
    let end = rest.find('}')?;
    Some((code, &rest[..end]))
}

/// Every maximal run of digits, with a directly preceding `-` taken as sign
pub fn extract_integers(text: &str) -> Vec<i64> {
    let bytes = text.as_bytes();
    let mut values = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }

        let negative = i > 0 && bytes[i - 1] == b'-';
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }

        // Runs too long for i64 are not ids or codes; skip them
        if let Ok(magnitude) = text[start..i].parse::<i64>() {
            values.push(if negative { -magnitude } else { magnitude });
        }
    }

    values
}

/// Floats inside the braces of a structured reply, e.g. `GetPose()`
pub fn parse_float_values(text: &str) -> Result<Vec<f64>> {
    let ack = parse_reply(text)?.into_accepted()?;
    let (_, braced) = split_structured(text)
        .ok_or_else(|| DobotError::Protocol(format!("Reply has no value list: {}", ack.raw)))?;

    braced
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| DobotError::Protocol(format!("Bad number '{}' in reply: {}", token, ack.raw)))
        })
        .collect()
}
