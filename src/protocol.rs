//! Result wire format between a sandboxed script and the host.
//!
//! # Format (version 1)
//!
//! ```text
//! output  := *( any-text ) marker *( any-text )
//! marker  := "<<<RESULT_START>>>" payload "<<<RESULT_END>>>"
//! payload := JSON object whose values are finite numbers (no nesting)
//! ```
//!
//! Exactly one marker must appear in the captured stdout. The script side
//! of the contract is the `sandbox_result` helper module written next to
//! every script ([`EMITTER_SOURCE`]).

use std::collections::BTreeMap;

use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;

pub const RESULT_START: &str = "<<<RESULT_START>>>";
pub const RESULT_END: &str = "<<<RESULT_END>>>";

/// Decoded outcome of a script: metric name to value.
pub type Signal = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("no result emitted")]
    Missing,
    #[error("result emitted {0} times; exactly one is allowed")]
    Multiple(usize),
    #[error("result marker is not terminated")]
    Unterminated,
    #[error("result payload is malformed: {0}")]
    Malformed(String),
    #[error("result value for `{0}` is not a number")]
    NonNumeric(String),
    #[error("result value for `{0}` is not finite")]
    NonFinite(String),
}

/// Payload slices of every complete marker in `output`, in order.
fn frames(output: &str) -> Result<Vec<&str>, DecodeError> {
    let mut frames = Vec::new();
    let mut rest = output;
    while let Some(start) = rest.find(RESULT_START) {
        let after = &rest[start + RESULT_START.len()..];
        let Some(end) = after.find(RESULT_END) else {
            return Err(DecodeError::Unterminated);
        };
        let payload = &after[..end];
        if payload.contains(RESULT_START) {
            return Err(DecodeError::Unterminated);
        }
        frames.push(payload);
        rest = &after[end + RESULT_END.len()..];
    }
    Ok(frames)
}

fn parse_payload(payload: &str) -> Result<Signal, DecodeError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(DecodeError::Malformed("expected a JSON object".to_string()));
    };

    let mut signal = Signal::new();
    for (key, value) in map {
        let Some(number) = value.as_f64() else {
            return Err(DecodeError::NonNumeric(key));
        };
        if !number.is_finite() {
            return Err(DecodeError::NonFinite(key));
        }
        signal.insert(key, number);
    }
    Ok(signal)
}

/// Decode the single result marker in `output`.
pub fn decode(output: &str) -> Result<Signal, DecodeError> {
    let frames = frames(output)?;
    match frames.as_slice() {
        [] => Err(DecodeError::Missing),
        [payload] => parse_payload(payload),
        many => Err(DecodeError::Multiple(many.len())),
    }
}

/// Producer side of the format; rejects values `decode` would reject.
pub fn encode(signal: &Signal) -> Result<String, DecodeError> {
    if let Some((key, _)) = signal.iter().find(|(_, v)| !v.is_finite()) {
        return Err(DecodeError::NonFinite(key.clone()));
    }
    let payload =
        serde_json::to_string(signal).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    Ok(format!("{}{}{}", RESULT_START, payload, RESULT_END))
}

/// File name of the emitter helper inside the code directory.
pub const EMITTER_FILENAME: &str = "sandbox_result.py";

/// Environment variable naming the parameters file for `params()`.
pub const PARAMS_ENV: &str = "SANDBOX_PARAMS";

/// In-container emitter: `emit(signal)` writes one marker, `params()`
/// loads the request parameters.
pub const EMITTER_SOURCE: &str = r#"import json
import math
import numbers
import os
import sys

_START = "<<<RESULT_START>>>"
_END = "<<<RESULT_END>>>"
_emitted = False


def params():
    path = os.environ.get("SANDBOX_PARAMS", "/sandbox/params.json")
    with open(path) as fh:
        return json.load(fh)


def emit(signal):
    global _emitted
    if _emitted:
        raise RuntimeError("result already emitted")
    if not isinstance(signal, dict):
        raise TypeError("signal must be a dict of numbers")
    clean = {}
    for key, value in signal.items():
        if not isinstance(key, str):
            raise TypeError("signal keys must be strings")
        if isinstance(value, bool) or not isinstance(value, numbers.Real):
            raise TypeError("signal value for %r is not a number" % key)
        value = float(value)
        if not math.isfinite(value):
            raise ValueError("signal value for %r is not finite" % key)
        clean[key] = value
    payload = json.dumps(clean, separators=(",", ":"), sort_keys=True, allow_nan=False)
    sys.stdout.write(_START + payload + _END + "\n")
    sys.stdout.flush()
    _emitted = True
"#;
