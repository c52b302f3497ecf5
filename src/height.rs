//!
//! Height extraction from ledger operation results.
//!
//! Ledger calls return loosely-typed payloads. Older nodes report the committed height as a flat
//! `height` field, newer ones nest it under a `header` object. Both shapes are accepted here so
//! that callers never have to care which generation of the protocol answered them.

use serde_json::Value;

/// Ledger progress marker. Heights from different ledgers are never compared.
pub type Height = u64;

/// A value returned by a ledger call that may carry the height it was committed at.
pub trait OperationResult {
	/// The height this result was committed at, or `None` when the result carries none.
	///
	/// `None` and `Some(0)` are different answers: the former means "no height present".
	fn height(&self) -> Option<Height>;
}

impl OperationResult for Value {
	fn height(&self) -> Option<Height> {
		extract_height(self)
	}
}

impl<T: OperationResult> OperationResult for Option<T> {
	fn height(&self) -> Option<Height> {
		self.as_ref().and_then(OperationResult::height)
	}
}

/// Extract the committed height from a raw operation result.
///
/// The flat `height` field takes precedence over `header.height` when both are present.
pub fn extract_height(result: &Value) -> Option<Height> {
	result
		.get("height")
		.and_then(height_value)
		.or_else(|| {
			result
				.get("header")
				.and_then(|header| header.get("height"))
				.and_then(height_value)
		})
}

/// Read a height encoded either as a JSON number or as a decimal string.
pub(crate) fn height_value(value: &Value) -> Option<Height> {
	match value {
		Value::Number(n) => n.as_u64(),
		Value::String(s) => s.trim().parse::<Height>().ok(),
		_ => None,
	}
}
