use num_bigint::BigUint;

/// Encode a field element as 0x-prefixed lowercase hex, as stored in the leaf store.
pub fn field_to_hex(value: &BigUint) -> String {
	format!("0x{}", value.to_str_radix(16))
}

/// Parse 0x-prefixed (or bare) hex into a field element.
pub fn field_from_hex(value: &str) -> Result<BigUint, String> {
	let digits = value.strip_prefix("0x").unwrap_or(value);
	if digits.is_empty() {
		return Ok(BigUint::default());
	}
	BigUint::parse_bytes(digits.as_bytes(), 16).ok_or_else(|| format!("invalid hex value: {value}"))
}

/// Parse a JSON-RPC quantity such as `0x1a`.
pub fn parse_hex_u64(value: &str) -> Result<u64, String> {
	let digits = value.strip_prefix("0x").unwrap_or(value);
	u64::from_str_radix(digits, 16).map_err(|e| format!("invalid quantity {value}: {e}"))
}

/// Shorten a field element for log output.
pub fn format_field(value: &BigUint) -> String {
	let hex = value.to_str_radix(16);
	if hex.len() <= 12 {
		format!("0x{hex}")
	} else {
		format!("0x{}..{}", &hex[..6], &hex[hex.len() - 4..])
	}
}
