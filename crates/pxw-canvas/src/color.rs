use pxw_core::{PxwError, PxwResult};

/// Render a decrypted value as `#RRGGBB` (low 24 bits, upper case).
pub fn format_color(value: u64) -> String {
    format!("#{:06X}", value & 0xFF_FFFF)
}

/// Parse `#RRGGBB` (the `#` is optional) into its 24-bit value.
pub fn parse_color(s: &str) -> PxwResult<u32> {
    let hex = s.trim().trim_start_matches('#');
    if hex.is_empty() || hex.len() > 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PxwError::InvalidColor(s.to_string()));
    }
    u32::from_str_radix(hex, 16).map_err(|_| PxwError::InvalidColor(s.to_string()))
}
