use crate::error::CanneryError;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Parse a `WIDTHxHEIGHT` view size such as `"1440x900"`.
pub fn parse_view_size(s: &str) -> Result<(u32, u32), CanneryError> {
    let s = s.trim();
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| CanneryError::Validation {
            message: format!("view size must look like 1440x900 (got '{s}')"),
        })?;

    let parse = |part: &str| -> Result<u32, CanneryError> {
        match part.trim().parse::<u32>() {
            Ok(0) | Err(_) => Err(CanneryError::Validation {
                message: format!("invalid view size dimension: '{part}'"),
            }),
            Ok(v) => Ok(v),
        }
    };

    Ok((parse(w)?, parse(h)?))
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
