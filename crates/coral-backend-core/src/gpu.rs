// SPDX-License-Identifier: MIT OR Apache-2.0
//! GPU demand parsing shared by drivers.

use coral_error::CoralError;

/// Parse a GPU demand string into `(type, count)`.
///
/// `"A100:2"` → `("A100", 2)`; a bare `"A100"` means one device.
///
/// # Errors
///
/// Returns an executor-kind [`CoralError`] for malformed or zero counts
/// and for an empty type.
pub fn parse_gpu(gpu: &str) -> Result<(String, u32), CoralError> {
    let (name, count) = match gpu.split_once(':') {
        Some((name, count)) => {
            let count: u32 = count.parse().map_err(|_| {
                CoralError::executor(format!("invalid GPU count in '{gpu}'"))
            })?;
            (name, count)
        }
        None => (gpu, 1),
    };
    if name.is_empty() {
        return Err(CoralError::executor(format!("invalid GPU spec '{gpu}'")));
    }
    if count == 0 {
        return Err(CoralError::executor(format!(
            "GPU count must be positive in '{gpu}'"
        )));
    }
    Ok((name.to_string(), count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_and_count() {
        assert_eq!(parse_gpu("A100:2").unwrap(), ("A100".to_string(), 2));
    }

    #[test]
    fn bare_type_defaults_to_one() {
        assert_eq!(parse_gpu("A100").unwrap(), ("A100".to_string(), 1));
    }

    #[test]
    fn malformed_counts_are_rejected() {
        assert!(parse_gpu("A100:two").is_err());
        assert!(parse_gpu("A100:").is_err());
        assert!(parse_gpu("A100:0").is_err());
        assert!(parse_gpu(":2").is_err());
    }
}
