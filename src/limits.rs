//! # Fixed Ceilings
//!
//! Every line written to or read from a table is checked against these
//! limits. They are the mandatory floor of the file format: a file that
//! stays within them can be read by any conforming implementation.

/// The only file format version this engine reads and writes.
pub const FORMAT_VERSION: u64 = 1;

/// Maximum byte length of a key's compact JSON serialization.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Maximum byte length of one line, excluding the trailing newline.
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Maximum JSON nesting depth of a line. The top-level object counts as 1.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Maximum number of elements in a tuple key (and fields in a tuple specifier).
pub const MAX_TUPLE_ELEMENTS: usize = 16;

/// Largest integer that survives a round trip through an IEEE-754 double,
/// `2^53 - 1`. Integer keys must lie within `±MAX_SAFE_INTEGER`.
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;

// Limit names carried by `Error::LimitExceeded`.
pub const LIMIT_KEY_LENGTH: &str = "key_length";
pub const LIMIT_RECORD_SIZE: &str = "record_size";
pub const LIMIT_TUPLE_ELEMENTS: &str = "tuple_elements";
pub const LIMIT_NESTING_DEPTH: &str = "nesting_depth";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_integer_is_two_pow_53_minus_one() {
        assert_eq!(MAX_SAFE_INTEGER, (1i64 << 53) - 1);
    }

    #[test]
    fn test_record_size_is_one_mebibyte() {
        assert_eq!(MAX_RECORD_SIZE, 1_048_576);
    }
}
