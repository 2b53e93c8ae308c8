//! Correlation-code generation.
//!
//! Two identifier strategies live here: a short random key drawn from a
//! mode-masked alphabet, and a random v4 UUID kept for callers that still
//! expect the longer form.

use rand::Rng;

/// Include ASCII digits in the key alphabet.
pub const DIGITS: u8 = 0b001;
/// Include uppercase ASCII letters in the key alphabet.
pub const UPPERCASE: u8 = 0b010;
/// Include lowercase ASCII letters in the key alphabet.
pub const LOWERCASE: u8 = 0b100;
/// All three pools.
pub const ALL: u8 = DIGITS | UPPERCASE | LOWERCASE;

/// Length of the short correlation codes minted by the middleware.
pub(crate) const CODE_LEN: usize = 8;

/// Generate a random key of `length` characters from the pools selected by
/// `mode` (bit 0: digits, bit 1: uppercase, bit 2: lowercase).
///
/// Each character is drawn uniformly from the concatenated pool, so a larger
/// pool contributes proportionally more characters. Returns `None` when
/// `mode` selects no pool, sets bits beyond the three known ones, or
/// `length` is zero.
pub fn generate_random_key(length: usize, mode: u8) -> Option<String> {
    if mode == 0 || mode > ALL || length == 0 {
        return None;
    }
    let digits_end = if mode & DIGITS != 0 { 10u32 } else { 0 };
    let upper_end = digits_end + if mode & UPPERCASE != 0 { 26 } else { 0 };
    let lower_end = upper_end + if mode & LOWERCASE != 0 { 26 } else { 0 };

    let mut rng = rand::thread_rng();
    let mut key = String::with_capacity(length);
    for _ in 0..length {
        let n = rng.gen_range(0..lower_end);
        let c = if n < digits_end {
            b'0' + n as u8
        } else if n < upper_end {
            b'A' + (n - digits_end) as u8
        } else {
            b'a' + (n - upper_end) as u8
        };
        key.push(c as char);
    }
    Some(key)
}

/// Random v4 UUID as a hyphenated string.
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
