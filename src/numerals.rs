//! Numeral normalization for handwritten registers.
//!
//! Register sheets mix Bengali (০–৯) and ASCII digits freely, sometimes within
//! one cell. Everything downstream works on ASCII digits only.

/// First code point of the Bengali digit block (০).
const BENGALI_ZERO: u32 = 0x09E6;

/// Map Bengali digits to ASCII digits; all other characters pass through unchanged.
pub fn to_canonical_digits(text: &str) -> String {
    text.chars().map(canonical_digit).collect()
}

fn canonical_digit(c: char) -> char {
    match c {
        '\u{09E6}'..='\u{09EF}' => {
            let offset = c as u32 - BENGALI_ZERO;
            char::from_digit(offset, 10).unwrap_or(c)
        }
        _ => c,
    }
}

/// Canonical roll number: normalized, digits only, left-padded to two characters.
///
/// Performs no range check. An input with no digits at all yields `"00"`, which
/// roll-number validation rejects.
pub fn format_roll_number(raw: &str) -> String {
    let digits: String = to_canonical_digits(raw)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    format!("{:0>2}", digits)
}
