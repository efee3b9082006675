//! Well name parsing (`A01`, `P24`, `AF48`)

use super::types::ExperimentError;

/// Parse a well name into a zero-based `(row, col)` pair.
///
/// Rows are letters in spreadsheet order (`A`..`Z`, then `AA`, `AB`, ...);
/// columns are one-based decimal numbers, optionally zero-padded.
pub fn parse_well_name(name: &str) -> Result<(u32, u32), ExperimentError> {
    let invalid = || ExperimentError::InvalidWellName(name.to_string());

    let split = name
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (letters, digits) = name.split_at(split);
    if letters.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let mut row: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return Err(invalid());
        }
        let value = c.to_ascii_uppercase() as u32 - 'A' as u32 + 1;
        row = row
            .checked_mul(26)
            .and_then(|r| r.checked_add(value))
            .ok_or_else(invalid)?;
    }

    let col: u32 = digits.parse().map_err(|_| invalid())?;
    if col == 0 {
        return Err(invalid());
    }

    Ok((row - 1, col - 1))
}

/// Format a zero-based `(row, col)` pair as a well name with a two-digit column
pub fn format_well_name(row: u32, col: u32) -> String {
    let mut letters = Vec::new();
    let mut n = row + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    let letters: String = letters.into_iter().rev().collect();
    format!("{}{:02}", letters, col + 1)
}
