// =============================================================================
// ISIN validation and aggregation group keys
// =============================================================================
//
// An ISIN is 12 characters: a 2-letter country code, 9 alphanumerics, and a
// numeric check digit. We validate the format only; the Luhn check digit is
// provider territory and rejecting on it would drop otherwise usable rows.
// =============================================================================

use sha2::{Digest, Sha256};

/// Canonical group id for cash-like constituents so cash aggregates across
/// every parent ETF instead of fragmenting per provider.
pub const CASH_GROUP_ID: &str = "CASH_USD";
pub const CASH_GROUP_NAME: &str = "Cash & Equivalents";

/// Check a candidate string against the ISO 6166 format
/// `[A-Z]{2}[A-Z0-9]{9}[0-9]`.
pub fn is_valid_isin(candidate: &str) -> bool {
    let bytes = candidate.as_bytes();
    if bytes.len() != 12 {
        return false;
    }
    if !bytes[..2].iter().all(|b| b.is_ascii_uppercase()) {
        return false;
    }
    if !bytes[2..11]
        .iter()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
    {
        return false;
    }
    bytes[11].is_ascii_digit()
}

/// Normalize a raw ISIN-ish value: trim, uppercase, and return it only when
/// it passes the format check.
pub fn normalize_isin(raw: &str) -> Option<String> {
    let cleaned = raw.trim().to_uppercase();
    match cleaned.as_str() {
        "" | "NAN" | "NONE" | "N/A" | "-" => return None,
        _ => {}
    }
    if is_valid_isin(&cleaned) {
        Some(cleaned)
    } else {
        None
    }
}

/// Deterministic aggregation key for a holding without a valid ISIN.
///
/// The same (ticker, name) pair across different ETFs must collapse into one
/// exposure row, so the key is derived from a stable hash rather than any
/// per-run state: `UNRESOLVED:{ticker}:{hash10}` where `hash10` is the first
/// 10 decimal digits of SHA-256("{ticker}|{name}").
pub fn unresolved_group_key(ticker: &str, name: &str) -> String {
    let ticker = ticker.trim();
    let name = name.trim();
    let digest = Sha256::digest(format!("{ticker}|{name}").as_bytes());
    let hash10: String = hex::encode(digest)
        .bytes()
        .filter(|b| b.is_ascii_digit())
        .take(10)
        .map(char::from)
        .collect();
    format!("UNRESOLVED:{ticker}:{hash10:0<10}")
}

/// Group id for aggregation: the ISIN when valid, otherwise the
/// deterministic unresolved key.
pub fn group_id(isin: Option<&str>, ticker: &str, name: &str) -> String {
    match isin {
        Some(i) if is_valid_isin(i) => i.to_string(),
        _ => unresolved_group_key(ticker, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_isins() {
        assert!(is_valid_isin("US0378331005"));
        assert!(is_valid_isin("IE00B4L5Y983"));
        assert!(is_valid_isin("DE0007164600"));
    }

    #[test]
    fn rejects_malformed_isins() {
        assert!(!is_valid_isin(""));
        assert!(!is_valid_isin("US037833100")); // 11 chars
        assert!(!is_valid_isin("US03783310055")); // 13 chars
        assert!(!is_valid_isin("us0378331005")); // lowercase country
        assert!(!is_valid_isin("U10378331005")); // digit in country code
        assert!(!is_valid_isin("US037833100X")); // non-digit check position
    }

    #[test]
    fn normalize_trims_and_uppercases() {
        assert_eq!(
            normalize_isin("  us0378331005 "),
            Some("US0378331005".to_string())
        );
        assert_eq!(normalize_isin("nan"), None);
        assert_eq!(normalize_isin("-"), None);
        assert_eq!(normalize_isin("not an isin"), None);
    }

    #[test]
    fn group_key_is_deterministic_across_calls() {
        let a = unresolved_group_key("XYZ", "XYZ Corp");
        let b = unresolved_group_key("XYZ", "XYZ Corp");
        assert_eq!(a, b);
        assert!(a.starts_with("UNRESOLVED:XYZ:"));
        // 10 digit suffix
        let suffix = a.rsplit(':').next().unwrap();
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn group_key_differs_per_ticker() {
        assert_ne!(
            unresolved_group_key("XYZ", "XYZ Corp"),
            unresolved_group_key("ABC", "XYZ Corp")
        );
    }

    #[test]
    fn group_id_prefers_valid_isin() {
        assert_eq!(
            group_id(Some("US0378331005"), "AAPL", "Apple"),
            "US0378331005"
        );
        assert!(group_id(Some("bogus"), "AAPL", "Apple").starts_with("UNRESOLVED:AAPL:"));
        assert!(group_id(None, "AAPL", "Apple").starts_with("UNRESOLVED:AAPL:"));
    }
}
