//! Broker exports carry symbols in several shapes: `XNAS:SOFI`,
//! `SOFI TECHNOLOGIES (SOFI)`, ` sofi `. Everything is reduced to the bare
//! uppercase ticker before it reaches a feed.

/// Pseudo-symbols that always price at 1.0.
pub const CASH_SYMBOLS: &[&str] = &["USD", "CAD", "USD/CAD", "CAD/USD", "CASH"];

/// Reduce a raw symbol to its ticker. Returns `None` for blank input.
///
/// A parenthesised ticker wins over everything else; an exchange prefix
/// (`XNAS:`) is dropped.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let mut s = raw.trim();

    if let Some(open) = s.find('(') {
        if let Some(close) = s[open + 1..].find(')') {
            s = &s[open + 1..open + 1 + close];
        }
    }
    if let Some((_, tail)) = s.rsplit_once(':') {
        s = tail;
    }

    let clean = s.trim().to_ascii_uppercase();
    if clean.is_empty() {
        None
    } else {
        Some(clean)
    }
}

pub fn is_cash_symbol(symbol: &str) -> bool {
    CASH_SYMBOLS.contains(&symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_exchange_prefix() {
        assert_eq!(normalize_symbol("XNAS:SOFI").as_deref(), Some("SOFI"));
        assert_eq!(normalize_symbol("xnys:nvda ").as_deref(), Some("NVDA"));
    }

    #[test]
    fn extracts_parenthesised_ticker() {
        assert_eq!(
            normalize_symbol("SOFI TECHNOLOGIES (SOFI)").as_deref(),
            Some("SOFI")
        );
        assert_eq!(normalize_symbol("Nvidia (XNAS:NVDA)").as_deref(), Some("NVDA"));
    }

    #[test]
    fn blank_is_none() {
        assert_eq!(normalize_symbol("   "), None);
        assert_eq!(normalize_symbol("()"), None);
    }

    #[test]
    fn cash_symbols_are_recognised_after_normalizing() {
        let s = normalize_symbol(" usd/cad ").unwrap();
        assert!(is_cash_symbol(&s));
        assert!(!is_cash_symbol("AAPL"));
    }
}
