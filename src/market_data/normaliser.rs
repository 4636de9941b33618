// Convert the many wire/UI spellings of an instrument into one cache key.
// "EUR/USD (OTC)", "eurusd_otc", "EURUSD-OTC" all end up as "eurusd_otc".

use std::collections::HashSet;

use crate::market_data::types::InstrumentKey;

pub const OTC_SUFFIX: &str = "_otc";
const OTC_MARKER: &str = "otc";

/// Canonical key for any spelling. Total and pure: garbage in gives a
/// (possibly empty) key out, never a panic.
pub fn normalize(raw: &str) -> InstrumentKey {
    let (base, otc) = split_otc(raw);
    let key = if otc { format!("{base}{OTC_SUFFIX}") } else { base };
    InstrumentKey::from_canonical(key)
}

/// Canonical symbol without the OTC marker, used to compare what the chart
/// shows against what was requested.
pub fn base_symbol(raw: &str) -> String {
    split_otc(raw).0
}

pub fn is_otc(raw: &str) -> bool {
    split_otc(raw).1
}

/// Every lookup spelling worth trying for `raw`, most specific first.
/// Over-generates on purpose; a wrong hit only means compatible stale data.
pub fn variants(raw: &str) -> Vec<String> {
    let mut out = Variants::default();
    let trimmed = raw.trim();
    out.push(trimmed.to_string());
    out.push(trimmed.to_lowercase());
    out.push(trimmed.to_uppercase());

    let key = normalize(trimmed);
    out.push(key.as_str().to_string());

    let (base, otc) = split_otc(trimmed);
    if base.is_empty() {
        return out.finish();
    }

    let plain = plain_spellings(&base);
    let with_otc = otc_spellings(&base);
    if otc {
        out.extend(with_otc);
        out.extend(plain);
    } else {
        out.extend(plain);
        out.extend(with_otc);
    }

    // Trimmed raw with only the marker removed keeps whatever separator the
    // caller used ("EUR/USD (OTC)" -> "EUR/USD").
    let stripped = strip_otc_text(trimmed);
    out.push(stripped.clone());
    out.push(stripped.to_lowercase());
    out.push(stripped.replace(' ', ""));
    out.finish()
}

fn split_otc(raw: &str) -> (String, bool) {
    let compact: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    match compact.strip_suffix(OTC_MARKER) {
        Some(base) if !base.is_empty() => (base.to_string(), true),
        _ => (compact, false),
    }
}

/// Display spelling with the OTC marker cut out ("USD/BRL (OTC)" -> "USD/BRL"),
/// what a broker search box expects.
pub fn strip_otc_text(raw: &str) -> String {
    // byte offsets below are only valid when lowercasing keeps lengths
    if !raw.is_ascii() {
        return raw.to_string();
    }
    let lower = raw.to_ascii_lowercase();
    for marker in ["(otc)", "_otc", "-otc", " otc", ".otc"] {
        if let Some(pos) = lower.rfind(marker) {
            let mut s = String::with_capacity(raw.len());
            s.push_str(&raw[..pos]);
            s.push_str(&raw[pos + marker.len()..]);
            return s.trim().to_string();
        }
    }
    raw.to_string()
}

// Six-letter currency pairs get separator spellings too.
fn pair_halves(base: &str) -> Option<(&str, &str)> {
    if base.len() == 6 && base.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(base.split_at(3))
    } else {
        None
    }
}

fn plain_spellings(base: &str) -> Vec<String> {
    let upper = base.to_uppercase();
    let mut v = vec![base.to_string(), upper.clone()];
    if let Some((b, q)) = pair_halves(base) {
        let (bu, qu) = (b.to_uppercase(), q.to_uppercase());
        for sep in ["/", "_", "-", " "] {
            v.push(format!("{bu}{sep}{qu}"));
            v.push(format!("{b}{sep}{q}"));
        }
    }
    v.push(format!("#{upper}"));
    v
}

fn otc_spellings(base: &str) -> Vec<String> {
    let upper = base.to_uppercase();
    let mut v = vec![
        format!("{base}_otc"),
        format!("{upper}_otc"),
        format!("{upper}_OTC"),
        format!("{base}-otc"),
        format!("{upper}-OTC"),
        format!("{base}otc"),
        format!("{upper} (OTC)"),
        format!("#{upper}_otc"),
    ];
    if let Some((b, q)) = pair_halves(base) {
        let (bu, qu) = (b.to_uppercase(), q.to_uppercase());
        v.push(format!("{bu}/{qu} (OTC)"));
        v.push(format!("{b}/{q} (otc)"));
        v.push(format!("{bu}/{qu}_otc"));
        v.push(format!("{b}/{q}_otc"));
        v.push(format!("{b}_{q}_otc"));
        v.push(format!("{bu}_{qu}_otc"));
        v.push(format!("{bu}_{qu}_OTC"));
        v.push(format!("{b}-{q}-otc"));
    }
    v
}

#[derive(Default)]
struct Variants {
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl Variants {
    fn push(&mut self, s: String) {
        if !s.is_empty() && self.seen.insert(s.clone()) {
            self.ordered.push(s);
        }
    }

    fn extend(&mut self, items: Vec<String>) {
        for s in items {
            self.push(s);
        }
    }

    fn finish(self) -> Vec<String> {
        self.ordered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_collapses_spellings() {
        assert_eq!(normalize("EUR/USD").as_str(), "eurusd");
        assert_eq!(normalize("eurusd").as_str(), "eurusd");
        assert_eq!(normalize("EUR_USD").as_str(), "eurusd");
        assert_eq!(normalize("EUR/USD (OTC)").as_str(), "eurusd_otc");
        assert_eq!(normalize("eurusd_otc").as_str(), "eurusd_otc");
        assert_eq!(normalize("EURUSD-OTC").as_str(), "eurusd_otc");
        assert_eq!(normalize("  eur usd otc ").as_str(), "eurusd_otc");
        assert_eq!(normalize("#AAPL_otc").as_str(), "aapl_otc");
    }

    #[test]
    fn test_normalize_edge_cases() {
        assert_eq!(normalize("").as_str(), "");
        assert_eq!(normalize("OTC").as_str(), "otc");
        assert_eq!(normalize("(OTC)").as_str(), "otc");
        assert_eq!(normalize("//--").as_str(), "");
    }

    #[test]
    fn test_strip_otc_text_keeps_separator() {
        assert_eq!(strip_otc_text("USD/BRL (OTC)"), "USD/BRL");
        assert_eq!(strip_otc_text("EURUSD_otc"), "EURUSD");
        assert_eq!(strip_otc_text("GBP/JPY"), "GBP/JPY");
    }

    #[test]
    fn test_base_symbol_ignores_otc() {
        assert_eq!(base_symbol("NZD/CAD (OTC)"), "nzdcad");
        assert_eq!(base_symbol("NZD/CAD"), "nzdcad");
        assert!(is_otc("usdbrl_otc"));
        assert!(!is_otc("USD/BRL"));
    }

    #[test]
    fn test_variants_contains_legacy_otc_key() {
        let v = variants("GBP/USD (OTC)");
        assert!(v.contains(&"gbpusd_otc".to_string()));
        assert!(v.contains(&"GBP/USD (OTC)".to_string()));
        assert!(v.contains(&"GBP/USD".to_string()));
        assert!(v.contains(&"gbpusd".to_string()));
        // OTC spellings are tried before the plain ones
        let otc_pos = v.iter().position(|s| s == "gbpusd_otc").unwrap();
        let plain_pos = v.iter().position(|s| s == "gbpusd").unwrap();
        assert!(otc_pos < plain_pos);
    }

    #[test]
    fn test_variants_plain_request_prefers_plain() {
        let v = variants("EUR/USD");
        let plain_pos = v.iter().position(|s| s == "eurusd").unwrap();
        let otc_pos = v.iter().position(|s| s == "eurusd_otc").unwrap();
        assert!(plain_pos < otc_pos);
    }

    #[test]
    fn test_variants_have_no_duplicates_or_empties() {
        let v = variants("usd/jpy");
        let unique: HashSet<_> = v.iter().collect();
        assert_eq!(unique.len(), v.len());
        assert!(v.iter().all(|s| !s.is_empty()));
        assert!(variants("").is_empty());
    }

    fn spelling(b: &str, q: &str, form: usize) -> String {
        match form {
            0 => format!("{b}/{q}"),
            1 => format!("{}{}", b.to_lowercase(), q.to_lowercase()),
            2 => format!("{b}/{q} (OTC)"),
            3 => format!("{}{}_otc", b.to_lowercase(), q.to_lowercase()),
            4 => format!("{b}{q}-OTC"),
            _ => format!("{b}_{q}"),
        }
    }

    proptest! {
        #[test]
        fn prop_normalize_is_total(raw in ".*") {
            let key = normalize(&raw);
            prop_assert_eq!(normalize(&raw), key);
            let _ = variants(&raw);
        }

        #[test]
        fn prop_equivalent_spellings_share_a_key(
            b in "[A-Z]{3}",
            // a quote currency spelled "OTC" is ambiguous with the marker
            q in "[A-NP-Z][A-Z]{2}",
            cached_form in 0usize..6,
            lookup_form in 0usize..6,
        ) {
            let cached_key = normalize(&spelling(&b, &q, cached_form));
            let candidates = variants(&spelling(&b, &q, lookup_form));
            prop_assert!(candidates.iter().any(|c| c == cached_key.as_str()));
        }
    }
}
