/// Utility helpers shared by adapters and the normalizer.
///
/// This module contains:
/// - Currency pair helpers
/// - JSON path lookup
///
/// No exchange-specific logic lives here.
use serde_json::Value;

/// Every ordered pair of distinct currencies.
///
/// Examples:
/// - ["BTC", "USD"] -> [("BTC", "USD"), ("USD", "BTC")]
///
/// Input order is preserved so results are deterministic.
pub fn currency_pairs(currencies: &[String]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for base in currencies {
        for quote in currencies {
            if !base.eq_ignore_ascii_case(quote) {
                pairs.push((base.clone(), quote.clone()));
            }
        }
    }
    pairs
}

/// Follows a dotted path (`data.history`) through nested objects.
///
/// Numeric segments index into arrays (`data.0.history`).
/// Returns the first segment that could not be resolved on failure.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Result<&'a Value, String> {
    let mut cur = root;
    for seg in path.split('.').filter(|s| !s.is_empty()) {
        let next = match cur {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        cur = next.ok_or_else(|| seg.to_string())?;
    }
    Ok(cur)
}
