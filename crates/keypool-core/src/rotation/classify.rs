/// Markers providers use in throttling errors
const RATE_LIMIT_MARKERS: [&str; 5] = [
    "rate",
    "quota",
    "429",
    "resource_exhausted",
    "too many requests",
];

/// Whether a provider error message signals throttling rather than a
/// broken key. Callers pass the result to `report_error`.
pub fn is_rate_limit_error(message: &str) -> bool {
    let message = message.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|marker| message.contains(marker))
}
