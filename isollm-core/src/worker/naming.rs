//! Worker naming: `worker-<N>`, N one more than the max currently present.

/// Strip a user-supplied name down to its numeric suffix if it already
/// carries the `worker-` prefix; otherwise treat the whole string as the
/// base name to prefix.
pub fn normalize(name: &str) -> String {
    if name.starts_with("worker-") {
        name.to_string()
    } else {
        format!("worker-{name}")
    }
}

/// Next name given the set of names currently known to the runtime.
pub fn next_name(existing: &[String]) -> String {
    let max_n = existing
        .iter()
        .filter_map(|n| n.strip_prefix("worker-"))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("worker-{}", max_n + 1)
}
