use std::time::Duration;

/// Delay before the next delivery attempt of an entry that failed `attempts` times:
/// `base * 2^attempts`, capped at `max`.
pub fn retry_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(3600);
        assert_eq!(retry_delay(1, base, max), Duration::from_secs(1));
        assert_eq!(retry_delay(2, base, max), Duration::from_secs(2));
        assert_eq!(retry_delay(5, base, max), Duration::from_secs(16));
    }

    #[test]
    fn is_capped() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(retry_delay(10, base, max), max);
        assert_eq!(retry_delay(40, base, max), max);
    }
}
