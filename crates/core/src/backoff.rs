use std::time::Duration;

/// Exponential backoff: `min(initial * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self { Self { initial, max: max.max(initial) } }

    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_nanos().saturating_mul(1u128 << attempt.min(64));
        let capped = scaled.min(self.max.as_nanos());
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let b = Backoff::new(Duration::from_millis(5), Duration::from_millis(100));
        assert_eq!(b.delay(0), Duration::from_millis(5));
        assert_eq!(b.delay(1), Duration::from_millis(10));
        assert_eq!(b.delay(4), Duration::from_millis(80));
        assert_eq!(b.delay(5), Duration::from_millis(100));
        assert_eq!(b.delay(200), Duration::from_millis(100));
    }
}
