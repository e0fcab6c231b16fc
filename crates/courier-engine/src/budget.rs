use tokio::time::Instant;

/// Token bucket limiting how fast one connection may send frames.
#[derive(Debug, Clone)]
pub struct FrameBudget {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    capacity: f64,
}

impl FrameBudget {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            rate,
            capacity,
        }
    }

    pub fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_budget_allows_burst_then_refills() {
        let mut budget = FrameBudget::new(10.0, 5.0);
        for _ in 0..5 {
            assert!(budget.try_consume());
        }
        assert!(!budget.try_consume());

        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
    }
}
