//! Bounded-repetition circuit breaker.
//!
//! An agent stuck in a loop will re-issue the same call with the same
//! arguments. After N consecutive identical invocations inside a short
//! interval the breaker denies further attempts, with a reason the agent
//! can read and act on.

use std::time::{Duration, Instant};

use {
    serde_json::{Map, Value},
    sha2::{Digest, Sha256},
    tracing::warn,
};

const DEFAULT_THRESHOLD: u32 = 5;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

pub struct CircuitBreaker {
    threshold: u32,
    interval: Duration,
    last_key: Option<String>,
    consecutive: u32,
    last_seen: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_INTERVAL)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, interval: Duration) -> Self {
        Self {
            threshold,
            interval,
            last_key: None,
            consecutive: 0,
            last_seen: None,
        }
    }

    /// Record one invocation. `Err` carries the user-visible rejection
    /// reason when the breaker trips.
    pub fn check(&mut self, tool_name: &str, arguments: &Map<String, Value>) -> Result<(), String> {
        let key = invocation_key(tool_name, arguments);
        let now = Instant::now();

        let repeated = self.last_key.as_deref() == Some(&key)
            && self
                .last_seen
                .is_some_and(|seen| now.duration_since(seen) < self.interval);

        if repeated {
            self.consecutive += 1;
        } else {
            self.last_key = Some(key);
            self.consecutive = 1;
        }
        self.last_seen = Some(now);

        if self.consecutive > self.threshold {
            warn!(tool = %tool_name, count = self.consecutive, "circuit breaker tripped");
            return Err(format!(
                "circuit breaker: '{tool_name}' was called {count} times in a row with \
                 identical arguments; change arguments or approach",
                count = self.consecutive,
            ));
        }
        Ok(())
    }
}

fn invocation_key(tool_name: &str, arguments: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(Value::Object(arguments.clone()).to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn args(path: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("path".into(), Value::String(path.into()));
        map
    }

    #[test]
    fn trips_after_threshold_identical_calls() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(breaker.check("read_file", &args("/tmp/a")).is_ok());
        }
        let rejection = breaker.check("read_file", &args("/tmp/a")).unwrap_err();
        assert!(rejection.contains("read_file"));
        assert!(rejection.contains("change arguments"));
    }

    #[test]
    fn different_arguments_reset_the_count() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            breaker.check("read_file", &args("/tmp/a")).unwrap();
        }
        breaker.check("read_file", &args("/tmp/b")).unwrap();
        for _ in 0..2 {
            breaker.check("read_file", &args("/tmp/a")).unwrap();
        }
    }

    #[test]
    fn different_tools_reset_the_count() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.check("read_file", &args("/tmp/a")).unwrap();
        breaker.check("read_file", &args("/tmp/a")).unwrap();
        breaker.check("write_file", &args("/tmp/a")).unwrap();
        breaker.check("read_file", &args("/tmp/a")).unwrap();
    }

    #[test]
    fn stale_repeats_outside_the_interval_do_not_trip() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.check("read_file", &args("/tmp/a")).unwrap();
        // The zero interval makes every repeat stale.
        breaker.check("read_file", &args("/tmp/a")).unwrap();
        breaker.check("read_file", &args("/tmp/a")).unwrap();
    }
}
