use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::RetryPolicy;
use crate::message::MessageId;

/// Exponential backoff: `initial * 2^(attempt-1)`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// `delay` with ±15% jitter.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let factor = 1.0 + (rand::random::<f64>() * 0.3 - 0.15);
        delay.mul_f64(factor).min(self.max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBudget {
    pub remaining: u32,
    pub attempts: u32,
}

#[derive(Debug)]
struct Entry {
    budget: RetryBudget,
    touched: Instant,
}

/// What to do with a message that just failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Charge {
    Requeue { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

/// Retry budgets keyed by message id, shared by every consumer of one queue
/// on a connection. Entries are dropped once the message is acked or
/// dead-lettered, or after `ttl` without a charge (the message was settled
/// somewhere this ledger never saw).
#[derive(Debug)]
pub struct RetryLedger {
    max_retries: u32,
    backoff: Backoff,
    ttl: Duration,
    budgets: Mutex<HashMap<MessageId, Entry>>,
}

impl RetryLedger {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            max_retries: policy.max_retries,
            backoff: Backoff::new(
                Duration::from_millis(policy.backoff_ms),
                Duration::from_millis(policy.backoff_max_ms),
            ),
            ttl: policy.budget_ttl(),
            budgets: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<MessageId, Entry>> {
        self.budgets.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn charge(&self, id: &MessageId) -> Charge {
        let now = Instant::now();
        let mut budgets = self.entries();
        let ttl = self.ttl;
        budgets.retain(|_, entry| now.duration_since(entry.touched) < ttl);

        let entry = budgets.entry(id.clone()).or_insert(Entry {
            budget: RetryBudget {
                remaining: self.max_retries,
                attempts: 0,
            },
            touched: now,
        });
        entry.touched = now;
        let budget = &mut entry.budget;
        budget.attempts += 1;

        if budget.remaining == 0 {
            let attempts = budget.attempts;
            budgets.remove(id);
            return Charge::Exhausted { attempts };
        }

        budget.remaining -= 1;
        Charge::Requeue {
            attempt: budget.attempts,
            delay: self.backoff.delay(budget.attempts),
        }
    }

    /// Records a spent budget for a message that went back to the queue
    /// without being dead-lettered; its next failure dead-letters it.
    pub fn exhaust(&self, id: &MessageId, attempts: u32) {
        self.entries().insert(
            id.clone(),
            Entry {
                budget: RetryBudget {
                    remaining: 0,
                    attempts,
                },
                touched: Instant::now(),
            },
        );
    }

    pub fn clear(&self, id: &MessageId) {
        self.entries().remove(id);
    }

    pub fn budget(&self, id: &MessageId) -> Option<RetryBudget> {
        self.entries().get(id).map(|entry| entry.budget)
    }

    /// Messages with a budget on record.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
