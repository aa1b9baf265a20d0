use std::time::Duration;

use tokio::task::JoinHandle;

struct PendingRetry {
    ticket: u64,
    delay: Duration,
    task: JoinHandle<()>,
}

/// Capped exponential backoff with at most one armed timer.
pub struct ReconnectScheduler {
    base: Duration,
    cap: Duration,
    retry_count: u32,
    next_ticket: u64,
    pending: Option<PendingRetry>,
}

impl ReconnectScheduler {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            retry_count: 0,
            next_ticket: 0,
            pending: None,
        }
    }

    /// `min(cap, base * 2^retry_count)`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Arms the retry timer, replacing any armed one, and bumps the retry
    /// counter. `on_fire` receives the ticket to hand back to
    /// [`ReconnectScheduler::take_fired`]. Returns the armed delay.
    pub fn schedule<F>(&mut self, on_fire: F) -> Duration
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        let delay = self.delay_for(self.retry_count);
        self.retry_count = self.retry_count.saturating_add(1);
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(ticket);
        });
        tracing::debug!(
            target = "live_view::reconnect",
            delay_ms = delay.as_millis() as u64,
            retry = self.retry_count,
            "reconnect armed"
        );
        self.pending = Some(PendingRetry {
            ticket,
            delay,
            task,
        });
        delay
    }

    /// Disarms the pending timer; returns whether one was armed.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.task.abort();
                tracing::debug!(target = "live_view::reconnect", "reconnect cancelled");
                true
            }
            None => false,
        }
    }

    /// Claims a fired timer. False for tickets of timers already cancelled
    /// or replaced.
    pub fn take_fired(&mut self, ticket: u64) -> bool {
        match &self.pending {
            Some(pending) if pending.ticket == ticket => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn pending_delay(&self) -> Option<Duration> {
        self.pending.as_ref().map(|pending| pending.delay)
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
