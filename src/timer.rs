use crate::Shutdown;
use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::time::DelayQueue;

/// A set of one-shot timers served by a single task.
///
/// Events can be scheduled as soon as the timers exist. They fire only once
/// [`Timers::run`] has started the task. Timers are never cancelled; a
/// handler that may see stale events should carry an epoch in them and
/// ignore the ones that no longer match its state.
pub(crate) struct Timers<T> {
    sender: UnboundedSender<(T, Duration)>,
    receiver: Mutex<Option<UnboundedReceiver<(T, Duration)>>>,
}

impl<T: Send + 'static> Timers<T> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Fires `event` after `delay`.
    pub fn schedule(&self, event: T, delay: Duration) {
        if self.sender.send((event, delay)).is_err() {
            tracing::trace!("Timer scheduled after shutdown");
        }
    }

    /// Spawns the task that fires events, calling `fire` for each. Only the
    /// first call has any effect.
    pub fn run(&self, mut shutdown: Shutdown, mut fire: impl FnMut(T) + Send + 'static) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            return;
        };
        tokio::spawn(async move {
            let mut queue = DelayQueue::new();
            loop {
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    request = receiver.recv() => match request {
                        Some((event, delay)) => {
                            queue.insert(event, delay);
                        }
                        None => break,
                    },
                    Some(expired) = futures::future::poll_fn(|cx| queue.poll_expired(cx)), if !queue.is_empty() => {
                        fire(expired.into_inner());
                    }
                }
            }
        });
    }
}

/// Runs `sweep` every `period` until `shutdown` fires.
pub(crate) fn every(period: Duration, mut shutdown: Shutdown, mut sweep: impl FnMut() + Send + 'static) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                _ = interval.tick() => sweep(),
            }
        }
    });
}
