//! A layer that records what passes through it, for testing other layers.

use crate::layer::{Cancellation, Context, Failure, Layer, ReceiveError, SendError};
use crate::message::Message;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub enum Recorded {
    Sent(Message, Instant),
    Received(Message, Instant),
    Failed(Failure, Instant),
    Cancelled(Cancellation),
}

/// Records every message and notice it sees.
///
/// Outgoing messages and cancellations are passed down when there is a
/// layer below. Incoming messages and failures stop here unless the probe
/// is transparent, so a probe at the top of a chain stands in for the
/// application and a transparent probe at the bottom stands in for the
/// transport.
pub struct Probe {
    transparent: bool,
    recorded: Mutex<Vec<Recorded>>,
}

impl Probe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transparent: false,
            recorded: Mutex::new(vec![]),
        })
    }

    pub fn transparent() -> Arc<Self> {
        Arc::new(Self {
            transparent: true,
            recorded: Mutex::new(vec![]),
        })
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(Message, Instant)> {
        self.recorded()
            .into_iter()
            .filter_map(|record| match record {
                Recorded::Sent(message, at) => Some((message, at)),
                _ => None,
            })
            .collect()
    }

    pub fn received(&self) -> Vec<(Message, Instant)> {
        self.recorded()
            .into_iter()
            .filter_map(|record| match record {
                Recorded::Received(message, at) => Some((message, at)),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(Failure, Instant)> {
        self.recorded()
            .into_iter()
            .filter_map(|record| match record {
                Recorded::Failed(failure, at) => Some((failure, at)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, record: Recorded) {
        self.recorded.lock().unwrap().push(record);
    }
}

impl Layer for Probe {
    fn name(&self) -> &'static str {
        "probe"
    }

    fn send(self: Arc<Self>, message: Message, context: Context) -> Result<(), SendError> {
        self.record(Recorded::Sent(message.clone(), Instant::now()));
        match context.send_down(message) {
            Err(SendError::Unwired) => Ok(()),
            result => result,
        }
    }

    fn receive(self: Arc<Self>, message: Message, context: Context) -> Result<(), ReceiveError> {
        self.record(Recorded::Received(message.clone(), Instant::now()));
        if self.transparent {
            context.receive_up(message)
        } else {
            Ok(())
        }
    }

    fn fail(self: Arc<Self>, failure: Failure, context: Context) {
        self.record(Recorded::Failed(failure, Instant::now()));
        if self.transparent {
            context.fail_up(failure)
        }
    }

    fn cancel(self: Arc<Self>, cancellation: Cancellation, context: Context) {
        self.record(Recorded::Cancelled(cancellation));
        context.cancel_down(cancellation)
    }
}
