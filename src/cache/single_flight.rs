use crate::cache::Error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

type Outcome = Result<(), Error>;
type WaiterMap = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<Outcome>>>>>;

/// Collapses concurrent upstream pulls of the same URL into one.
#[derive(Clone, Debug, Default)]
pub struct SingleFlight {
    waiters: WaiterMap,
}

pub enum Flight {
    /// The caller owns the pull for this URL.
    Leader(Leader),
    /// Another caller is pulling; resolves with the leader's outcome.
    Waiter(oneshot::Receiver<Outcome>),
}

/// Held by the caller performing the pull. Waiters are signalled when the
/// guard completes or is dropped, whichever happens first.
#[derive(Debug)]
pub struct Leader {
    url: String,
    waiters: WaiterMap,
    outcome: Option<Outcome>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, url: &str) -> Flight {
        let mut waiters = self
            .waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(channels) = waiters.get_mut(url) {
            let (sender, receiver) = oneshot::channel();
            channels.push(sender);
            debug!("Waiting on in-flight pull of {url} ({} waiters)", channels.len());
            return Flight::Waiter(receiver);
        }

        waiters.insert(url.to_string(), Vec::new());
        Flight::Leader(Leader {
            url: url.to_string(),
            waiters: self.waiters.clone(),
            outcome: None,
        })
    }

    /// Number of URLs with a pull in flight.
    pub fn in_flight(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether a pull of `url` is in flight.
    pub fn is_pending(&self, url: &str) -> bool {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(url)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }
}

impl Leader {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Signals every waiter with the pull outcome and releases the URL.
    pub fn complete(mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for Leader {
    fn drop(&mut self) {
        let channels = self
            .waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.url)
            .unwrap_or_default();

        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(Error::UpstreamFailed(format!(
                "Pull of {} was abandoned",
                self.url
            )))
        });

        debug!("Completing pull of {} for {} waiters", self.url, channels.len());
        for channel in channels {
            // A waiter that timed out has dropped its receiver
            let _ = channel.send(outcome.clone());
        }
    }
}
