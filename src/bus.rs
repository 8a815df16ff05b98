use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ChainError;

/// The five fan-out exchanges of the validator wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Transaction,
    Candidate,
    Vote,
    Confirm,
    Finalize,
}

pub const EXCHANGES: [Exchange; 5] = [
    Exchange::Transaction,
    Exchange::Candidate,
    Exchange::Vote,
    Exchange::Confirm,
    Exchange::Finalize,
];

impl Exchange {
    fn index(self) -> usize {
        match self {
            Exchange::Transaction => 0,
            Exchange::Candidate => 1,
            Exchange::Vote => 2,
            Exchange::Confirm => 3,
            Exchange::Finalize => 4,
        }
    }
}

/// Receiving side of one exclusive queue bound to an exchange. Lagged
/// deliveries are dropped with a warning, mirroring no-ack consumption.
pub struct BusReceiver {
    inner: broadcast::Receiver<String>,
}

impl BusReceiver {
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.inner.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("bus receiver lagged, {} messages dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Fan-out broker interface the core consumes. Payloads are UTF-8 JSON;
/// every subscriber gets its own queue and publishers hear their own
/// messages back.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, exchange: Exchange, payload: String) -> Result<(), ChainError>;
    fn subscribe(&self, exchange: Exchange) -> BusReceiver;
}

/// In-process broker over broadcast channels, used by tests and
/// single-process clusters. A deployment transport implements the same
/// trait out of tree.
pub struct LocalBus {
    channels: Vec<broadcast::Sender<String>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        LocalBus {
            channels: EXCHANGES
                .iter()
                .map(|_| broadcast::channel(capacity).0)
                .collect(),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        LocalBus::new(1024)
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, exchange: Exchange, payload: String) -> Result<(), ChainError> {
        // send fails only when nobody is subscribed; fan-out drops it
        let _ = self.channels[exchange.index()].send(payload);
        Ok(())
    }

    fn subscribe(&self, exchange: Exchange) -> BusReceiver {
        BusReceiver {
            inner: self.channels[exchange.index()].subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber_including_sender() {
        let bus = LocalBus::default();
        let mut first = bus.subscribe(Exchange::Vote);
        let mut second = bus.subscribe(Exchange::Vote);
        let mut other = bus.subscribe(Exchange::Confirm);

        bus.publish(Exchange::Vote, "ballot".into()).await.unwrap();
        assert_eq!(first.recv().await.unwrap(), "ballot");
        assert_eq!(second.recv().await.unwrap(), "ballot");

        bus.publish(Exchange::Confirm, "seal".into()).await.unwrap();
        assert_eq!(other.recv().await.unwrap(), "seal");
    }
}
