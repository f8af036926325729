use tokio::sync::mpsc;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connection is closed")]
    Closed,

    #[error("outbound queue is full")]
    Full,

    #[error("transport failure: {0}")]
    Other(String),
}

/// the outbound side of a relay connection. sending only enqueues, it never waits for the socket
pub trait Transport: Send + Sync {
    fn send(&self, frame: String) -> Result<(), TransportError>;
}

/// what the inbound side of a relay connection yields, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    /// the connection is gone, with whatever reason the socket layer had
    Closed(Option<String>),
}

impl Transport for mpsc::Sender<String> {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        self.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

impl Transport for mpsc::UnboundedSender<String> {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        mpsc::UnboundedSender::send(self, frame).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_sender() {
        let (tx, mut rx) = mpsc::channel::<String>(1);
        Transport::send(&tx, "a".to_string()).unwrap();
        assert!(matches!(
            Transport::send(&tx, "b".to_string()),
            Err(TransportError::Full)
        ));
        assert_eq!(rx.recv().await.unwrap(), "a");

        drop(rx);
        assert!(matches!(
            Transport::send(&tx, "c".to_string()),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unbounded_sender() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let transport: &dyn Transport = &tx;
        transport.send("x".to_string()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "x");

        drop(rx);
        assert!(transport.send("y".to_string()).is_err());
    }
}
