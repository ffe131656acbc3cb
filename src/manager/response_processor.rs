use std::sync::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::error::{Result, TransportError};
use crate::message::IncomingMessage;
use crate::timer::TimerConsumer;

pub type ResponseCallback = Box<dyn FnOnce(Result<IncomingMessage>) + Send + 'static>;

enum Waiter {
    Sync(oneshot::Sender<Result<IncomingMessage>>),
    Async(ResponseCallback),
}

impl Waiter {
    fn complete(self, result: Result<IncomingMessage>) {
        match self {
            Waiter::Sync(sender) => {
                // the requester may have timed out and gone away already
                let _ = sender.send(result);
            }
            Waiter::Async(callback) => callback(result),
        }
    }
}

struct Entry {
    uri: String,
    deadline: Instant,
    waiter: Waiter,
}

/// Outstanding requests by message id, waiting for their correlated reply.
///
/// Waiters are always completed outside the lock, so a callback may issue new requests.
#[derive(Default)]
pub struct ResponseProcessors {
    entries: Mutex<FxHashMap<u64, Entry>>,
}

impl ResponseProcessors {
    pub fn register_sync(&self, message_id: u64, uri: &str, deadline: Instant) -> oneshot::Receiver<Result<IncomingMessage>> {
        let (send, recv) = oneshot::channel();
        self.insert(message_id, uri, deadline, Waiter::Sync(send));
        recv
    }

    pub fn register_async(&self, message_id: u64, uri: &str, deadline: Instant, callback: ResponseCallback) {
        self.insert(message_id, uri, deadline, Waiter::Async(callback));
    }

    fn insert(&self, message_id: u64, uri: &str, deadline: Instant, waiter: Waiter) {
        trace!("waiting for the reply to message {} from {}", message_id, uri);
        self.entries.lock().unwrap().insert(message_id, Entry {
            uri: uri.to_string(),
            deadline,
            waiter,
        });
    }

    /// Routes a reply to its waiter. Returns `false` if nobody waits for it (any more).
    pub fn complete(&self, reply_to_id: u64, reply: IncomingMessage) -> bool {
        let entry = self.entries.lock().unwrap().remove(&reply_to_id);
        match entry {
            Some(entry) => {
                entry.waiter.complete(Ok(reply));
                true
            }
            None => {
                debug!("received reply to message {} which nobody waits for - discarding", reply_to_id);
                false
            }
        }
    }

    /// forgets a request without notifying its waiter
    pub fn remove(&self, message_id: u64) -> bool {
        self.entries.lock().unwrap().remove(&message_id).is_some()
    }

    /// fails all requests to a given host, e.g. when its connections were closed
    pub fn fail_host(&self, uri: &str, error: &TransportError) -> usize {
        self.fail_where(|entry| entry.uri == uri, |_| error.clone())
    }

    pub fn fail_all(&self, error: &TransportError) -> usize {
        self.fail_where(|_| true, |_| error.clone())
    }

    /// fails all requests whose deadline passed with [TransportError::ServerDidNotReply]
    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.fail_where(|entry| entry.deadline <= now, |entry| TransportError::ServerDidNotReply { uri: entry.uri.clone() })
    }

    fn fail_where(&self, predicate: impl Fn(&Entry) -> bool, error: impl Fn(&Entry) -> TransportError) -> usize {
        let failed = {
            let mut entries = self.entries.lock().unwrap();
            let ids = entries.iter()
                .filter(|(_, e)| predicate(e))
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id))
                .collect::<Vec<_>>()
        };

        let result = failed.len();
        for entry in failed {
            let error = error(&entry);
            entry.waiter.complete(Err(error));
        }
        result
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TimerConsumer for ResponseProcessors {
    fn on_timer(&self, now: Instant) {
        let num_expired = self.sweep_expired(now);
        if num_expired > 0 {
            debug!("{} requests timed out", num_expired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use bytes::Bytes;
    use crate::host_information::HostInformation;
    use crate::message::MessageMode;

    fn reply(reply_to_id: u64) -> IncomingMessage {
        IncomingMessage {
            id: 999,
            reply_to_id: Some(reply_to_id),
            mode: MessageMode::OneWay,
            service_name: "svc".to_string(),
            session_name: "/none".to_string(),
            sender: Arc::new(HostInformation::new("gudp://127.0.0.1:1", Duration::from_secs(1))),
            payload: Bytes::from_static(b"reply"),
        }
    }

    #[tokio::test]
    async fn test_sync_reply() {
        let processors = ResponseProcessors::default();
        let recv = processors.register_sync(1, "gudp://127.0.0.1:1", Instant::now() + Duration::from_secs(1));

        assert!(!processors.complete(2, reply(2)));
        assert!(processors.complete(1, reply(1)));
        assert!(!processors.complete(1, reply(1)));

        let received = recv.await.unwrap().unwrap();
        assert_eq!(received.payload.as_ref(), b"reply");
        assert!(processors.is_empty());
    }

    #[test]
    fn test_async_timeout() {
        let processors = ResponseProcessors::default();
        let now = Instant::now();
        let result = Arc::new(Mutex::new(None));

        let r2 = result.clone();
        processors.register_async(1, "gudp://127.0.0.1:1", now + Duration::from_secs(5), Box::new(move |r| {
            *r2.lock().unwrap() = Some(r);
        }));
        processors.register_async(2, "gudp://127.0.0.1:1", now + Duration::from_secs(50), Box::new(|_| {}));

        processors.on_timer(now + Duration::from_secs(4));
        assert!(result.lock().unwrap().is_none());

        processors.on_timer(now + Duration::from_secs(5));
        assert!(matches!(result.lock().unwrap().take(), Some(Err(TransportError::ServerDidNotReply { .. }))));
        assert_eq!(processors.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_host() {
        let processors = ResponseProcessors::default();
        let deadline = Instant::now() + Duration::from_secs(5);
        let a = processors.register_sync(1, "gtcp://a:1", deadline);
        let _b = processors.register_sync(2, "gtcp://b:1", deadline);

        assert_eq!(processors.fail_host("gtcp://a:1", &TransportError::ServerRestarted { uri: "gtcp://a:1".to_string() }), 1);
        assert!(matches!(a.await.unwrap(), Err(TransportError::ServerRestarted { .. })));
        assert_eq!(processors.len(), 1);

        assert_eq!(processors.fail_all(&TransportError::ChannelClosed), 1);
        assert!(processors.is_empty());
    }

    #[test]
    fn test_remove() {
        let processors = ResponseProcessors::default();
        let _recv = processors.register_sync(1, "u", Instant::now());
        assert!(processors.remove(1));
        assert!(!processors.remove(1));
    }
}
