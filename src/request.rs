//! Request passed through a handler chain.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::protocol::Segment;

/// Shared value stored in the context bag or carried by a request.
pub type Value = Arc<dyn Any + Send + Sync>;

/// One dispatch: the segment, its body, the peer and a cancellation scope.
///
/// Requests are cheap to clone. Derived requests (`with_cancel`,
/// `with_value`) never mutate the original.
#[derive(Debug, Clone)]
pub struct Request {
    /// Lifecycle event this request was created for.
    pub segment: Segment,
    /// Message bytes, terminator included. Only set for `ACK`.
    pub body: Option<Bytes>,
    /// Remote network address, captured when the connection was accepted.
    pub remote_addr: String,
    pub(crate) token: CancellationToken,
    values: Arc<Values>,
}

/// Ambient values attached to a request by an outer caller.
#[derive(Default)]
struct Values(HashMap<String, Value>);

impl std::fmt::Debug for Values {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl Request {
    pub fn new(segment: Segment, body: Option<Bytes>) -> Self {
        Request {
            segment,
            body,
            remote_addr: String::new(),
            token: CancellationToken::new(),
            values: Arc::default(),
        }
    }

    /// Returns a copy of the request whose cancellation is a child of `parent`.
    pub fn with_cancel(&self, parent: &CancellationToken) -> Request {
        Request {
            token: parent.child_token(),
            ..self.clone()
        }
    }

    /// Returns a copy of the request carrying an extra ambient value.
    pub fn with_value<T>(&self, key: impl Into<String>, value: T) -> Request
    where
        T: Any + Send + Sync,
    {
        let mut values = HashMap::clone(&self.values.0);
        values.insert(key.into(), Arc::new(value));
        Request {
            values: Arc::new(Values(values)),
            ..self.clone()
        }
    }

    /// Looks up an ambient value.
    pub fn value(&self, key: &str) -> Option<&(dyn Any + Send + Sync)> {
        self.values.0.get(key).map(|v| v.as_ref())
    }

    /// Cancels this request's scope. Derived requests are cancelled too.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the request is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Body length in bytes, 0 without body.
    pub fn len(&self) -> usize {
        self.body.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Request {
    fn default() -> Self {
        Request::new(Segment::default(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_request() {
        let cases = [
            (Segment::Ack, None),
            (Segment::Syn, None),
            (Segment::Fin, None),
            (Segment::Ack, Some(Bytes::from_static(b"hello world"))),
        ];
        for (segment, body) in cases {
            let req = Request::new(segment, body.clone());
            assert_eq!(req.segment, segment);
            assert_eq!(req.body, body);
            assert!(req.remote_addr.is_empty());
            assert!(!req.is_cancelled());
        }
        assert_eq!(Request::default().segment, Segment::Syn);
    }

    #[test]
    fn test_len() {
        assert_eq!(Request::new(Segment::Ack, None).len(), 0);
        let req = Request::new(Segment::Ack, Some(Bytes::from_static(b"hi")));
        assert_eq!(req.len(), 2);
        assert!(!req.is_empty());
    }

    #[test]
    fn test_with_cancel_derives_child() {
        let parent = CancellationToken::new();
        let req = Request::new(Segment::Ack, None);
        let derived = req.with_cancel(&parent);

        derived.cancel();
        assert!(derived.is_cancelled());
        assert!(!req.is_cancelled());
        assert!(!parent.is_cancelled());

        let derived = req.with_cancel(&parent);
        parent.cancel();
        assert!(derived.is_cancelled());
        assert!(!req.is_cancelled());
    }

    #[test]
    fn test_with_value_keeps_original() {
        let req = Request::new(Segment::Ack, None);
        let derived = req.with_value("answer", 42i64);

        assert!(req.value("answer").is_none());
        let v = derived.value("answer").and_then(|v| v.downcast_ref::<i64>());
        assert_eq!(v, Some(&42));

        let again = derived.with_value("name", "linewire");
        assert!(again.value("answer").is_some());
        assert!(again.value("name").is_some());
        assert!(derived.value("name").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_resolves() {
        let req = Request::new(Segment::Syn, None);
        let waiter = req.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        req.cancel();
        handle.await.unwrap();
    }
}
