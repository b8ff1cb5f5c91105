use std::fmt;
use std::sync::Arc;

use curl::easy::{Handler, ReadError, WriteError};
use libc::c_int;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::Result;
use crate::headers::HeaderCollector;
use crate::request::Outbox;
use crate::response::{Completion, Inbox};
use crate::socket::SocketRegistry;

/// Identifies a transfer within its session. Doubles as the multi handle
/// token for the transfer's easy handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TransferId(pub usize);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per transfer state reached from libcurl's callbacks.
///
/// libcurl only calls into it from inside multi handle calls made by the
/// session driver, so nothing here needs to be synchronized.
#[derive(Default)]
pub(crate) struct Transfer {
    pub id: usize,
    pub inbox: Inbox,
    pub outbox: Outbox,
    pub headers: HeaderCollector,
    pub completion: Completion,
    sockets: Option<Arc<Mutex<SocketRegistry>>>,
}

impl Transfer {
    /// Let this transfer open its connections through `sockets`.
    pub fn attach(&mut self, id: TransferId, sockets: Arc<Mutex<SocketRegistry>>) {
        self.id = id.0;
        self.sockets = Some(sockets);
    }

    pub fn detach(&mut self) {
        self.sockets = None;
    }

    /// Resolve every pending waiter on both halves with end of stream and
    /// record the outcome for completion waiters.
    pub fn finish(&mut self, outcome: Result<()>) {
        self.inbox.finish();
        self.outbox.finish();
        self.headers.finish();
        self.completion.resolve(outcome);
    }

    /// Fail every pending waiter that is not part of the abort itself.
    pub fn cancel_waiters(&mut self) {
        self.inbox.cancel();
        self.headers.cancel();
    }
}

impl Handler for Transfer {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let result = self.inbox.on_data(data);
        trace!(transfer = self.id, len = data.len(), paused = result.is_err(), "body data");
        result
    }

    fn read(&mut self, into: &mut [u8]) -> Result<usize, ReadError> {
        let result = self.outbox.on_read(into);
        trace!(transfer = self.id, capacity = into.len(), ?result, "body request");
        result
    }

    fn header(&mut self, data: &[u8]) -> bool {
        self.headers.on_header_line(data);
        true
    }

    fn open_socket(
        &mut self,
        family: c_int,
        socktype: c_int,
        protocol: c_int,
    ) -> Option<curl_sys::curl_socket_t> {
        let Some(sockets) = self.sockets.as_ref() else {
            error!(transfer = self.id, "socket requested by a detached transfer");
            return None;
        };
        match sockets.lock().open(family, socktype, protocol) {
            Ok(fd) => Some(fd),
            Err(e) => {
                error!(transfer = self.id, error = %e, "failed to open socket");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use bytes::Bytes;
    use tokio::sync::oneshot;

    // The scenario from a plain GET, driving the callbacks the way libcurl
    // would.
    #[test]
    fn test_simple_response_flow() {
        let mut transfer = Transfer::default();

        let (tx, mut headers) = oneshot::channel();
        transfer.headers.wait(tx);
        for line in ["HTTP/1.1 200 OK\r\n", "Content-Type: text/plain\r\n", "\r\n"] {
            assert!(transfer.header(line.as_bytes()));
        }
        let headers = headers.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.len(), 1);

        let (tx, mut body) = oneshot::channel();
        assert!(transfer.inbox.read(64, tx));
        assert_eq!(transfer.write(b"hello").unwrap(), 5);
        assert_eq!(body.try_recv().unwrap().unwrap(), Bytes::from_static(b"hello"));

        transfer.finish(Ok(()));
        let (tx, mut eof) = oneshot::channel();
        assert!(!transfer.inbox.read(64, tx));
        assert!(eof.try_recv().unwrap().unwrap().is_empty());

        let (tx, mut done) = oneshot::channel();
        transfer.completion.wait(tx);
        assert!(done.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_abort_during_pending_read() {
        let mut transfer = Transfer::default();
        let (tx, mut read) = oneshot::channel();
        assert!(transfer.inbox.read(16, tx));

        transfer.cancel_waiters();
        assert!(matches!(read.try_recv().unwrap(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_detached_transfer_refuses_sockets() {
        let mut transfer = Transfer::default();
        assert_eq!(
            transfer.open_socket(libc::AF_INET, libc::SOCK_STREAM, 0),
            None
        );
    }

    #[test]
    fn test_attached_transfer_opens_through_registry() {
        let registry = Arc::new(Mutex::new(SocketRegistry::default()));
        let mut transfer = Transfer::default();
        transfer.attach(TransferId(7), registry.clone());

        let fd = transfer
            .open_socket(libc::AF_INET, libc::SOCK_STREAM, 0)
            .expect("socket");
        assert_eq!(registry.lock().stats().tracked, 1);
        assert_eq!(registry.lock().close(fd), 0);

        transfer.detach();
        assert_eq!(
            transfer.open_socket(libc::AF_INET, libc::SOCK_STREAM, 0),
            None
        );
    }
}
