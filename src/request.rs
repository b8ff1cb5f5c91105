use std::sync::Arc;

use bytes::Bytes;
use curl::easy::{Easy2, List, ReadError};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::channel::{Accept, PauseChannel, Signal, Submitted, Waiter};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::option::RequestOption;
use crate::session::Lease;
use crate::transfer::Transfer;

type WriteReply = oneshot::Sender<Result<usize>>;
type AbortReply = oneshot::Sender<Result<()>>;

pub(crate) enum SendWaiter {
    Write { data: Bytes, reply: WriteReply },
    Abort { reply: AbortReply },
}

impl Waiter for SendWaiter {
    fn close(self, signal: Signal) {
        match (self, signal) {
            (SendWaiter::Write { reply, .. }, Signal::EndOfStream) => {
                let _ = reply.send(Ok(0));
            }
            (SendWaiter::Write { reply, .. }, Signal::Cancelled) => {
                let _ = reply.send(Err(Error::Cancelled));
            }
            (SendWaiter::Abort { reply }, _) => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn is_abandoned(&self) -> bool {
        match self {
            SendWaiter::Write { reply, .. } => reply.is_closed(),
            // an abort goes through even if nobody waits for it anymore
            SendWaiter::Abort { .. } => false,
        }
    }
}

impl SendWaiter {
    fn reject(self) {
        match self {
            SendWaiter::Write { reply, .. } => {
                let _ = reply.send(Err(Error::MultipleWrites));
            }
            SendWaiter::Abort { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }
}

impl Accept<&mut [u8]> for SendWaiter {
    fn accept(self, buf: &mut [u8]) -> Submitted {
        match self {
            SendWaiter::Write { data, reply } => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                let _ = reply.send(Ok(n));
                Submitted::Consumed(n)
            }
            SendWaiter::Abort { reply } => {
                let _ = reply.send(Ok(()));
                Submitted::Abort
            }
        }
    }
}

/// Send side of a transfer, drained by libcurl's read callback.
#[derive(Default)]
pub(crate) struct Outbox {
    channel: PauseChannel<SendWaiter>,
    finished: bool,
}

impl Outbox {
    /// Fill `buf` for libcurl. Zero bytes tells libcurl the body is complete.
    pub fn on_read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.channel.submit(buf) {
            Submitted::Consumed(n) => Ok(n),
            Submitted::Abort => Err(ReadError::Abort),
            Submitted::Pause => Err(ReadError::Pause),
        }
    }

    /// Park a write. Returns true when the send direction has to be
    /// unpaused.
    pub fn write(&mut self, data: Bytes, reply: WriteReply) -> bool {
        if self.finished {
            let _ = reply.send(Ok(0));
            return false;
        }
        if self.is_abort_pending() {
            let _ = reply.send(Err(Error::Cancelled));
            return false;
        }
        match self.channel.register(SendWaiter::Write { data, reply }) {
            Ok(()) => true,
            Err(waiter) => {
                waiter.reject();
                false
            }
        }
    }

    /// Replace whatever is parked with an abort for libcurl to pick up.
    /// Returns true when the send direction has to be unpaused.
    pub fn abort(&mut self, reply: AbortReply) -> bool {
        if self.finished {
            let _ = reply.send(Ok(()));
            return false;
        }
        self.channel.close(Signal::Cancelled);
        self.channel.register(SendWaiter::Abort { reply }).is_ok()
    }

    /// An abort was parked but libcurl has not asked for body data since.
    pub fn is_abort_pending(&self) -> bool {
        matches!(self.channel.waiter(), Some(SendWaiter::Abort { .. }))
    }

    pub fn finish(&mut self) {
        self.finished = true;
        self.channel.close(Signal::EndOfStream);
    }
}

/// One HTTP transfer: options, outgoing headers and the request body.
///
/// A request is configured first, then handed to
/// [`Session::start`](crate::Session::start), which returns the paired
/// [`Response`](crate::Response). Once started, options are frozen and the
/// body is sent with [`write_some`](Request::write_some).
pub struct Request {
    // only reached through get_mut; the mutex makes Request Sync
    easy: Mutex<Option<Easy2<Transfer>>>,
    lease: Option<Arc<Lease>>,
    options: Vec<RequestOption>,
    headers: Vec<String>,
    has_url: bool,
}

impl Request {
    pub fn new() -> Self {
        Self {
            easy: Mutex::new(Some(Easy2::new(Transfer::default()))),
            lease: None,
            options: Vec::new(),
            headers: Vec::new(),
            has_url: false,
        }
    }

    /// A GET request for `url`.
    pub fn get(url: &str) -> Result<Self> {
        let mut request = Self::new();
        request.set_option(RequestOption::Url(url.to_owned()))?;
        Ok(request)
    }

    /// A POST request for `url` whose body is written after starting.
    pub fn post(url: &str) -> Result<Self> {
        let mut request = Self::get(url)?;
        request.set_option(RequestOption::Post)?;
        Ok(request)
    }

    pub fn set_option(&mut self, option: RequestOption) -> Result<()> {
        let easy = self.idle_mut()?;
        if let RequestOption::Url(url) = &option {
            if url.is_empty() {
                return Err(Error::BadUrl(url.clone()));
            }
            easy.url(url).map_err(|_| Error::BadUrl(url.clone()))?;
            self.has_url = true;
        } else {
            option.apply(easy).map_err(|source| Error::BadOption {
                option: option.name(),
                source,
            })?;
        }
        self.options.push(option);
        Ok(())
    }

    /// Add one outgoing header line, e.g. `"Accept: text/plain"`.
    pub fn append_header(&mut self, line: &str) -> Result<()> {
        self.idle_mut()?;
        self.headers.push(line.to_owned());
        self.apply_headers()
    }

    /// Drop every header added with [`append_header`](Request::append_header).
    pub fn free_headers(&mut self) -> Result<()> {
        self.idle_mut()?;
        self.headers.clear();
        self.apply_headers()
    }

    /// A fresh, unstarted request with the same options and headers.
    pub fn try_clone(&self) -> Result<Self> {
        let mut request = Self::new();
        for option in &self.options {
            request.set_option(option.clone())?;
        }
        for line in &self.headers {
            request.headers.push(line.clone());
        }
        if !request.headers.is_empty() {
            request.apply_headers()?;
        }
        Ok(request)
    }

    pub fn is_started(&self) -> bool {
        self.lease.is_some()
    }

    /// Send part of the request body. Resolves once libcurl took some of
    /// `data`, with the number of bytes taken. `Ok(0)` for a non-empty
    /// `data` means the transfer no longer accepts body bytes.
    ///
    /// An empty `data` marks the end of the body.
    pub async fn write_some(&self, data: &[u8]) -> Result<usize> {
        let lease = self.lease.as_ref().ok_or(Error::RequestNotActive)?;
        let data = Bytes::copy_from_slice(data);
        lease
            .call(|id, reply| Command::Write { id, data, reply })
            .await
    }

    /// Mark the end of the request body.
    pub async fn shutdown(&self) -> Result<()> {
        self.write_some(&[]).await.map(|_| ())
    }

    /// Abort the transfer. Pending reads and writes on either half fail
    /// with [`Error::Cancelled`], as does the transfer's completion.
    pub async fn abort(&self) -> Result<()> {
        let lease = self.lease.as_ref().ok_or(Error::RequestNotActive)?;
        lease.call(|id, reply| Command::Abort { id, reply }).await
    }

    /// Hand the easy handle over for starting.
    pub(crate) fn take_easy(&mut self) -> Result<Easy2<Transfer>> {
        if !self.has_url {
            return Err(Error::BadUrl(String::new()));
        }
        self.easy.get_mut().take().ok_or(Error::RequestInUse)
    }

    pub(crate) fn attach(&mut self, lease: Arc<Lease>) {
        self.lease = Some(lease);
    }

    pub(crate) fn idle_mut(&mut self) -> Result<&mut Easy2<Transfer>> {
        self.easy.get_mut().as_mut().ok_or(Error::RequestInUse)
    }

    fn apply_headers(&mut self) -> Result<()> {
        let mut list = List::new();
        for line in &self.headers {
            list.append(line)?;
        }
        self.idle_mut()?
            .http_headers(list)
            .map_err(|source| Error::BadOption {
                option: "http_headers",
                source,
            })
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(outbox: &mut Outbox, data: &'static [u8]) -> (bool, oneshot::Receiver<Result<usize>>) {
        let (tx, rx) = oneshot::channel();
        (outbox.write(Bytes::from_static(data), tx), rx)
    }

    #[test]
    fn test_read_without_writer_pauses() {
        let mut outbox = Outbox::default();
        let mut buf = [0u8; 8];
        assert!(matches!(outbox.on_read(&mut buf), Err(ReadError::Pause)));
    }

    #[test]
    fn test_write_copied_into_engine_buffer() {
        let mut outbox = Outbox::default();
        let (parked, mut rx) = write(&mut outbox, b"hello world");
        assert!(parked);

        let mut buf = [0u8; 5];
        assert_eq!(outbox.on_read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(rx.try_recv().unwrap().unwrap(), 5);

        // the write resolved, the engine pauses again
        assert!(matches!(outbox.on_read(&mut buf), Err(ReadError::Pause)));
    }

    #[test]
    fn test_empty_write_ends_body() {
        let mut outbox = Outbox::default();
        let (_, mut rx) = write(&mut outbox, b"");
        let mut buf = [0u8; 16];
        assert_eq!(outbox.on_read(&mut buf).unwrap(), 0);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_write_rejected() {
        let mut outbox = Outbox::default();
        let (_, mut first) = write(&mut outbox, b"one");
        let (parked, mut second) = write(&mut outbox, b"two");
        assert!(!parked);
        assert!(matches!(second.try_recv().unwrap(), Err(Error::MultipleWrites)));

        let mut buf = [0u8; 8];
        assert_eq!(outbox.on_read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"one");
        assert_eq!(first.try_recv().unwrap().unwrap(), 3);
    }

    #[test]
    fn test_abort_cancels_writer_and_aborts_engine() {
        let mut outbox = Outbox::default();
        let (_, mut pending) = write(&mut outbox, b"data");

        let (tx, mut aborted) = oneshot::channel();
        assert!(outbox.abort(tx));
        assert!(matches!(pending.try_recv().unwrap(), Err(Error::Cancelled)));
        assert!(outbox.is_abort_pending());

        let mut buf = [0u8; 8];
        assert!(matches!(outbox.on_read(&mut buf), Err(ReadError::Abort)));
        assert!(aborted.try_recv().unwrap().is_ok());
        assert!(!outbox.is_abort_pending());
    }

    #[test]
    fn test_finish_resolves_writer_with_end_of_stream() {
        let mut outbox = Outbox::default();
        let (_, mut pending) = write(&mut outbox, b"late");
        outbox.finish();
        assert_eq!(pending.try_recv().unwrap().unwrap(), 0);

        let (parked, mut rx) = write(&mut outbox, b"later");
        assert!(!parked);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_options_frozen_after_take() {
        let mut request = Request::get("http://127.0.0.1/").unwrap();
        request.append_header("X-Test: 1").unwrap();
        let _easy = request.take_easy().unwrap();

        assert!(matches!(
            request.set_option(RequestOption::Get),
            Err(Error::RequestInUse)
        ));
        assert!(matches!(
            request.append_header("X-Other: 2"),
            Err(Error::RequestInUse)
        ));
        assert!(matches!(request.take_easy(), Err(Error::RequestInUse)));
    }

    #[test]
    fn test_start_requires_url() {
        let mut request = Request::new();
        assert!(matches!(request.take_easy(), Err(Error::BadUrl(_))));
        assert!(matches!(
            request.set_option(RequestOption::Url(String::new())),
            Err(Error::BadUrl(_))
        ));
    }

    #[test]
    fn test_clone_replays_configuration() {
        let mut request = Request::post("http://127.0.0.1/upload").unwrap();
        request.append_header("Expect:").unwrap();
        let _easy = request.take_easy().unwrap();

        let mut copy = request.try_clone().unwrap();
        assert!(!copy.is_started());
        assert_eq!(copy.options.len(), 2);
        assert_eq!(copy.headers, vec!["Expect:".to_owned()]);
        assert!(copy.take_easy().is_ok());
    }

    #[tokio::test]
    async fn test_body_ops_need_start() {
        let request = Request::get("http://127.0.0.1/").unwrap();
        assert!(matches!(
            request.write_some(b"x").await,
            Err(Error::RequestNotActive)
        ));
        assert!(matches!(request.abort().await, Err(Error::RequestNotActive)));
    }
}
