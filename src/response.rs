use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use curl::easy::WriteError;
use tokio::sync::oneshot;

use crate::channel::{Accept, PauseChannel, Signal, Submitted, Waiter};
use crate::command::Command;
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::info::{Info, InfoValue};
use crate::session::Lease;

type ReadReply = oneshot::Sender<Result<Bytes>>;

pub(crate) struct ReadWaiter {
    max: usize,
    reply: ReadReply,
}

impl Waiter for ReadWaiter {
    fn close(self, signal: Signal) {
        let result = match signal {
            Signal::EndOfStream => Ok(Bytes::new()),
            Signal::Cancelled => Err(Error::Cancelled),
        };
        let _ = self.reply.send(result);
    }

    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

impl Accept<&[u8]> for ReadWaiter {
    fn accept(self, data: &[u8]) -> Submitted {
        let n = data.len().min(self.max);
        match self.reply.send(Ok(Bytes::copy_from_slice(&data[..n]))) {
            Ok(()) => Submitted::Consumed(n),
            // the reader went away in the meantime, keep everything
            Err(_) => Submitted::Consumed(0),
        }
    }
}

/// Receive side of a transfer, fed by libcurl's write callback.
#[derive(Default)]
pub(crate) struct Inbox {
    channel: PauseChannel<ReadWaiter>,
    buffer: BytesMut,
    finished: bool,
}

impl Inbox {
    /// Serve a read of at most `max` bytes. Returns true when the reader was
    /// parked and the receive direction has to be unpaused.
    pub fn read(&mut self, max: usize, reply: ReadReply) -> bool {
        if !self.buffer.is_empty() {
            let n = max.min(self.buffer.len());
            let _ = reply.send(Ok(self.buffer.split_to(n).freeze()));
            return false;
        }
        if self.finished || max == 0 {
            let _ = reply.send(Ok(Bytes::new()));
            return false;
        }
        match self.channel.register(ReadWaiter { max, reply }) {
            Ok(()) => true,
            Err(waiter) => {
                let _ = waiter.reply.send(Err(Error::MultipleReads));
                false
            }
        }
    }

    /// Handle body bytes from libcurl. Whatever the reader does not take is
    /// buffered, so libcurl always sees the whole chunk consumed.
    pub fn on_data(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        match self.channel.submit(data) {
            Submitted::Consumed(n) => {
                self.buffer.extend_from_slice(&data[n..]);
                Ok(data.len())
            }
            Submitted::Pause => Err(WriteError::Pause),
            Submitted::Abort => Ok(0),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn finish(&mut self) {
        self.finished = true;
        self.channel.close(Signal::EndOfStream);
    }

    pub fn cancel(&mut self) {
        self.channel.close(Signal::Cancelled);
    }
}

/// Final outcome of a transfer and the one task waiting for it.
#[derive(Default)]
pub(crate) struct Completion {
    outcome: Option<Result<()>>,
    waiter: Option<oneshot::Sender<Result<()>>>,
}

impl Completion {
    pub fn wait(&mut self, reply: oneshot::Sender<Result<()>>) {
        if let Some(outcome) = &self.outcome {
            let _ = reply.send(outcome.clone());
        } else if self.waiter.as_ref().is_some_and(|w| !w.is_closed()) {
            let _ = reply.send(Err(Error::MultipleCompletionAwaits));
        } else {
            self.waiter = Some(reply);
        }
    }

    pub fn resolve(&mut self, outcome: Result<()>) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(outcome.clone());
        }
        self.outcome = Some(outcome);
    }
}

/// The receiving half of a started transfer.
///
/// Reads, header waits and metadata queries all run on the session driver.
/// At most one read, one header wait and one completion wait may be pending
/// at a time; a concurrent second one fails instead of queueing.
///
/// Dropping the response abandons a transfer that is still running: it is
/// removed from the multi handle and its completion becomes
/// [`Error::Cancelled`]. The request keeps only the finished record.
pub struct Response {
    lease: Arc<Lease>,
}

impl Response {
    pub(crate) fn new(lease: Arc<Lease>) -> Self {
        Self { lease }
    }

    /// Read body bytes into `buf`. `Ok(0)` means the body has ended, which
    /// is also what an empty `buf` yields.
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let chunk = self.read_chunk(buf.len()).await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    /// Read up to `max` body bytes. An empty chunk means the body has ended.
    pub async fn read_chunk(&self, max: usize) -> Result<Bytes> {
        self.lease
            .call(|id, reply| Command::Read { id, max, reply })
            .await
    }

    /// Wait for the next complete header block. `None` once the transfer
    /// ended without another block.
    pub async fn wait_headers(&self) -> Result<Option<Headers>> {
        self.lease
            .call(|id, reply| Command::Headers { id, reply })
            .await
    }

    /// Wait through redirect hops for the headers of the final response.
    ///
    /// If the transfer ends while the last block seen still redirects (for
    /// example because redirects are not followed) that block is returned.
    pub async fn wait_last_headers(&self) -> Result<Option<Headers>> {
        let mut last = None;
        while let Some(headers) = self.wait_headers().await? {
            if !headers.is_redirect() {
                return Ok(Some(headers));
            }
            last = Some(headers);
        }
        Ok(last)
    }

    /// Wait for the transfer to finish and return its outcome.
    pub async fn wait_completion(&self) -> Result<()> {
        self.lease
            .call(|id, reply| Command::Completion { id, reply })
            .await
    }

    pub async fn info(&self, query: Info) -> Result<InfoValue> {
        self.lease
            .call(|id, reply| Command::Info { id, query, reply })
            .await
    }

    /// Last received status code.
    pub async fn response_code(&self) -> Result<u32> {
        match self.info(Info::ResponseCode).await?.as_long() {
            Some(code) if code > 0 => Ok(code as u32),
            _ => Err(Error::NoResponseCode),
        }
    }

    /// Announced body length, if the server sent one.
    pub async fn content_length(&self) -> Result<Option<u64>> {
        let length = self.info(Info::ContentLength).await?.as_long();
        Ok(length.and_then(|v| u64::try_from(v).ok()))
    }

    pub async fn content_type(&self) -> Result<Option<String>> {
        Ok(self.info(Info::ContentType).await?.into_text())
    }

    pub async fn effective_url(&self) -> Result<Option<String>> {
        Ok(self.info(Info::EffectiveUrl).await?.into_text())
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        self.lease.abandon();
    }
}
