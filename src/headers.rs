//! Response header accumulation.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Header field name compared without regard to ASCII case.
///
/// Ordering is by length first, then by the case folded bytes, so lookups
/// never need to lowercase the stored name.
#[derive(Clone)]
pub struct FieldName(String);

impl FieldName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for FieldName {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.0.as_bytes(), other.0.as_bytes());
        a.len().cmp(&b.len()).then_with(|| {
            a.iter()
                .map(u8::to_ascii_lowercase)
                .cmp(b.iter().map(u8::to_ascii_lowercase))
        })
    }
}

impl PartialOrd for FieldName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FieldName {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FieldName {}

impl fmt::Debug for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl From<&str> for FieldName {
    fn from(name: &str) -> Self {
        FieldName(name.to_owned())
    }
}

/// One block of response headers.
///
/// A repeated field name keeps only the last value seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    status: Option<u32>,
    fields: BTreeMap<FieldName, String>,
}

impl Headers {
    /// Look up a field, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(&FieldName::from(name)).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(&FieldName::from(name))
    }

    /// Status code from the block's status line, when there was one.
    pub fn status(&self) -> Option<u32> {
        self.status
    }

    /// Whether this block points somewhere else.
    pub fn is_redirect(&self) -> bool {
        self.contains("location")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn insert(&mut self, name: &str, value: &str) {
        self.fields.insert(FieldName::from(name), value.to_owned());
    }

    fn clear(&mut self) {
        self.status = None;
        self.fields.clear();
    }
}

type HeaderReply = oneshot::Sender<Result<Option<Headers>>>;

/// Builds [`Headers`] from the lines libcurl hands to the header callback.
///
/// Redirects and interim responses produce several blocks on one transfer.
/// Each block starts from an empty map.
#[derive(Default)]
pub(crate) struct HeaderCollector {
    current: Headers,
    blocks_received: u64,
    last_clear: u64,
    ready: bool,
    finished: bool,
    waiter: Option<HeaderReply>,
}

impl HeaderCollector {
    pub fn on_header_line(&mut self, line: &[u8]) {
        if self.last_clear < self.blocks_received {
            // a block nobody waited for is stale once the next one starts
            self.current.clear();
            self.ready = false;
            self.last_clear = self.blocks_received;
        }

        if line.iter().all(|b| *b == b'\r' || *b == b'\n') {
            self.blocks_received += 1;
            self.ready = true;
            if let Some(waiter) = self.waiter.take().filter(|w| !w.is_closed()) {
                self.ready = false;
                let _ = waiter.send(Ok(Some(self.current.clone())));
            }
            return;
        }

        let line = String::from_utf8_lossy(line);
        if line.starts_with("HTTP/") {
            self.current.status = line
                .split_ascii_whitespace()
                .nth(1)
                .and_then(|code| code.parse().ok());
        } else if let Some((name, value)) = line.split_once(':') {
            self.current.insert(name.trim(), value.trim());
        }
    }

    /// Resolve `reply` with the next completed block, or `None` once the
    /// transfer has ended without one.
    pub fn wait(&mut self, reply: HeaderReply) {
        if self.ready {
            self.ready = false;
            let _ = reply.send(Ok(Some(self.current.clone())));
        } else if self.finished {
            let _ = reply.send(Ok(None));
        } else if self.waiter.as_ref().is_some_and(|w| !w.is_closed()) {
            let _ = reply.send(Err(Error::MultipleHeaderAwaits));
        } else {
            self.waiter = Some(reply);
        }
    }

    pub fn finish(&mut self) {
        self.finished = true;
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Ok(None));
        }
    }

    pub fn cancel(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(Err(Error::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(collector: &mut HeaderCollector, lines: &[&str]) {
        for line in lines {
            collector.on_header_line(line.as_bytes());
        }
    }

    fn wait(collector: &mut HeaderCollector) -> oneshot::Receiver<Result<Option<Headers>>> {
        let (tx, rx) = oneshot::channel();
        collector.wait(tx);
        rx
    }

    #[test]
    fn test_field_name_ordering() {
        let a = FieldName::from("Content-Type");
        let b = FieldName::from("content-type");
        assert_eq!(a, b);
        assert!(FieldName::from("zz") < FieldName::from("aaa"));
        assert!(FieldName::from("ab") < FieldName::from("AC"));
    }

    #[test]
    fn test_lookup_ignores_case() {
        let mut headers = Headers::default();
        headers.insert("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(!headers.is_redirect());
    }

    #[test]
    fn test_duplicate_name_overwrites() {
        let mut collector = HeaderCollector::default();
        feed(
            &mut collector,
            &["HTTP/1.1 200 OK\r\n", "X-A: 1\r\n", "x-a: 2\r\n", "\r\n"],
        );
        let headers = wait(&mut collector).try_recv().unwrap().unwrap().unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("X-A"), Some("2"));
    }

    #[test]
    fn test_block_parsed_and_trimmed() {
        let mut collector = HeaderCollector::default();
        let mut rx = wait(&mut collector);
        assert!(rx.try_recv().is_err());

        feed(
            &mut collector,
            &["HTTP/1.1 200 OK\r\n", "Content-Type:   text/plain  \r\n"],
        );
        assert!(rx.try_recv().is_err());
        feed(&mut collector, &["\r\n"]);

        let headers = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(headers.status(), Some(200));
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_ready_block_consumed_once() {
        let mut collector = HeaderCollector::default();
        feed(&mut collector, &["HTTP/1.1 204 No Content\r\n", "\r\n"]);

        let first = wait(&mut collector).try_recv().unwrap().unwrap();
        assert_eq!(first.unwrap().status(), Some(204));

        // nothing new arrived, the second wait parks
        let mut second = wait(&mut collector);
        assert!(second.try_recv().is_err());
        collector.finish();
        assert_eq!(second.try_recv().unwrap().unwrap(), None);
    }

    #[test]
    fn test_new_block_resets_fields() {
        let mut collector = HeaderCollector::default();
        feed(&mut collector, &["HTTP/1.1 301 Moved\r\n", "a: 1\r\n", "\r\n"]);
        let first = wait(&mut collector).try_recv().unwrap().unwrap().unwrap();
        assert_eq!(first.get("a"), Some("1"));

        let mut rx = wait(&mut collector);
        feed(&mut collector, &["HTTP/1.1 200 OK\r\n", "b: 2\r\n", "\r\n"]);
        let second = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(second.get("b"), Some("2"));
        assert_eq!(second.get("a"), None);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_partial_block_not_handed_out() {
        let mut collector = HeaderCollector::default();
        // a redirect hop completes with nobody waiting
        feed(
            &mut collector,
            &["HTTP/1.1 301 Moved\r\n", "Location: /x\r\n", "\r\n"],
        );
        feed(
            &mut collector,
            &["HTTP/1.1 200 OK\r\n", "Content-Type: text/plain\r\n"],
        );

        let mut rx = wait(&mut collector);
        assert!(rx.try_recv().is_err());

        feed(&mut collector, &["Content-Length: 5\r\n", "\r\n"]);
        let headers = rx.try_recv().unwrap().unwrap().unwrap();
        assert_eq!(headers.status(), Some(200));
        assert!(!headers.is_redirect());
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("content-length"), Some("5"));
    }

    #[test]
    fn test_unconsumed_redirect_superseded_by_final_block() {
        let mut collector = HeaderCollector::default();
        feed(
            &mut collector,
            &[
                "HTTP/1.1 302 Found\r\n",
                "Location: /hello\r\n",
                "\r\n",
                "HTTP/1.1 200 OK\r\n",
                "Content-Type: text/plain\r\n",
                "\r\n",
            ],
        );

        let headers = wait(&mut collector).try_recv().unwrap().unwrap().unwrap();
        assert_eq!(headers.status(), Some(200));
        assert!(!headers.is_redirect());
        assert_eq!(headers.get("Content-Type"), Some("text/plain"));

        collector.finish();
        assert_eq!(wait(&mut collector).try_recv().unwrap().unwrap(), None);
    }

    #[test]
    fn test_concurrent_wait_rejected() {
        let mut collector = HeaderCollector::default();
        let mut first = wait(&mut collector);
        let mut second = wait(&mut collector);
        assert!(matches!(
            second.try_recv().unwrap(),
            Err(Error::MultipleHeaderAwaits)
        ));

        feed(&mut collector, &["HTTP/1.1 200 OK\r\n", "\r\n"]);
        assert!(first.try_recv().unwrap().unwrap().is_some());
    }

    #[test]
    fn test_dropped_waiter_does_not_block() {
        let mut collector = HeaderCollector::default();
        drop(wait(&mut collector));
        let mut rx = wait(&mut collector);
        feed(&mut collector, &["HTTP/1.1 200 OK\r\n", "\r\n"]);
        assert!(rx.try_recv().unwrap().unwrap().is_some());
    }

    #[test]
    fn test_finished_without_block_is_end_of_stream() {
        let mut collector = HeaderCollector::default();
        collector.finish();
        assert_eq!(wait(&mut collector).try_recv().unwrap().unwrap(), None);
    }

    #[test]
    fn test_cancel_fails_waiter() {
        let mut collector = HeaderCollector::default();
        let mut rx = wait(&mut collector);
        collector.cancel();
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Cancelled)));
    }
}
