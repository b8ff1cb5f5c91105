use bytes::Bytes;
use curl::easy::Easy2;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::headers::Headers;
use crate::info::{Info, InfoValue};
use crate::session::SessionStats;
use crate::transfer::{Transfer, TransferId};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Work handed to the session driver. Every variant but `Abandon` and
/// `Release` carries the sender its result goes back on.
pub(crate) enum Command {
    Start {
        id: TransferId,
        easy: Box<Easy2<Transfer>>,
        reply: Reply<()>,
    },
    Read {
        id: TransferId,
        max: usize,
        reply: Reply<Bytes>,
    },
    Write {
        id: TransferId,
        data: Bytes,
        reply: Reply<usize>,
    },
    Abort {
        id: TransferId,
        reply: Reply<()>,
    },
    Headers {
        id: TransferId,
        reply: Reply<Option<Headers>>,
    },
    Completion {
        id: TransferId,
        reply: Reply<()>,
    },
    Info {
        id: TransferId,
        query: Info,
        reply: Reply<InfoValue>,
    },
    Stats {
        reply: Reply<SessionStats>,
    },
    /// The response was dropped, nobody reads the transfer anymore.
    Abandon { id: TransferId },
    /// The last request or response of a transfer was dropped.
    Release { id: TransferId },
}
