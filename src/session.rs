use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::error;

use crate::command::{Command, Reply};
use crate::config::SessionConfig;
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::socket::SocketStats;
use crate::transfer::TransferId;

/// Snapshot of a session's driver state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Transfers registered with the multi handle.
    pub active_transfers: usize,
    /// Finished transfers whose request or response is still held.
    pub finished_transfers: usize,
    pub sockets: SocketStats,
}

/// Runs HTTP transfers concurrently on one libcurl multi handle.
///
/// The multi handle, every easy handle started on it, and the sockets they
/// use live on a dedicated driver thread with its own current-thread tokio
/// runtime. Async operations on [`Request`] and [`Response`] are messages to
/// that thread, so they can be awaited from any runtime.
///
/// Cloning a session shares the driver. The driver stops once the session,
/// and every request and response started on it, have been dropped.
///
/// ```no_run
/// use crucible_curl::{Request, Session};
///
/// # async fn example() -> Result<(), crucible_curl::Error> {
/// let session = Session::new()?;
/// let mut request = Request::get("http://127.0.0.1:8080/")?;
/// let response = session.start(&mut request).await?;
///
/// let headers = response.wait_headers().await?;
/// let body = crucible_curl::quick::read_to_end(&response).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicUsize,
    config: SessionConfig,
    _driver: thread::JoinHandle<()>,
}

impl Shared {
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::SessionClosed)
    }
}

/// Keeps a started transfer's record alive while its request or response
/// is. Dropping the last lease tells the driver to release the transfer.
pub(crate) struct Lease {
    id: TransferId,
    shared: Arc<Shared>,
}

impl Lease {
    /// Send a command for this transfer and wait for its reply.
    pub async fn call<T>(&self, command: impl FnOnce(TransferId, Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.shared.send(command(self.id, tx))?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Tell the driver the receiving side is gone.
    pub fn abandon(&self) {
        let _ = self.shared.send(Command::Abandon { id: self.id });
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = self.shared.send(Command::Release { id: self.id });
    }
}

impl Session {
    /// Start a session with default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(SessionConfig::default())
    }

    /// Start a session, spawning its driver thread.
    pub fn with_config(config: SessionConfig) -> Result<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let driver_config = config.clone();
        let driver = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::from(e)));
                        return;
                    }
                };
                let driver = match Driver::new(&driver_config, receiver) {
                    Ok(driver) => driver,
                    Err(e) => {
                        error!(error = %e, "failed to set up multi handle");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                runtime.block_on(driver.run());
            })?;

        ready_rx.recv().map_err(|_| Error::SessionClosed)??;

        Ok(Self {
            shared: Arc::new(Shared {
                commands,
                next_id: AtomicUsize::new(0),
                config,
                _driver: driver,
            }),
        })
    }

    /// Register `request` with the multi handle and return its response.
    ///
    /// The request's options are frozen from here on; starting it a second
    /// time fails with [`Error::RequestInUse`]. A request without a URL
    /// fails with [`Error::BadUrl`].
    pub async fn start(&self, request: &mut Request) -> Result<Response> {
        if let Some(path) = &self.shared.config.cookie_file {
            request
                .idle_mut()?
                .cookie_file(path)
                .map_err(|source| Error::BadOption {
                    option: "cookie_file",
                    source,
                })?;
        }
        let easy = request.take_easy()?;

        let id = TransferId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let lease = Arc::new(Lease {
            id,
            shared: self.shared.clone(),
        });
        request.attach(lease.clone());

        let (tx, rx) = oneshot::channel();
        self.shared.send(Command::Start {
            id,
            easy: Box::new(easy),
            reply: tx,
        })?;
        rx.await.map_err(|_| Error::SessionClosed)??;

        Ok(Response::new(lease))
    }

    /// Snapshot of the driver's transfers and sockets.
    pub async fn stats(&self) -> Result<SessionStats> {
        let (tx, rx) = oneshot::channel();
        self.shared.send(Command::Stats { reply: tx })?;
        rx.await.map_err(|_| Error::SessionClosed)?
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }
}
