//! The session's event loop.
//!
//! One driver owns the multi handle and runs on its own thread. It reacts to
//! three sources: commands from requests and responses, socket readiness for
//! the descriptors libcurl asked to watch, and libcurl's single timer. Every
//! call into libcurl may fire socket and timer callbacks; those only queue an
//! [`EngineEvent`] that the driver applies right after the call returns.

use std::collections::HashMap;
use std::future::poll_fn;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use curl::easy::Easy2;
use curl::multi::{Easy2Handle, Events, Multi};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::command::{Command, Reply};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::info;
use crate::session::SessionStats;
use crate::socket::{self, Direction, SocketRegistry, Watch};
use crate::transfer::{Transfer, TransferId};

/// Something libcurl asked for from inside a callback.
#[derive(Debug)]
enum EngineEvent {
    Watch { socket: RawFd, watch: Watch },
    Timer(Option<Duration>),
}

enum Entry {
    Active {
        handle: Easy2Handle<Transfer>,
        raw: *mut curl_sys::CURL,
    },
    Done(Easy2<Transfer>),
}

impl Entry {
    fn transfer(&mut self) -> &mut Transfer {
        match self {
            Entry::Active { handle, .. } => handle.get_mut(),
            Entry::Done(easy) => easy.get_mut(),
        }
    }

    fn raw(&self) -> *mut curl_sys::CURL {
        match self {
            Entry::Active { raw, .. } => *raw,
            Entry::Done(easy) => easy.raw(),
        }
    }
}

pub(crate) struct Driver {
    commands: mpsc::UnboundedReceiver<Command>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    deadline: Option<Instant>,
    // dropped before the multi handle, which must go before the registry:
    // cleaning up the multi handle closes cached connections through it
    transfers: HashMap<TransferId, Entry>,
    multi: Multi,
    sockets: Arc<Mutex<SocketRegistry>>,
}

impl Driver {
    pub fn new(config: &SessionConfig, commands: mpsc::UnboundedReceiver<Command>) -> Result<Self> {
        let (events_tx, engine_events) = mpsc::unbounded_channel();
        let mut multi = Multi::new();

        let tx = events_tx.clone();
        multi.socket_function(move |socket, events, _token| {
            let _ = tx.send(EngineEvent::Watch {
                socket,
                watch: Watch::from(events),
            });
        })?;
        multi.timer_function(move |timeout| {
            let _ = events_tx.send(EngineEvent::Timer(timeout));
            true
        })?;

        if let Some(max) = config.max_total_connections {
            multi.set_max_total_connections(max)?;
        }
        if let Some(max) = config.max_host_connections {
            multi.set_max_host_connections(max)?;
        }
        if let Some(max) = config.max_connects {
            multi.set_max_connects(max)?;
        }
        multi.pipelining(false, config.multiplex)?;

        Ok(Self {
            commands,
            engine_events,
            deadline: None,
            transfers: HashMap::new(),
            multi,
            sockets: Arc::new(Mutex::new(SocketRegistry::default())),
        })
    }

    pub async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            // commands first, so a burst from one caller is seen in order
            // before libcurl gets to run again
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                ready = poll_fn(|cx| self.sockets.lock().poll_ready(cx)) => {
                    for (fd, direction) in ready {
                        self.on_ready(fd, direction);
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.deadline = None;
                    self.perform(None);
                }
            }
        }
        debug!(transfers = self.transfers.len(), "session driver stopping");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Start { id, easy, reply } => {
                let result = self.start(id, *easy);
                let started = result.is_ok();
                let _ = reply.send(result);
                if started {
                    // kick off name resolution and connecting
                    self.perform(None);
                }
            }
            Command::Read { id, max, reply } => match self.transfers.get_mut(&id) {
                Some(Entry::Active { handle, .. }) => {
                    if handle.get_mut().inbox.read(max, reply) {
                        if let Err(e) = handle.unpause_read() {
                            warn!(transfer = %id, error = %e, "failed to resume receiving");
                        }
                        self.apply_engine_events();
                    }
                }
                Some(Entry::Done(easy)) => {
                    easy.get_mut().inbox.read(max, reply);
                }
                None => {
                    let _ = reply.send(Err(Error::RequestNotActive));
                }
            },
            Command::Write { id, data, reply } => match self.transfers.get_mut(&id) {
                Some(Entry::Active { handle, .. }) => {
                    if handle.get_mut().outbox.write(data, reply) {
                        if let Err(e) = handle.unpause_write() {
                            warn!(transfer = %id, error = %e, "failed to resume sending");
                        }
                        self.apply_engine_events();
                    }
                }
                Some(Entry::Done(easy)) => {
                    easy.get_mut().outbox.write(data, reply);
                }
                None => {
                    let _ = reply.send(Err(Error::RequestNotActive));
                }
            },
            Command::Abort { id, reply } => self.abort(id, reply),
            Command::Headers { id, reply } => match self.transfers.get_mut(&id) {
                Some(entry) => entry.transfer().headers.wait(reply),
                None => {
                    let _ = reply.send(Err(Error::RequestNotActive));
                }
            },
            Command::Completion { id, reply } => match self.transfers.get_mut(&id) {
                Some(entry) => entry.transfer().completion.wait(reply),
                None => {
                    let _ = reply.send(Err(Error::RequestNotActive));
                }
            },
            Command::Info { id, query, reply } => {
                let result = match self.transfers.get(&id) {
                    // the entry keeps the easy handle alive for the call
                    Some(entry) => unsafe { info::query(entry.raw(), query) }.map_err(Error::from),
                    None => Err(Error::RequestNotActive),
                };
                let _ = reply.send(result);
            }
            Command::Stats { reply } => {
                let _ = reply.send(Ok(self.stats()));
            }
            Command::Abandon { id } => self.abandon(id),
            Command::Release { id } => self.release(id),
        }
    }

    fn start(&mut self, id: TransferId, mut easy: Easy2<Transfer>) -> Result<()> {
        let raw = easy.raw();
        socket::attach_close_hook(raw, &self.sockets)?;
        easy.get_mut().attach(id, self.sockets.clone());

        let mut handle = self.multi.add2(easy)?;
        self.apply_engine_events();
        if let Err(e) = handle.set_token(id.0) {
            match self.multi.remove2(handle) {
                Ok(mut easy) => detach(&mut easy),
                Err(err) => warn!(transfer = %id, error = %err, "failed to unregister transfer"),
            }
            self.apply_engine_events();
            return Err(e.into());
        }

        debug!(transfer = %id, "transfer started");
        self.transfers.insert(id, Entry::Active { handle, raw });
        Ok(())
    }

    fn abort(&mut self, id: TransferId, reply: Reply<()>) {
        match self.transfers.get(&id) {
            Some(Entry::Active { .. }) => {}
            Some(Entry::Done(_)) => {
                let _ = reply.send(Ok(()));
                return;
            }
            None => {
                let _ = reply.send(Err(Error::RequestNotActive));
                return;
            }
        }
        let Some(Entry::Active { handle, .. }) = self.transfers.get_mut(&id) else {
            return;
        };

        let transfer = handle.get_mut();
        transfer.cancel_waiters();
        if transfer.outbox.abort(reply) {
            if let Err(e) = handle.unpause_write() {
                warn!(transfer = %id, error = %e, "failed to resume sending for abort");
            }
        }
        self.apply_engine_events();
        self.perform(None);

        // libcurl only picks the abort up when it wants body data; a
        // transfer that is not uploading is torn down right away
        if let Some(Entry::Active { handle, .. }) = self.transfers.get_mut(&id) {
            if handle.get_mut().outbox.is_abort_pending() {
                debug!(transfer = %id, "tearing down aborted transfer");
                self.finish(id, Err(Error::Cancelled));
            }
        }
    }

    /// Stop a transfer whose response was dropped. The finished record stays
    /// for the request until it is released too.
    fn abandon(&mut self, id: TransferId) {
        if let Some(Entry::Active { .. }) = self.transfers.get(&id) {
            info!(transfer = %id, "removing abandoned transfer");
            self.finish(id, Err(Error::Cancelled));
        }
    }

    fn release(&mut self, id: TransferId) {
        match self.transfers.remove(&id) {
            Some(Entry::Active { handle, .. }) => {
                info!(transfer = %id, "removing released transfer");
                match self.multi.remove2(handle) {
                    Ok(mut easy) => {
                        detach(&mut easy);
                        easy.get_mut().finish(Err(Error::Cancelled));
                    }
                    Err(e) => warn!(transfer = %id, error = %e, "failed to unregister transfer"),
                }
                self.apply_engine_events();
            }
            Some(Entry::Done(_)) => trace!(transfer = %id, "released finished transfer"),
            None => {}
        }
    }

    fn on_ready(&mut self, fd: RawFd, direction: Direction) {
        trace!(socket = fd, ?direction, "socket ready");
        self.perform(Some((fd, direction)));
        self.sockets.lock().recheck(fd, direction);
    }

    /// Run libcurl for one socket, or for timeouts when `socket` is `None`,
    /// then pick up whatever finished.
    fn perform(&mut self, socket: Option<(RawFd, Direction)>) {
        let result = match socket {
            Some((fd, direction)) => {
                let mut events = Events::new();
                match direction {
                    Direction::Read => events.input(true),
                    Direction::Write => events.output(true),
                };
                self.multi.action(fd, &events)
            }
            None => self.multi.timeout(),
        };
        if let Err(e) = result {
            error!(error = %e, "socket action failed");
        }
        self.apply_engine_events();
        self.clean_finished();
    }

    fn clean_finished(&mut self) {
        let mut finished = Vec::new();
        self.multi.messages(|message| {
            let Ok(token) = message.token() else {
                return;
            };
            if let Some(result) = message.result() {
                finished.push((TransferId(token), result));
            }
        });

        for (id, result) in finished {
            let outcome = result.map_err(|e| {
                if e.is_aborted_by_callback() {
                    Error::Cancelled
                } else {
                    Error::Easy(e)
                }
            });
            self.finish(id, outcome);
        }
    }

    /// Unregister a transfer, keeping its easy handle for late queries.
    fn finish(&mut self, id: TransferId, outcome: Result<()>) {
        let handle = match self.transfers.remove(&id) {
            Some(Entry::Active { handle, .. }) => handle,
            Some(done) => {
                self.transfers.insert(id, done);
                return;
            }
            None => {
                warn!(transfer = %id, "completion for unknown transfer");
                return;
            }
        };

        match self.multi.remove2(handle) {
            Ok(mut easy) => {
                detach(&mut easy);
                debug!(transfer = %id, ok = outcome.is_ok(), "transfer finished");
                easy.get_mut().finish(outcome);
                self.transfers.insert(id, Entry::Done(easy));
            }
            Err(e) => error!(transfer = %id, error = %e, "failed to unregister transfer"),
        }
        self.apply_engine_events();
    }

    fn apply_engine_events(&mut self) {
        while let Ok(event) = self.engine_events.try_recv() {
            match event {
                EngineEvent::Watch { socket, watch } => self.sockets.lock().watch(socket, watch),
                EngineEvent::Timer(timeout) => {
                    debug!(timeout_ms = ?timeout.map(|t| t.as_millis()), "timer");
                    self.deadline = timeout.map(|t| Instant::now() + t);
                }
            }
        }
    }

    fn stats(&self) -> SessionStats {
        let active = self
            .transfers
            .values()
            .filter(|entry| matches!(entry, Entry::Active { .. }))
            .count();
        SessionStats {
            active_transfers: active,
            finished_transfers: self.transfers.len() - active,
            sockets: self.sockets.lock().stats(),
        }
    }
}

fn detach(easy: &mut Easy2<Transfer>) {
    if let Err(e) = socket::detach_close_hook(easy.raw()) {
        warn!(error = %e, "failed to clear close socket hook");
    }
    easy.get_mut().detach();
}
