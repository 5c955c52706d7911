//! Per-worker binding: one trunk on one tokio event loop
//!
//! Each worker thread owns one [`Worker`] driving one [`Trunk`]; nothing is
//! shared between workers. The run loop multiplexes three wake sources:
//! commands from [`WorkerHandle`]s, socket readiness polled through the
//! connections' [`crate::link::LinkIo`] hooks, and the trunk's earliest
//! timer deadline. All trunk work happens on this task, so the core never
//! needs a lock.

use crate::code::ResultCode;
use crate::codec::PacketCodec;
use crate::config::{Mode, TrunkConfig};
use crate::dispatch::{Dispatcher, Signal, Submission};
use crate::link::LinkFactory;
use crate::request::ClientRequest;
use crate::trunk::{EntryId, Trunk};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Commands accepted by a running worker
enum Command {
    Submit {
        request: ClientRequest,
        reply: oneshot::Sender<Submission>,
    },
    Signal {
        handle: EntryId,
        signal: Signal,
    },
    Shutdown,
}

/// Cheap, cloneable handle for talking to a worker from other tasks
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Command>,
}

impl WorkerHandle {
    /// Submit an exchange and keep the [`Submission`] for signalling.
    /// Returns `None` if the worker has shut down.
    pub async fn start(&self, request: ClientRequest) -> Option<Submission> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit { request, reply: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Submit an exchange and wait for its result
    pub async fn submit(&self, request: ClientRequest) -> ResultCode {
        match self.start(request).await {
            Some(submission) => submission.result.await.unwrap_or(ResultCode::Fail),
            None => ResultCode::Fail,
        }
    }

    /// Signal a yielded exchange (CANCEL or DUP)
    pub async fn signal(&self, handle: EntryId, signal: Signal) -> bool {
        self.tx
            .send(Command::Signal { handle, signal })
            .await
            .is_ok()
    }

    /// Ask the worker to fail outstanding requests and stop
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// One worker: a trunk, its dispatcher, and the command queue
pub struct Worker {
    trunk: Trunk,
    dispatcher: Dispatcher,
    commands: mpsc::Receiver<Command>,
}

impl Worker {
    /// Build a worker and its handle. Must be called within a tokio
    /// runtime: the link factory registers sockets with the reactor.
    pub fn new(
        config: TrunkConfig,
        codec: Box<dyn PacketCodec>,
        factory: Box<dyn LinkFactory>,
    ) -> (Worker, WorkerHandle) {
        let config = Arc::new(config);
        let (tx, rx) = mpsc::channel(64);
        let trunk = Trunk::new(config.clone(), codec, factory, Instant::now());
        (
            Worker {
                trunk,
                dispatcher: Dispatcher::new(config),
                commands: rx,
            },
            WorkerHandle { tx },
        )
    }

    /// Drive the trunk until shutdown (or until every handle is dropped)
    pub async fn run(mut self) {
        loop {
            self.trunk.process_timers(Instant::now());
            let deadline = self.trunk.next_deadline();

            enum Wake {
                Cmd(Option<Command>),
                Io(Vec<IoEvent>),
                Timer,
            }

            let wake = {
                let Worker {
                    trunk, commands, ..
                } = &mut self;
                tokio::select! {
                    cmd = commands.recv() => Wake::Cmd(cmd),
                    events = io_ready(trunk) => Wake::Io(events),
                    _ = wait_deadline(deadline) => Wake::Timer,
                }
            };

            match wake {
                Wake::Cmd(Some(Command::Submit { request, reply })) => {
                    let submission =
                        self.dispatcher
                            .submit(&mut self.trunk, request, Instant::now());
                    let _ = reply.send(submission);
                }
                Wake::Cmd(Some(Command::Signal { handle, signal })) => {
                    self.dispatcher
                        .signal(&mut self.trunk, handle, signal, Instant::now());
                }
                Wake::Cmd(Some(Command::Shutdown)) | Wake::Cmd(None) => {
                    debug!("Worker stopping");
                    self.trunk.shutdown(Instant::now());
                    return;
                }
                Wake::Io(events) => {
                    let now = Instant::now();
                    for event in events {
                        match event {
                            IoEvent::Writable(ci) => self.trunk.on_writable(ci, now),
                            IoEvent::Readable(ci) => self.trunk.on_readable(ci, now),
                        }
                    }
                }
                Wake::Timer => {} // handled at the top of the loop
            }
        }
    }
}

enum IoEvent {
    Writable(usize),
    Readable(usize),
}

fn io_ready(trunk: &Trunk) -> IoReady<'_> {
    IoReady { trunk }
}

/// Polls every connection's readiness interests in one future.
///
/// When no connection has any interest this future registers no waker,
/// which is sound: with no queued writes and no live reads, trunk state
/// only changes through commands or timers, and both wake the loop.
struct IoReady<'a> {
    trunk: &'a Trunk,
}

impl Future for IoReady<'_> {
    type Output = Vec<IoEvent>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let replicate = self.trunk.config().mode == Mode::Replicate;
        let mut events = Vec::new();

        for (ci, conn) in self.trunk.connections().iter().enumerate() {
            let Some(io) = conn.io_ref() else {
                continue;
            };
            if conn.wants_write() && io.poll_send_ready(cx).is_ready() {
                events.push(IoEvent::Writable(ci));
            }
            if conn.wants_read(replicate) && io.poll_recv_ready(cx).is_ready() {
                events.push(IoEvent::Readable(ci));
            }
        }

        if events.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(events)
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending::<()>().await,
    }
}
