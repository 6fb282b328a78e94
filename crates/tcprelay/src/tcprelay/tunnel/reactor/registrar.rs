//! Registry calls for the reactor run on their own thread, so waiting out an evicted
//! holder or a failing bind never holds up the poll loop.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
};

use mio::Waker;

use super::pairing::ConnId;
use crate::tcprelay::tunnel::{
    frame::ClientId,
    registry::{Lease, ListenerRegistry, RegistryError},
};

pub struct Request {
    pub conn: ConnId,
    pub target: SocketAddr,
    pub client_id: ClientId,
    pub owner: Option<SocketAddr>,
}

pub struct Outcome {
    pub conn: ConnId,
    pub target: SocketAddr,
    pub client_id: ClientId,
    pub result: Result<Lease, RegistryError>,
}

pub struct Registrar {
    tx: Option<Sender<Request>>,
    thread: Option<JoinHandle<()>>,
}

impl Registrar {
    /// Starts the `reactor-registrar` thread. Each outcome is sent on `done`, then
    /// `waker` fires.
    pub fn spawn(
        registry: Arc<ListenerRegistry>,
        done: Sender<Outcome>,
        waker: Arc<Waker>,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("reactor-registrar".into())
            .spawn(move || run(registry, rx, done, waker))?;
        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
        })
    }

    /// Hands `req` to the registrar thread. False when that thread is gone.
    pub fn submit(&self, req: Request) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(req).is_ok())
    }

    /// Stops taking requests and waits for the one in progress.
    pub fn shutdown(mut self) {
        self.tx = None;
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                tracing::error!("reactor: registrar thread panicked");
            }
        }
    }
}

fn run(
    registry: Arc<ListenerRegistry>,
    rx: Receiver<Request>,
    done: Sender<Outcome>,
    waker: Arc<Waker>,
) {
    tracing::debug!(thread = ?thread::current().name(), "reactor: registrar started");
    while let Ok(req) = rx.recv() {
        let result = registry.register(req.target, req.client_id, req.owner);
        let outcome = Outcome {
            conn: req.conn,
            target: req.target,
            client_id: req.client_id,
            result,
        };
        if let Err(mpsc::SendError(outcome)) = done.send(outcome) {
            // Poll thread is gone; nobody will adopt the listener.
            if let Ok(lease) = outcome.result {
                registry.release(lease);
            }
            break;
        }
        if let Err(err) = waker.wake() {
            tracing::warn!(err = %err, "reactor: wake poll thread failed");
        }
    }
    tracing::debug!(thread = ?thread::current().name(), "reactor: registrar stopped");
}
