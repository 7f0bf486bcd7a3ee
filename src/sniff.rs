// ABOUTME: Observer broadcaster: bounded per-observer queues, non-blocking enqueue, optional file archival
// ABOUTME: The transactor and upstream sessions hold only a cheap Sniffer handle, never the observer set directly

use crate::events::Event;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

const OBSERVER_QUEUE_DEPTH: usize = 256;
const PUMP_QUEUE_DEPTH: usize = 1024;

struct Observer {
    id: u64,
    peer: SocketAddr,
    tx: mpsc::Sender<String>,
}

/// Cheap, cloneable producer handle. Transactions and sessions call
/// `emit` to hand an event to the pump; this never suspends (spec.md §5).
#[derive(Clone)]
pub struct Sniffer {
    tx: mpsc::Sender<Event>,
}

impl Sniffer {
    pub fn emit(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            warn!("sniff pump queue full, dropping event");
        }
    }
}

/// Owns the observer set and drives both the TCP accept loop for observers
/// and the fan-out pump. Spawned once by the supervisor.
pub struct Broadcaster {
    observers: Mutex<Vec<Observer>>,
    next_id: AtomicU64,
    log_path: Option<PathBuf>,
}

impl Broadcaster {
    /// Builds a broadcaster plus the producer handle to distribute to other
    /// components. `log_path` of `None` disables file archival (spec.md §6,
    /// `log-path` == `-`).
    pub fn new(log_path: Option<PathBuf>) -> (Sniffer, mpsc::Receiver<Event>, std::sync::Arc<Broadcaster>) {
        let (tx, rx) = mpsc::channel(PUMP_QUEUE_DEPTH);
        let broadcaster = std::sync::Arc::new(Broadcaster {
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            log_path,
        });
        (Sniffer { tx }, rx, broadcaster)
    }

    /// Accepts observer connections on `bind`, spawning a writer task for
    /// each. Runs until the listener errors or the supervisor aborts it.
    pub async fn run_accept_loop(self: std::sync::Arc<Self>, bind: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(bind).await?;
        info!(%bind, "sniff endpoint listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            self.clone().register_observer(stream, peer);
        }
    }

    fn register_observer(self: std::sync::Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<String>(OBSERVER_QUEUE_DEPTH);
        {
            let mut observers = self.observers.lock().unwrap();
            observers.push(Observer { id, peer, tx });
        }
        info!(%peer, observer_id = id, "observer connected");
        tokio::spawn(async move {
            let mut writer = BufWriter::new(stream);
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if writer.write_all(b"\n").await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });
    }

    /// Fans one event out to every observer, evicting any whose queue is
    /// full or whose connection has dropped (spec.md §4.7), and appends it
    /// to the archival log if configured.
    async fn dispatch(&self, event: &Event, log: &mut Option<BufWriter<tokio::fs::File>>) {
        let line = event.to_json_line();
        let dead: Vec<u64> = {
            let observers = self.observers.lock().unwrap();
            observers
                .iter()
                .filter_map(|o| match o.tx.try_send(line.clone()) {
                    Ok(()) => None,
                    Err(_) => Some(o.id),
                })
                .collect()
        };
        if !dead.is_empty() {
            let mut observers = self.observers.lock().unwrap();
            observers.retain(|o| {
                let evict = dead.contains(&o.id);
                if evict {
                    warn!(observer_id = o.id, peer = %o.peer, "observer queue overrun, evicting");
                }
                !evict
            });
        }
        if let Some(writer) = log {
            if writer.write_all(line.as_bytes()).await.is_ok() {
                let _ = writer.write_all(b"\n").await;
                let _ = writer.flush().await;
            }
        }
    }

    /// Drains `rx` forever, dispatching each event. This is the broadcaster
    /// pump task named in spec.md §5's task inventory.
    pub async fn run_pump(self: std::sync::Arc<Self>, mut rx: mpsc::Receiver<Event>) {
        let mut log = match &self.log_path {
            Some(path) => match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
            {
                Ok(file) => Some(BufWriter::new(file)),
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "could not open sniff log file");
                    None
                }
            },
            None => None,
        };
        while let Some(event) = rx.recv().await {
            self.dispatch(&event, &mut log).await;
        }
    }

    /// Broadcasts a shutdown INFO event then closes every observer's
    /// channel, which drops their writer tasks' loop and the socket
    /// (spec.md §4.8).
    pub fn shutdown(&self) {
        let event = Event::info("broker", "observers", "shutting down");
        let line = event.to_json_line();
        let mut observers = self.observers.lock().unwrap();
        for o in observers.iter() {
            let _ = o.tx.try_send(line.clone());
        }
        observers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Role;

    #[tokio::test]
    async fn emit_is_non_blocking_when_pump_idle() {
        let (sniffer, mut rx, _broadcaster) = Broadcaster::new(None);
        sniffer.emit(Event::info("a", "b", "hello"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.role, Role::Info);
    }

    #[tokio::test]
    async fn dispatch_evicts_observer_with_full_queue() {
        let (_sniffer, _rx, broadcaster) = Broadcaster::new(None);
        let (tx, _rx2) = mpsc::channel::<String>(1);
        {
            let mut observers = broadcaster.observers.lock().unwrap();
            observers.push(Observer {
                id: 99,
                peer: "127.0.0.1:1".parse().unwrap(),
                tx,
            });
        }
        // Fill then overflow the observer's queue of depth 1.
        let event = Event::info("a", "b", "one");
        let mut log = None;
        broadcaster.dispatch(&event, &mut log).await;
        broadcaster.dispatch(&event, &mut log).await;
        let observers = broadcaster.observers.lock().unwrap();
        assert!(observers.is_empty());
    }
}
