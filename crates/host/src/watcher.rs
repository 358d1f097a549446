//! Hotplug watcher thread
//!
//! Polls the backend through [`HostInner::scan`], rescanning immediately
//! while the topology keeps changing and sleeping for the poll period once
//! it is quiet. Holds only a weak reference to the host, so dropping the
//! last [`Host`](crate::Host) handle stops it.

use crate::host::HostInner;
use crate::sync::lock;
use std::sync::mpsc::{self, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};
use usb_protocol::{ErrorKind, Result, UsbError};

/// Where the watcher thread is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Scanning,
    Sleeping,
    Stopping,
    Stopped,
}

pub(crate) struct Watcher {
    stop: Sender<()>,
    state: Arc<Mutex<WatcherState>>,
    thread: JoinHandle<()>,
}

impl Watcher {
    pub(crate) fn spawn(host: Weak<HostInner>, period: Duration) -> Result<Self> {
        let (stop, stop_rx) = mpsc::channel();
        let state = Arc::new(Mutex::new(WatcherState::Sleeping));
        let thread_state = state.clone();

        let thread = thread::Builder::new()
            .name("usb-watcher".to_string())
            .spawn(move || run(host, stop_rx, thread_state, period))
            .map_err(|e| UsbError::new(ErrorKind::Io, format!("spawn watcher: {}", e)))?;

        Ok(Self {
            stop,
            state,
            thread,
        })
    }

    pub(crate) fn state(&self) -> WatcherState {
        *lock(&self.state)
    }

    /// True when called from the watcher thread itself
    pub(crate) fn is_current(&self) -> bool {
        self.thread.thread().id() == thread::current().id()
    }

    /// Ask the thread to exit at its next loop boundary
    pub(crate) fn signal(&self) {
        let _ = self.stop.send(());
    }

    /// Signal, then wait for the thread unless that would deadlock
    pub(crate) fn stop(self, join: bool) {
        self.signal();
        if join && !self.is_current() && self.thread.join().is_err() {
            error!("USB watcher thread panicked");
        }
    }
}

fn set(state: &Mutex<WatcherState>, next: WatcherState) {
    *lock(state) = next;
}

fn stop_requested(stop: &mpsc::Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(TryRecvError::Empty))
}

fn run(
    host: Weak<HostInner>,
    stop: mpsc::Receiver<()>,
    state: Arc<Mutex<WatcherState>>,
    period: Duration,
) {
    info!("USB watcher started (poll period {:?})", period);

    'outer: loop {
        set(&state, WatcherState::Scanning);
        loop {
            if stop_requested(&stop) {
                break 'outer;
            }
            let Some(inner) = host.upgrade() else {
                break 'outer;
            };
            match inner.scan() {
                Ok(true) => debug!("Topology changed, rescanning"),
                Ok(false) => break,
                Err(e) if e.kind() == ErrorKind::Canceled => break 'outer,
                Err(e) => {
                    error!("Hotplug scan failed: {}", e);
                    break;
                }
            }
        }

        set(&state, WatcherState::Sleeping);
        match stop.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    set(&state, WatcherState::Stopping);
    debug!("USB watcher stopping");
    set(&state, WatcherState::Stopped);
    info!("USB watcher stopped");
}
