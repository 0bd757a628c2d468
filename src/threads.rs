use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

const RECEIVE_IDLE: Duration = Duration::from_millis(1);

/// An endpoint that can be driven by [`spawn`].
pub trait NetDriver: Send + Sync + 'static {
    /// Handles at most one incoming datagram. Returns whether one was available.
    fn receive_step(&self, time: f64) -> Result<bool>;
    /// Runs the commands and timeouts, then sends whatever is due.
    fn transmit_step(&self, time: f64) -> Result<()>;
    /// Signalled whenever outbound work is queued.
    fn notifier(&self) -> &Notifier;
    fn tick_interval(&self) -> f64;
}

/// Wakes the transmission thread early.
#[derive(Default)]
pub struct Notifier {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.condvar.notify_one();
    }
    /// Waits for a notification, at most `timeout`. Returns whether one arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.condvar.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

/// The reception and transmission threads of one endpoint. Stopped on drop.
pub struct NetThreads {
    running: Arc<AtomicBool>,
    driver: Arc<dyn NetDriver>,
    handles: Vec<JoinHandle<()>>,
}

/// Runs `driver` on two threads: one receiving as fast as datagrams arrive, one
/// transmitting every tick interval or as soon as it is notified. Both read the time from
/// a clock starting at zero.
pub fn spawn<D: NetDriver>(driver: Arc<D>) -> io::Result<NetThreads> {
    let running = Arc::new(AtomicBool::new(true));
    let start = Instant::now();
    let mut handles = Vec::with_capacity(2);

    let reception = {
        let driver = driver.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("realmnet-recv".into())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    match driver.receive_step(start.elapsed().as_secs_f64()) {
                        Ok(true) => {}
                        Ok(false) => thread::sleep(RECEIVE_IDLE),
                        Err(e) => {
                            log::error!("reception failed: {e}");
                            thread::sleep(RECEIVE_IDLE);
                        }
                    }
                }
                log::debug!("reception thread stopped");
            })?
    };
    handles.push(reception);

    let transmission = {
        let driver = driver.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("realmnet-send".into())
            .spawn(move || {
                let interval = Duration::from_secs_f64(driver.tick_interval().max(0.0));
                while running.load(Ordering::Relaxed) {
                    if let Err(e) = driver.transmit_step(start.elapsed().as_secs_f64()) {
                        log::error!("transmission failed: {e}");
                    }
                    driver.notifier().wait(interval);
                }
                log::debug!("transmission thread stopped");
            })
    };
    let transmission = match transmission {
        Ok(handle) => handle,
        Err(e) => {
            running.store(false, Ordering::Relaxed);
            for handle in handles {
                let _ = handle.join();
            }
            return Err(e);
        }
    };
    handles.push(transmission);

    Ok(NetThreads {
        running,
        driver,
        handles,
    })
}

impl NetThreads {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops both threads and waits for them.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.driver.notifier().notify();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("a network thread panicked");
            }
        }
    }
}

impl Drop for NetThreads {
    fn drop(&mut self) {
        self.stop();
    }
}
