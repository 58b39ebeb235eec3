//! A periodic gauge collector, driven off the write [`crate::wal::log::Hook`]
//! and the leader's per-client lag gauge. External collaborator: the core only
//! calls into `hook` / updates the gauge, it never assumes a specific metrics
//! backend (`SPEC_FULL.md` §4.9).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;

pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            value: AtomicI64::new(0),
        })
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

struct Registration {
    name: String,
    collect: Box<dyn Fn() -> i64 + Send + Sync>,
}

/// Polls registered `{name, collect_fn}` pairs on a fixed interval and logs
/// their values at `debug!`. Swapping in a real metrics exporter means
/// replacing this sink, not any core call site.
pub struct Collector {
    module: String,
    interval: Duration,
    registrations: Arc<Mutex<Vec<Registration>>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(module: impl Into<String>, interval: Duration) -> Self {
        Self {
            module: module.into(),
            interval,
            registrations: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn add(&self, name: impl Into<String>, collect: impl Fn() -> i64 + Send + Sync + 'static) {
        self.registrations.lock().unwrap().push(Registration {
            name: name.into(),
            collect: Box::new(collect),
        });
    }

    /// Starts the background polling thread. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let registrations = Arc::clone(&self.registrations);
        let closed = Arc::clone(&self.closed);
        let module = self.module.clone();
        let interval = self.interval;
        *handle = Some(std::thread::spawn(move || loop {
            if closed.load(Ordering::Acquire) {
                break;
            }
            for reg in registrations.lock().unwrap().iter() {
                debug!("wal: metric {module}.{} = {}", reg.name, (reg.collect)());
            }
            std::thread::sleep(interval);
        }));
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
