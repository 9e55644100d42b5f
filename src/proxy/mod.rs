//! Host-side proxy: the worker pool owning the real sockets.

pub(crate) mod socket;
pub(crate) mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::debug;

use crate::channel::Channel;
use crate::error::Result;
use crate::FabricConfig;

use socket::ListenerRegistry;

/// The worker pool. Workers are spawned pinned (when configured) and run
/// until the proxy is dropped.
pub struct Proxy {
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Proxy {
    /// Spawn one worker per channel row. `worker_channels[w]` holds
    /// worker `w`'s endpoint of its channel to every link, indexed by
    /// link id.
    pub(crate) fn spawn(
        worker_channels: Vec<Vec<Channel>>,
        cfg: FabricConfig,
    ) -> Result<Proxy> {
        let stop = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(ListenerRegistry::new());
        let cores = if cfg.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let mut workers = Vec::with_capacity(worker_channels.len());
        for (id, channels) in worker_channels.into_iter().enumerate() {
            let core = if cores.is_empty() {
                None
            } else {
                Some(cores[id % cores.len()])
            };
            let handle = worker::spawn_worker(
                id,
                channels,
                registry.clone(),
                cfg.clone(),
                stop.clone(),
                core,
            )?;
            workers.push(handle);
        }
        debug!("proxy started with {} workers", workers.len());
        Ok(Proxy { workers, stop })
    }

    /// Stop the workers and wait for them to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
