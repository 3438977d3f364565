//! A fixed set of started instances sharing one entry point.
//!
//! Each instance is an independent Lua state with its own loop thread, so a
//! pool of N serves up to N invocations at once. [`InstancePool::get`] blocks
//! until an instance is free; the returned guard puts it back on drop.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{self, Receiver, Sender};

use super::entry_point::EntryPoint;
use super::runtime::Instance;
use crate::config::RuntimeConfig;

/// Started instances, each preloaded with the same entry point.
#[derive(Debug)]
pub struct InstancePool {
    size: usize,
    /// Dropped on close so returning guards stop instead of parking.
    sender: Mutex<Option<Sender<Instance>>>,
    receiver: Receiver<Instance>,
    closed: AtomicBool,
}

impl InstancePool {
    /// Start `config.effective_pool_size()` instances and load `entry` into
    /// each. Fails if any instance fails to start or the entry point does not
    /// compile.
    pub fn new(config: &RuntimeConfig, entry: &EntryPoint) -> Result<Self> {
        let size = config.effective_pool_size();
        let (sender, receiver) = channel::bounded(size);

        for index in 0..size {
            let instance = Instance::new(config.clone())
                .with_context(|| format!("Failed to create pool instance {index}"))?;
            instance.start()?;
            instance
                .load_entry_point(entry.clone())
                .with_context(|| format!("Failed to load {entry} into pool instance {index}"))?;
            sender
                .send(instance)
                .map_err(|_closed| anyhow!("Pool channel closed during setup"))?;
        }

        log::info!("[pool] Started {size} instances for {entry}");
        Ok(Self {
            size,
            sender: Mutex::new(Some(sender)),
            receiver,
            closed: AtomicBool::new(false),
        })
    }

    /// Block until an instance is free.
    pub fn get(&self) -> Result<PooledInstance<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("Instance pool is closed"));
        }
        let instance = self
            .receiver
            .recv()
            .map_err(|_disconnected| anyhow!("Instance pool is closed"))?;
        Ok(PooledInstance {
            pool: self,
            instance: Some(instance),
        })
    }

    /// Number of instances the pool was created with.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop every idle instance. Instances checked out at the time are stopped
    /// when their guard drops. Later `get` calls fail.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.lock().expect("pool sender mutex poisoned").take();

        let mut stopped = 0;
        while let Ok(instance) = self.receiver.try_recv() {
            instance.stop();
            stopped += 1;
        }
        log::info!("[pool] Closed, stopped {stopped} idle instances");
    }

    fn put_back(&self, instance: Instance) {
        let sender = self.sender.lock().expect("pool sender mutex poisoned");
        match sender.as_ref() {
            Some(sender) if !self.closed.load(Ordering::Acquire) => {
                if let Err(returned) = sender.try_send(instance) {
                    log::warn!("[pool] Could not return instance, stopping it");
                    returned.into_inner().stop();
                }
            }
            _ => {
                drop(sender);
                instance.stop();
            }
        }
    }
}

impl Drop for InstancePool {
    fn drop(&mut self) {
        self.close();
    }
}

/// An instance checked out of an [`InstancePool`].
#[derive(Debug)]
pub struct PooledInstance<'a> {
    pool: &'a InstancePool,
    instance: Option<Instance>,
}

impl Deref for PooledInstance<'_> {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        self.instance
            .as_ref()
            .expect("lunet: pooled instance used after release")
    }
}

impl Drop for PooledInstance<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.pool.put_back(instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize) -> RuntimeConfig {
        RuntimeConfig {
            pool_size: size,
            worker_threads: 1,
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn test_pool_rejects_bad_entry_point() {
        let err = InstancePool::new(&config(1), &EntryPoint::Code("return (".into()))
            .expect_err("syntax error must fail pool setup");
        assert!(format!("{err:#}").contains("load error"), "{err:#}");
    }

    #[test]
    fn test_get_after_close_fails() {
        let pool = InstancePool::new(&config(2), &EntryPoint::Code("return 1".into()))
            .expect("create pool");
        assert_eq!(pool.size(), 2);
        pool.close();
        assert!(pool.get().is_err());
    }

    #[test]
    fn test_guard_returns_instance() {
        let pool = InstancePool::new(&config(1), &EntryPoint::Code("return 1".into()))
            .expect("create pool");
        {
            let instance = pool.get().expect("first checkout");
            assert!(instance.is_running());
        }
        let again = pool.get().expect("instance returned to pool");
        assert!(again.is_running());
    }
}
