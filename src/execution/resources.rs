//! CPU/Memory Reservations
//!
//! Optional admission control for calls: each live task invocation claims
//! its runtime `cpu` and `memory` before it starts and releases them when
//! it finishes. A call whose claim does not fit waits until enough capacity
//! is released. Claims larger than the host are clamped to the host total
//! so they can still run alone.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use sysinfo::System;
use tokio::sync::Notify;

use crate::config::ResourceConfig;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Usage {
    cpu: u64,
    memory: u64,
}

/// Tracks aggregate reservations of running calls.
#[derive(Debug)]
pub struct ResourceManager {
    total_cpu: u64,
    total_memory: u64,
    used: Mutex<Usage>,
    released: Notify,
}

impl ResourceManager {
    pub fn new(total_cpu: u64, total_memory: u64) -> Self {
        Self {
            total_cpu: total_cpu.max(1),
            total_memory,
            used: Mutex::new(Usage::default()),
            released: Notify::new(),
        }
    }

    /// The configured manager, if enabled. Unset limits default to the
    /// host's CPU count and physical memory.
    pub fn from_config(config: &ResourceConfig) -> Option<Arc<Self>> {
        if !config.enabled {
            return None;
        }
        let cpu = config.cpu.unwrap_or_else(|| num_cpus::get() as u64);
        let memory = config.memory_bytes.unwrap_or_else(|| {
            let mut system = System::new();
            system.refresh_memory();
            system.total_memory()
        });
        debug!("Resource manager: {} cpu, {} bytes memory", cpu, memory);
        Some(Arc::new(Self::new(cpu, memory)))
    }

    fn usage(&self) -> MutexGuard<'_, Usage> {
        self.used.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn available(&self) -> (u64, u64) {
        let used = self.usage();
        (self.total_cpu - used.cpu, self.total_memory - used.memory)
    }

    fn try_reserve(&self, claim: Usage) -> bool {
        let mut used = self.usage();
        if used.cpu + claim.cpu <= self.total_cpu && used.memory + claim.memory <= self.total_memory {
            used.cpu += claim.cpu;
            used.memory += claim.memory;
            true
        } else {
            false
        }
    }

    /// Waits until `cpu` and `memory` fit, then claims them until the
    /// returned guard is dropped.
    pub async fn reserve(self: &Arc<Self>, cpu: u64, memory: u64) -> Reservation {
        let claim = Usage {
            cpu: cpu.min(self.total_cpu),
            memory: memory.min(self.total_memory),
        };
        if claim.cpu < cpu || claim.memory < memory {
            warn!(
                "Reservation of {} cpu / {} bytes exceeds host capacity; clamped",
                cpu, memory
            );
        }
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.try_reserve(claim) {
                return Reservation {
                    manager: Arc::clone(self),
                    claim,
                };
            }
            released.await;
        }
    }

    fn release(&self, claim: Usage) {
        {
            let mut used = self.usage();
            used.cpu -= claim.cpu;
            used.memory -= claim.memory;
        }
        self.released.notify_waiters();
    }
}

/// Claimed capacity, returned to the manager on drop.
#[derive(Debug)]
pub struct Reservation {
    manager: Arc<ResourceManager>,
    claim: Usage,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.manager.release(self.claim);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reserve_and_release() {
        let manager = Arc::new(ResourceManager::new(4, 1000));
        let first = manager.reserve(3, 600).await;
        assert_eq!(manager.available(), (1, 400));
        drop(first);
        assert_eq!(manager.available(), (4, 1000));
    }

    #[tokio::test]
    async fn test_waits_for_capacity() {
        let manager = Arc::new(ResourceManager::new(4, 1000));
        let first = manager.reserve(3, 100).await;

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                let _second = manager.reserve(2, 100).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.available(), (4, 1000));
    }

    #[tokio::test]
    async fn test_oversized_claims_are_clamped() {
        let manager = Arc::new(ResourceManager::new(2, 100));
        let reservation = manager.reserve(16, 1 << 40).await;
        assert_eq!(manager.available(), (0, 0));
        drop(reservation);
    }

    #[test]
    fn test_disabled_by_default() {
        assert!(ResourceManager::from_config(&ResourceConfig::default()).is_none());
    }
}
