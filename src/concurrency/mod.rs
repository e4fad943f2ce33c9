pub mod pool;
pub mod sweep_lock;

pub use pool::{Admission, PoolClosed, PoolStats, WorkerPool};
pub use sweep_lock::{SweepLock, SweepLockGuard};
