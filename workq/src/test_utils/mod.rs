use crate::queue::{JobQueue, ThreadPoolQueue, register_queue, unregister_queue};
use crate::task::QueueId;
use std::sync::Arc;

// Test queues draw ids from the process-global counter so concurrently
// running tests never collide in the global registry.

/// Spins up a pool, registers it, and hands back its id.
pub(crate) fn spawn_pool(workers: usize) -> QueueId {
    let pool = ThreadPoolQueue::new(workers).expect("failed to spawn worker threads");
    let id = pool.id();
    register_queue(Arc::new(pool));
    id
}

/// Unregisters the pool; dropping the registry's reference stops it and
/// joins its workers (unless a task closure still pins it).
pub(crate) fn retire_pool(id: QueueId) {
    unregister_queue(id);
}
