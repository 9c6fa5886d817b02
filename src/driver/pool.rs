//! Bounded pool of per-bundle runtime instances (script engines, child processes).

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::HookExecutionError;

/// Fixed set of runtime instances; a caller holds one exclusively until the
/// returned guard is dropped.
pub struct InstancePool<T> {
    permits: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<T>>>,
    size: usize,
}

impl<T> Clone for InstancePool<T> {
    fn clone(&self) -> Self {
        Self { permits: self.permits.clone(), idle: self.idle.clone(), size: self.size }
    }
}

impl<T> fmt::Debug for InstancePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstancePool")
            .field("size", &self.size)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

fn lock<T>(m: &Mutex<Vec<T>>) -> MutexGuard<'_, Vec<T>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Send + 'static> InstancePool<T> {
    pub fn new(items: Vec<T>) -> Self {
        let size = items.len();
        Self { permits: Arc::new(Semaphore::new(size)), idle: Arc::new(Mutex::new(items)), size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Instances not currently checked out.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free instance. Fails once the pool is closed.
    pub async fn acquire(&self) -> Result<PooledInstance<T>, HookExecutionError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HookExecutionError::Unreachable("runtime pool is closed".into()))?;
        let item = lock(&self.idle)
            .pop()
            .ok_or_else(|| HookExecutionError::Unreachable("runtime pool is empty".into()))?;
        Ok(PooledInstance { item: Some(item), idle: self.idle.clone(), _permit: permit })
    }

    /// Refuse new callers and hand back every idle instance.
    pub fn close(&self) -> Vec<T> {
        self.permits.close();
        std::mem::take(&mut *lock(&self.idle))
    }
}

/// Exclusive use of one pooled instance; goes back to the pool on drop,
/// whatever the outcome of the call.
pub struct PooledInstance<T> {
    item: Option<T>,
    idle: Arc<Mutex<Vec<T>>>,
    _permit: OwnedSemaphorePermit,
}

impl<T> Deref for PooledInstance<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // only `None` while dropping
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for PooledInstance<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for PooledInstance<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            lock(&self.idle).push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn instances_come_back_on_drop() {
        let pool = InstancePool::new(vec![1, 2]);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(*a + *b, 3);
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn waiters_block_until_an_instance_is_free() {
        let pool = InstancePool::new(vec![String::from("only")]);
        let held = pool.acquire().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(30), pool.acquire()).await;
        assert!(waiting.is_err());

        drop(held);
        let again = pool.acquire().await.unwrap();
        assert_eq!(again.as_str(), "only");
    }

    #[tokio::test]
    async fn instance_returns_even_when_the_caller_fails() {
        let pool = InstancePool::new(vec![0u32]);
        let p = pool.clone();
        let res: Result<(), &str> = async move {
            let mut inst = p.acquire().await.map_err(|_| "acquire")?;
            *inst += 1;
            Err("hook blew up")
        }
        .await;
        assert!(res.is_err());
        assert_eq!(*pool.acquire().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses_callers() {
        let pool = InstancePool::new(vec![(), ()]);
        let idle = pool.close();
        assert_eq!(idle.len(), 2);
        assert!(matches!(pool.acquire().await, Err(HookExecutionError::Unreachable(_))));
    }
}
