use fnv::FnvHashMap;
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Strong serialization keyed by arbitrary string tags.
///
/// All lock holders for one tag run sequentially in submission order;
/// distinct tags do not contend. Used for ID-hashes (head mutation) and
/// reverse-map append files.
#[derive(Clone, Default)]
pub struct KeyedLock {
    inner: Arc<Mutex<FnvHashMap<String, VecDeque<oneshot::Sender<()>>>>>,
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the tag. Waiters are woken strictly FIFO.
    pub async fn lock(&self, tag: &str) -> KeyedGuard {
        let waiter = {
            let mut map = self.inner.lock();
            match map.get_mut(tag) {
                // an entry means the tag is held; queue up
                Some(queue) => {
                    let (tx, rx) = oneshot::channel();
                    queue.push_back(tx);
                    Some(rx)
                }
                None => {
                    map.insert(tag.into(), VecDeque::new());
                    None
                }
            }
        };
        if let Some(rx) = waiter {
            // the holder hands over directly; an Err means it vanished with
            // the whole map entry, so the tag is free again
            if rx.await.is_err() {
                return Box::pin(self.lock(tag)).await;
            }
        }
        KeyedGuard {
            tag: tag.into(),
            inner: self.inner.clone(),
        }
    }
}

pub struct KeyedGuard {
    tag: String,
    inner: Arc<Mutex<FnvHashMap<String, VecDeque<oneshot::Sender<()>>>>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut map = self.inner.lock();
        if let Some(queue) = map.get_mut(&self.tag) {
            // skip waiters that gave up before being woken
            while let Some(tx) = queue.pop_front() {
                if tx.send(()).is_ok() {
                    return;
                }
            }
            map.remove(&self.tag);
        }
    }
}
