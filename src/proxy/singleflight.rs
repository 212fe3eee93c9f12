//! Request collapsing: concurrent calls sharing one key ride on a single
//! in-flight execution. The leader's future runs on its own task so a
//! cancelled waiter cannot abort the shared work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

pub struct Group<T> {
    calls: Arc<Mutex<HashMap<String, Arc<Call<T>>>>>,
}

struct Call<T> {
    notify: Notify,
    slot: Mutex<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the in-flight call for `key`, or become its leader.
    pub async fn do_call<F, Fut>(&self, key: String, f: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock().await;
            if let Some(call) = calls.get(&key) {
                Arc::clone(call)
            } else {
                let call = Arc::new(Call {
                    notify: Notify::new(),
                    slot: Mutex::new(None),
                });
                calls.insert(key.clone(), Arc::clone(&call));
                let registry = Arc::clone(&self.calls);
                let leader = Arc::clone(&call);
                tokio::spawn(async move {
                    let result = f().await;
                    {
                        let mut slot = leader.slot.lock().await;
                        *slot = Some(result);
                    }
                    leader.notify.notify_waiters();
                    registry.lock().await.remove(&key);
                });
                call
            }
        };

        loop {
            // register before checking the slot so the notify cannot be
            // missed between the two
            let notified = call.notify.notified();
            if let Some(result) = call.slot.lock().await.clone() {
                return result;
            }
            notified.await;
        }
    }
}
