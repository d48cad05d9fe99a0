use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::traits::SwpEnvironment;

struct MockSwpEnvironmentInner {
    now: Instant,
}

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct MockSwpEnvironment {
    inner: Arc<Mutex<MockSwpEnvironmentInner>>,
}

impl MockSwpEnvironment {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockSwpEnvironmentInner {
                now: Instant::now(),
            })),
        }
    }

    pub fn increment_now(&self, dur: Duration) {
        self.inner.lock().now += dur;
    }
}

impl SwpEnvironment for MockSwpEnvironment {
    fn now(&self) -> Instant {
        self.inner.lock().now
    }
}
