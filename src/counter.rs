/*
 * Copyright (C) 2025 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::sync::{Condvar, Mutex};

/// Counting gate bounding simultaneously open connections. `count_up_or_await`
/// blocks while the count is at the maximum; every successful count-up must be
/// balanced by exactly one `count_down` over the life of a socket.
pub struct LimitLatch {
    max: usize,
    count: Mutex<usize>,
    cond: Condvar,
    released: Mutex<bool>,
}

impl LimitLatch {
    pub fn new(max: usize) -> Self {
        assert!(max > 0);

        Self {
            max,
            count: Mutex::new(0),
            cond: Condvar::new(),
            released: Mutex::new(false),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock().unwrap()
    }

    pub fn count_up_or_await(&self) {
        let mut count = self.count.lock().unwrap();

        while *count >= self.max && !*self.released.lock().unwrap() {
            count = self.cond.wait(count).unwrap();
        }

        *count += 1;
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock().unwrap();

        if *count > 0 {
            *count -= 1;
        }

        self.cond.notify_one();
    }

    /// Make the gate permeable so blocked acceptors wake up. Used at
    /// shutdown.
    pub fn release_all(&self) {
        *self.released.lock().unwrap() = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_count_up_down() {
        let latch = LimitLatch::new(2);

        latch.count_up_or_await();
        latch.count_up_or_await();
        assert_eq!(latch.count(), 2);

        latch.count_down();
        assert_eq!(latch.count(), 1);

        latch.count_down();
        assert_eq!(latch.count(), 0);

        // extra count-downs do not underflow
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_blocks_at_max() {
        let latch = Arc::new(LimitLatch::new(1));

        latch.count_up_or_await();

        let latch2 = Arc::clone(&latch);
        let waiter = thread::spawn(move || {
            latch2.count_up_or_await();
            latch2.count_down();
        });

        // give the waiter a moment to block, then open a slot
        thread::sleep(Duration::from_millis(50));
        assert_eq!(latch.count(), 1);

        latch.count_down();
        waiter.join().unwrap();

        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_release_all_unblocks() {
        let latch = Arc::new(LimitLatch::new(1));

        latch.count_up_or_await();

        let latch2 = Arc::clone(&latch);
        let waiter = thread::spawn(move || {
            latch2.count_up_or_await();
        });

        thread::sleep(Duration::from_millis(50));
        latch.release_all();

        waiter.join().unwrap();
    }
}
