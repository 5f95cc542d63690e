/*
 * Copyright (c) 2024 Yunshan Networks
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

use std::marker::PhantomData;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{
    bounded as channel, Receiver as CReceiver, RecvTimeoutError, Sender as CSender,
    TrySendError,
};

use super::Error;
use crate::counter as stats;

// Dropping every Sender terminates the queue once the receiver has drained what is left.
pub fn bounded<T>(size: usize) -> (Sender<T>, Receiver<T>, StatsHandle<T>) {
    let (s, r) = channel(size);
    let inner = Arc::new(Inner {
        counter: Counter::default(),
        terminated: AtomicBool::new(false),
    });
    (
        Sender {
            sender: s,
            inner: inner.clone(),
        },
        Receiver {
            receiver: r,
            inner: inner.clone(),
        },
        StatsHandle {
            inner,
            _marker: PhantomData,
        },
    )
}

#[derive(Debug, Default)]
pub struct Counter {
    pub input: AtomicU64,
    pub output: AtomicU64,
    pub rejected: AtomicU64,
}

struct Inner {
    counter: Counter,
    terminated: AtomicBool,
}

pub struct Sender<T> {
    sender: CSender<T>,
    inner: Arc<Inner>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> Sender<T> {
    pub fn terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Relaxed)
    }

    // blocks while the queue is full
    pub fn send(&self, msg: T) -> Result<(), Error<T>> {
        match self.sender.send(msg) {
            Ok(_) => {
                self.inner.counter.input.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.inner.terminated.store(true, Ordering::Release);
                Err(Error::Terminated(Some(e.into_inner())))
            }
        }
    }

    // never blocks, hands the message back when the queue is full
    pub fn try_send(&self, msg: T) -> Result<(), Error<T>> {
        match self.sender.try_send(msg) {
            Ok(_) => {
                self.inner.counter.input.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(msg)) => {
                self.inner.counter.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::Full(Some(msg)))
            }
            Err(TrySendError::Disconnected(msg)) => {
                self.inner.terminated.store(true, Ordering::Release);
                Err(Error::Terminated(Some(msg)))
            }
        }
    }
}

pub struct Receiver<T> {
    receiver: CReceiver<T>,
    inner: Arc<Inner>,
}

impl<T> Receiver<T> {
    pub fn terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    // Pending messages are still delivered after every sender has been dropped,
    // Terminated is returned only once the queue is both closed and empty.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, Error<T>> {
        let res = match timeout {
            Some(t) => self.receiver.recv_timeout(t),
            None => self
                .receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match res {
            Ok(v) => {
                self.inner.counter.output.fetch_add(1, Ordering::Relaxed);
                Ok(v)
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                self.inner.terminated.store(true, Ordering::Release);
                Err(Error::Terminated(None))
            }
        }
    }
}

pub struct StatsHandle<T> {
    inner: Arc<Inner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> stats::OwnedCountable for StatsHandle<T> {
    fn get_counters(&self) -> Vec<stats::Counter> {
        let input = self.inner.counter.input.load(Ordering::Relaxed);
        let output = self.inner.counter.output.load(Ordering::Relaxed);
        vec![
            (
                "in",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(input),
            ),
            (
                "out",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(output),
            ),
            (
                "rejected",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.inner.counter.rejected.load(Ordering::Relaxed)),
            ),
            (
                "pending",
                stats::CounterType::Gauged,
                stats::CounterValue::Unsigned(input.saturating_sub(output)),
            ),
        ]
    }

    fn closed(&self) -> bool {
        self.inner.terminated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterValue, OwnedCountable};
    use std::thread;

    #[test]
    fn drains_pending_after_senders_dropped() {
        let (s, r, _) = bounded::<u64>(16);
        let producers = 4;
        let per_producer = 1000;
        let mut handles = Vec::new();
        for _ in 0..producers {
            let sender = s.clone();
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    sender.send(i as u64).unwrap();
                }
            }));
        }
        drop(s);

        let mut sum = 0;
        while let Ok(v) = r.recv(None) {
            sum += v;
        }
        for h in handles {
            h.join().unwrap();
        }
        let expected: u64 = (0..per_producer as u64).sum::<u64>() * producers as u64;
        assert_eq!(sum, expected);
        assert!(r.terminated());
    }

    #[test]
    fn try_send_rejects_when_full() {
        let (s, r, stats) = bounded::<u32>(1);
        assert!(s.try_send(1).is_ok());
        assert_eq!(s.try_send(2), Err(Error::Full(Some(2))));
        assert_eq!(r.recv(Some(Duration::from_millis(10))), Ok(1));
        assert_eq!(r.recv(Some(Duration::from_millis(10))), Err(Error::Timeout));

        let counters = stats.get_counters();
        assert_eq!(counters[0].2, CounterValue::Unsigned(1));
        assert_eq!(counters[2].2, CounterValue::Unsigned(1));
    }

    #[test]
    fn send_fails_after_receiver_dropped() {
        let (s, r, _) = bounded::<u32>(4);
        drop(r);
        assert_eq!(s.send(3), Err(Error::Terminated(Some(3))));
        assert!(s.terminated());
    }
}
