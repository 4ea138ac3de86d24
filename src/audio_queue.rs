use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-producer / single-consumer ring of signed 8-bit stereo samples.
///
/// The emulation thread pushes one sample pair per synthesis tick; an audio
/// callback drains it. The queue is lossy when full so a stalled sink can
/// never block synthesis or corrupt channel state.
pub struct SampleProducer {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub struct SampleConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    // One spare slot so head == tail is unambiguously empty.
    buf: Box<[UnsafeCell<MaybeUninit<(i8, i8)>>]>,
    cap: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// Only the producer writes buf[head], only the consumer reads buf[tail],
// and both indices are exchanged through atomics.
unsafe impl Sync for Inner {}
unsafe impl Send for Inner {}

impl Inner {
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail { head - tail } else { (self.cap - tail) + head }
    }

    #[inline]
    fn advance(&self, idx: usize) -> usize {
        let next = idx + 1;
        if next == self.cap { 0 } else { next }
    }
}

/// Build a queue holding up to `capacity` stereo sample pairs.
pub fn sample_queue(capacity: usize) -> (SampleProducer, SampleConsumer) {
    let cap = capacity.saturating_add(1).max(2);
    let mut buf = Vec::with_capacity(cap);
    for _ in 0..cap {
        buf.push(UnsafeCell::new(MaybeUninit::uninit()));
    }
    let inner = Arc::new(Inner {
        buf: buf.into_boxed_slice(),
        cap,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (SampleProducer { inner: Arc::clone(&inner) }, SampleConsumer { inner })
}

impl SampleProducer {
    /// Push one stereo pair. Returns false (dropping the pair) when full.
    #[inline]
    pub fn push(&self, left: i8, right: i8) -> bool {
        let head = self.inner.head.load(Ordering::Relaxed);
        let next = self.inner.advance(head);
        if next == self.inner.tail.load(Ordering::Acquire) {
            return false;
        }
        unsafe {
            (*self.inner.buf[head].get()).write((left, right));
        }
        self.inner.head.store(next, Ordering::Release);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleConsumer {
    #[inline]
    pub fn pop(&self) -> Option<(i8, i8)> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        if tail == self.inner.head.load(Ordering::Acquire) {
            return None;
        }
        let pair = unsafe { (*self.inner.buf[tail].get()).assume_init_read() };
        self.inner.tail.store(self.inner.advance(tail), Ordering::Release);
        Some(pair)
    }

    /// Fill `out` with interleaved L/R bytes, zero-padding on underrun.
    /// Returns the number of sample pairs actually dequeued.
    pub fn fill_interleaved(&self, out: &mut [i8]) -> usize {
        let mut pairs = 0;
        for chunk in out.chunks_exact_mut(2) {
            match self.pop() {
                Some((l, r)) => {
                    chunk[0] = l;
                    chunk[1] = r;
                    pairs += 1;
                }
                None => {
                    chunk[0] = 0;
                    chunk[1] = 0;
                }
            }
        }
        pairs
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let (tx, rx) = sample_queue(4);
        assert!(tx.push(1, -1));
        assert!(tx.push(2, -2));
        assert_eq!(rx.pop(), Some((1, -1)));
        assert_eq!(rx.pop(), Some((2, -2)));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn drops_newest_when_full() {
        let (tx, rx) = sample_queue(2);
        assert!(tx.push(1, 1));
        assert!(tx.push(2, 2));
        assert!(!tx.push(3, 3));
        assert_eq!(rx.pop(), Some((1, 1)));
        assert_eq!(rx.pop(), Some((2, 2)));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn fill_zero_pads_on_underrun() {
        let (tx, rx) = sample_queue(8);
        tx.push(5, 6);
        let mut out = [99i8; 6];
        assert_eq!(rx.fill_interleaved(&mut out), 1);
        assert_eq!(out, [5, 6, 0, 0, 0, 0]);
    }

    #[test]
    fn works_across_threads() {
        let (tx, rx) = sample_queue(1024);
        let handle = std::thread::spawn(move || {
            for i in 0..1000i32 {
                while !tx.push((i & 0x7F) as i8, 0) {
                    std::thread::yield_now();
                }
            }
        });
        let mut got = 0;
        while got < 1000 {
            if let Some((l, _)) = rx.pop() {
                assert_eq!(l, (got & 0x7F) as i8);
                got += 1;
            }
        }
        handle.join().unwrap();
    }
}
