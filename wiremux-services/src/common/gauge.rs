use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

/// Occupancy counter with RAII guards and threshold waiters.
///
/// `add` increments and returns a guard that decrements on drop; waiters
/// are woken on every decrement and re-check their threshold. Clones share
/// the counter. Not thread-safe.
#[derive(Clone, Default)]
pub struct Gauge {
    inner: Rc<Inner>,
}

#[derive(Default)]
struct Inner {
    count: Cell<usize>,
    waiters: RefCell<Vec<Waker>>,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.inner.count.get()
    }

    pub fn add(&self) -> GaugeGuard {
        self.inner.count.set(self.inner.count.get() + 1);
        GaugeGuard {
            inner: self.inner.clone(),
        }
    }

    /// Resolves once `count < limit`.
    pub fn wait_below(&self, limit: usize) -> CountBelow {
        CountBelow {
            inner: self.inner.clone(),
            limit,
        }
    }

    /// Resolves once the gauge is empty.
    pub fn wait_zero(&self) -> CountBelow {
        self.wait_below(1)
    }
}

pub struct GaugeGuard {
    inner: Rc<Inner>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.inner.count.set(self.inner.count.get() - 1);
        for waker in self.inner.waiters.take() {
            waker.wake();
        }
    }
}

pub struct CountBelow {
    inner: Rc<Inner>,
    limit: usize,
}

impl Future for CountBelow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.count.get() < self.limit {
            return Poll::Ready(());
        }
        self.inner.waiters.borrow_mut().push(cx.waker().clone());
        Poll::Pending
    }
}
