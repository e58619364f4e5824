use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

/// One-way broadcast flag.
///
/// Setting the flag is idempotent and wakes every waiter; once set it can
/// never be cleared. Clones share the flag. Waiters deregister on drop, so
/// a long-lived unset flag holds only the wakers of futures that are still
/// parked on it. Not thread-safe.
#[derive(Clone, Default)]
pub struct Flag {
    inner: Rc<Inner>,
}

#[derive(Default)]
struct Inner {
    set: Cell<bool>,
    next_key: Cell<usize>,
    waiters: RefCell<HashMap<usize, Waker>>,
}

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.get()
    }

    pub fn set(&self) {
        if !self.inner.set.replace(true) {
            for (_, waker) in self.inner.waiters.take() {
                waker.wake();
            }
        }
    }

    /// Resolves once the flag is set; immediately if it already is.
    pub fn wait(&self) -> FlagWait {
        FlagWait {
            inner: self.inner.clone(),
            key: None,
        }
    }
}

pub struct FlagWait {
    inner: Rc<Inner>,
    key: Option<usize>,
}

impl Future for FlagWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.set.get() {
            self.key = None;
            return Poll::Ready(());
        }
        let key = match self.key {
            Some(key) => key,
            None => {
                let key = self.inner.next_key.get();
                self.inner.next_key.set(key.wrapping_add(1));
                self.key = Some(key);
                key
            }
        };
        self.inner.waiters.borrow_mut().insert(key, cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for FlagWait {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.inner.waiters.borrow_mut().remove(&key);
        }
    }
}
