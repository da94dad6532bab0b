//! Bounded, async-acquirable pool of page sessions.
//!
//! Bookkeeping lives behind a plain mutex and is never held across an await;
//! session construction and teardown (both I/O) happen outside the lock with
//! the slot already counted, so capacity can never overshoot. Waiters are
//! served strictly first-come-first-served.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use prerender_core_types::{Artifact, RenderError, RenderRequest};

/// Behavior the pool needs from a pooled page.
#[async_trait]
pub trait PooledPage: Send + 'static {
    /// Healthy and under its recycle threshold.
    fn usable(&self) -> bool;
    /// Idempotent teardown; called once when the pool destroys the page.
    async fn close(&mut self);
}

/// A pooled page that can serve renders. Split from [`PooledPage`] so pool
/// plumbing tests don't have to fake the whole render machine.
#[async_trait]
pub trait RenderPage: PooledPage {
    async fn render(
        &mut self,
        request: &RenderRequest,
        deadline: Instant,
    ) -> Result<Artifact, RenderError>;
}

/// Builds a fresh page session, typically by opening a new browser target.
pub type PageFactory<S> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<S, RenderError>> + Send + Sync>;

struct PoolState<S> {
    idle: VecDeque<S>,
    /// Slots in use: idle + loaned out + currently being constructed.
    allocated: usize,
    waiters: VecDeque<oneshot::Sender<S>>,
}

/// Bounded pool of page sessions.
pub struct PagePool<S: PooledPage> {
    inner: Mutex<PoolState<S>>,
    factory: PageFactory<S>,
    capacity: usize,
}

/// Point-in-time view of the pool, for the status endpoint and tests.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
}

enum Plan<S> {
    Ready(S),
    Create,
    Wait(oneshot::Receiver<S>),
}

impl<S: PooledPage> PagePool<S> {
    pub fn new(capacity: usize, factory: PageFactory<S>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolState {
                idle: VecDeque::new(),
                allocated: 0,
                waiters: VecDeque::new(),
            }),
            factory,
            capacity: capacity.max(1),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.inner.lock();
        PoolSnapshot {
            capacity: self.capacity,
            idle: state.idle.len(),
            in_use: state.allocated - state.idle.len(),
            waiting: state.waiters.len(),
        }
    }

    /// Acquire a session before `deadline`: an idle one if available, a fresh
    /// one if there is spare capacity, otherwise a FIFO waitlist slot.
    pub async fn acquire(self: &Arc<Self>, deadline: Instant) -> Result<PageLease<S>, RenderError> {
        loop {
            let plan = {
                let mut state = self.inner.lock();
                if let Some(session) = state.idle.pop_front() {
                    Plan::Ready(session)
                } else if state.allocated < self.capacity {
                    state.allocated += 1;
                    Plan::Create
                } else {
                    let (slot_tx, slot_rx) = oneshot::channel();
                    state.waiters.push_back(slot_tx);
                    Plan::Wait(slot_rx)
                }
            };

            match plan {
                Plan::Ready(session) => {
                    if session.usable() {
                        return Ok(self.lease(session));
                    }
                    // Went stale while idle; make room and try again.
                    debug!(target: "page-pool", "discarding stale idle session");
                    self.destroy(session);
                }
                Plan::Create => {
                    match tokio::time::timeout_at(deadline, (self.factory)()).await {
                        Ok(Ok(session)) => return Ok(self.lease(session)),
                        Ok(Err(err)) => {
                            self.inner.lock().allocated -= 1;
                            return Err(err);
                        }
                        Err(_) => {
                            self.inner.lock().allocated -= 1;
                            return Err(
                                RenderError::pool().with_hint("session startup missed deadline")
                            );
                        }
                    }
                }
                Plan::Wait(slot_rx) => {
                    return match tokio::time::timeout_at(deadline, slot_rx).await {
                        Ok(Ok(session)) => Ok(self.lease(session)),
                        Ok(Err(_)) => {
                            Err(RenderError::pool().with_hint("replacement session failed"))
                        }
                        Err(_) => Err(RenderError::pool()),
                    };
                }
            }
        }
    }

    fn lease(self: &Arc<Self>, session: S) -> PageLease<S> {
        PageLease {
            session: Some(session),
            pool: Arc::clone(self),
        }
    }

    fn release(self: &Arc<Self>, session: S, healthy: bool) {
        if healthy && session.usable() {
            self.hand_back(session);
        } else {
            self.destroy(session);
        }
    }

    /// Give a usable session to the oldest live waiter, or park it idle.
    fn hand_back(self: &Arc<Self>, mut session: S) {
        let mut state = self.inner.lock();
        while let Some(slot_tx) = state.waiters.pop_front() {
            match slot_tx.send(session) {
                Ok(()) => return,
                // Waiter gave up (deadline); try the next one.
                Err(back) => session = back,
            }
        }
        state.idle.push_back(session);
    }

    /// Tear a session down, free its slot, and start a replacement if anyone
    /// is still waiting.
    fn destroy(self: &Arc<Self>, mut session: S) {
        let needs_replacement = {
            let mut state = self.inner.lock();
            state.allocated -= 1;
            let wanted = !state.waiters.is_empty() && state.allocated < self.capacity;
            if wanted {
                state.allocated += 1;
            }
            wanted
        };

        spawn_if_running(async move {
            session.close().await;
        });

        if needs_replacement {
            let pool = Arc::clone(self);
            spawn_if_running(async move {
                match (pool.factory)().await {
                    Ok(fresh) => pool.hand_back(fresh),
                    Err(err) => {
                        pool.inner.lock().allocated -= 1;
                        warn!(target: "page-pool", %err, "replacement session failed");
                    }
                }
            });
        }
    }
}

fn spawn_if_running<F>(future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(future);
    }
}

/// Exclusive loan of one session. Dropping the lease without an explicit
/// [`PageLease::release`] counts as an unhealthy return, so a cancelled or
/// panicking caller can never leak a slot.
pub struct PageLease<S: PooledPage> {
    session: Option<S>,
    pool: Arc<PagePool<S>>,
}

impl<S: PooledPage> std::fmt::Debug for PageLease<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLease")
            .field("has_session", &self.session.is_some())
            .finish()
    }
}

impl<S: PooledPage> PageLease<S> {
    pub fn release(mut self, healthy: bool) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, healthy);
        }
    }
}

impl<S: PooledPage> Deref for PageLease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.session.as_ref().expect("lease already released")
    }
}

impl<S: PooledPage> DerefMut for PageLease<S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session.as_mut().expect("lease already released")
    }
}

impl<S: PooledPage> Drop for PageLease<S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session, false);
        }
    }
}
