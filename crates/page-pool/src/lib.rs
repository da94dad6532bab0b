//! Page sessions and the bounded pool that loans them to render tasks.
//!
//! A [`session::PageSession`] owns one browser tab and drives the
//! configure → navigate → intercept → await-readiness → extract → reset
//! machine for each render. The [`pool::PagePool`] keeps a capacity-bounded
//! set of sessions alive, recycles worn-out ones and serves waiters in FIFO
//! order. [`policy::InterceptPolicy`] decides the fate of intercepted
//! network requests.

pub mod policy;
pub mod pool;
pub mod session;

pub use policy::{Decision, InterceptPolicy, InterceptedRequest};
pub use pool::{PageFactory, PageLease, PagePool, PoolSnapshot, PooledPage, RenderPage};
pub use session::{PageSession, SessionConfig};
