//! Rate-controlled HTTP load generation.
//!
//! A [`RunController`] owns one run: it validates a [`RunConfig`], spawns a
//! [`Dispatcher`] whose workers pull admissions from a shared
//! [`RateLimiter`], build requests with a [`RequestFactory`], execute them
//! through a [`Transport`] and fold every [`Outcome`] into a
//! [`StatsAggregator`]. Callers read [`StatsSnapshot`]s live or once the run
//! has finished.

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod rate_limiter;
pub mod request;
pub mod stats;
pub mod transport;

pub use config::*;
pub use controller::*;
pub use dispatcher::*;
pub use rate_limiter::*;
pub use request::*;
pub use stats::*;
pub use transport::*;
