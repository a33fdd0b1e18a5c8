//! Black-box test harness for deployment CLIs: drive an interactive
//! process over its standard streams and wait on eventually-consistent
//! HTTP backends with bounded retry and deadline polling.

pub mod config;
pub mod context;
pub mod http;
pub mod matchers;
pub mod output;
pub mod poll;
pub mod process;
pub mod retry;
pub mod telemetry;

pub use config::{Config, ConfigError, HarnessSettings};
pub use context::{ContextError, ScenarioContext};
pub use http::HttpError;
pub use poll::{CheckOutcome, Observation, PollError, PollReport, PollSession};
pub use process::{Channel, ManagedProcess, ProcessError, ProcessOutput, PromptMatch, SpawnOptions};
pub use retry::{Attempt, Backoff, RetryError, RetryPolicy, retry, retry_if};

#[cfg(test)]
mod test_support;
