//! Build-job lifecycle services for ForgeCI.
//!
//! The services in this crate own the distributed build-job lifecycle:
//! translating pushes into prioritized queue items ([`trigger`]), draining
//! the shared result queue with at-most-once semantics ([`results`]),
//! reconciling durable state with the shared structures ([`missing`]),
//! projecting sanitized views to dashboards ([`fanout`]), and cancellation
//! plus historical search ([`management`]). [`node`] wires everything
//! together for one API-server process.

pub mod error;
pub mod fanout;
pub mod management;
pub mod missing;
pub mod node;
pub mod results;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{SchedulerError, SchedulerResult};
pub use fanout::FanoutService;
pub use management::QueueManagementService;
pub use missing::MissingJobService;
pub use node::SchedulerNode;
pub use results::ResultProcessingService;
pub use trigger::{TriggerRequest, TriggerService};
