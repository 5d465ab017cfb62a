pub mod deployment;
pub mod env;
pub mod event;
pub mod job;
pub mod service;

pub use deployment::{Action, Deployment, DomainError, Step, Strategy};
pub use event::Event;
pub use job::{JobPayload, JOB_STREAM};
pub use service::Service;
