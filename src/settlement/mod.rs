// Off-chain settlement services: eligibility polling and log reconciliation
pub mod listener;
pub mod scheduler;

pub use listener::EventListener;
pub use scheduler::{EligibilityScheduler, SchedulerConfig, SchedulerStatus, TriggerOutcome};
