pub mod application;
pub mod assigner;
pub mod engine;
pub mod job;
pub mod queue;
pub mod stanchion;

pub use application::{Application, Container};
pub use assigner::OfferStock;
pub use engine::Scheduler;
pub use job::{Job, JobState, Resources};
pub use queue::{CancelOutcome, JobQueue, QueueCounts};
pub use stanchion::Stanchion;
