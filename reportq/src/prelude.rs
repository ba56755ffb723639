//! The purpose of this module is to alleviate the need to import many of the [`crate`] types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use reportq::prelude::*;
//! ```
pub use crate::backend::{Backend, EnqueuableJob, Partition};
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::bulk::{ReportPayload, Subject, SubjectSource};
pub use crate::config::QueueConfig;
pub use crate::handler::{ExecutionError, ExecutionResult, Handler, HandlerRegistry};
pub use crate::job::{Job, JobId, JobStatus};
pub use crate::reaper::ReaperConfig;
pub use crate::retry::RetryPolicy;
pub use crate::scheduler::BulkSchedule;
pub use crate::stats::QueueStats;
pub use crate::worker::WorkerConfig;
pub use crate::{Reportq, ReportqError};
