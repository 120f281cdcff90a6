pub mod cdevents;
pub mod clock;
pub mod context;
pub mod deploy;
pub mod error;
pub mod finish;
pub mod group;
pub mod manifest;
pub mod pipeline;
pub mod rollback;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub mod testing;

pub use context::Context;
pub use deploy::{deploy, publish_cron_job};
pub use error::{ErrorCategory, WorkflowError};
pub use finish::{finish, terminate};
pub use pipeline::{create_pipeline, record_image};
pub use rollback::rollback;
