pub mod config;
pub mod destination;
pub mod error;
pub mod extract;
pub mod load;
pub mod logging;
pub mod naming;
pub mod normalize;
pub mod pipeline;
pub mod schema;
pub mod storage;

pub use destination::{Destination, JobStatus, MemoryDestination, SqliteDestination};
pub use error::{PipelineError, Result};
pub use extract::{Resource, Source};
pub use load::LoadInfo;
pub use pipeline::Pipeline;
pub use schema::WriteDisposition;
