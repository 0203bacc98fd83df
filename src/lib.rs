pub mod column;
pub mod dispatch;
pub mod graph;
pub mod seed;
pub mod worker;

pub use column::Column;
pub use dispatch::{Dispatcher, QueueClient, QueueConsumer};
pub use graph::{DataPipe, ShardingPriority};
pub use seed::SeedGenerator;
pub use worker::{initialize_worker, reset_worker, DistInfo, WorkerInfo, WorkerPool};
