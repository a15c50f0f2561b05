mod board;
mod composite;
mod placement;
mod queue_entry;
mod snapshot;
mod task;

pub use board::{Board, BoardSize};
pub use composite::{CompositeNode, CompositeTask, NodeKind};
pub use placement::{BoardPlacement, PlacementRef};
pub use queue_entry::{NewQueueEntry, Operation, QueueEntry, QueueStatus};
pub use snapshot::{EntitySnapshot, EntityType};
pub use task::{Task, TaskKind};
