//! Columnar MergeTree-style storage building blocks: immutable sorted data
//! parts and the merge engine that folds them together.
//!
//! The core of this crate is the part-merge engine: given N immutable,
//! sorted parts sharing a table schema, a [`MergeTask`] produces one new
//! part whose rows are the merged-and-reduced union of the inputs. The task
//! is a cooperative state machine — an external worker calls
//! [`MergeTask::execute`] until it returns `false`, and every `true` return
//! is a yield point compatible with an outside scheduler and cancellation.
//!
//! Highlights:
//! - Seven merge modes (ordinary, collapsing, replacing, summing,
//!   aggregating, versioned-collapsing, Graphite rollup) over an N-way
//!   sorted merge with insertion-order tie-breaking.
//! - Two merge algorithms, horizontal and vertical, chosen from input
//!   statistics; the vertical one links its two phases through a compact
//!   rows-sources stream.
//! - Decoupled vector indexes: pre-built indexes of source parts are reused
//!   through bidirectional row-id maps instead of being rebuilt.

pub mod block;
pub mod io;
pub(crate) mod logging;
pub mod merge;
pub mod option;
pub mod part;
pub mod schema;
pub mod table;
pub mod vector;

pub use block::Value;
pub use merge::{
    ActionBlocker, MergeAlgorithm, MergeError, MergeMode, MergeProgress, MergeProgressSnapshot,
    MergeTask, MergeTaskParams, MergingParams, Reservation, RowSource,
};
pub use option::{CleanDeletedRows, MergeTreeOptions};
pub use part::{
    DataPart, FuturePart, MergeType, PartBuilder, PartError, PartInfo, PartType, StorageType,
};
pub use schema::TableSchema;
pub use table::TableData;
