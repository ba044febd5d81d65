// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The engine core: a demand-driven, memoising rule engine over the solver's pre-compiled
//! rule graph, with filesystem, store, download, and process-execution intrinsics.

pub mod context;
mod downloads;
pub mod intrinsics;
pub mod nodes;
pub mod scheduler;
pub mod session;
pub mod tasks;
#[cfg(test)]
mod tests;
pub mod types;

pub use crate::context::{Core, CoreOptions, ExecutionStrategyOptions, SessionCore};
pub use crate::intrinsics::{
    AddPrefix, CreateDigest, DigestContents, DigestEntries, DigestSubset, MergeDigests,
    NativeDownloadFile, Paths, RemovePrefix,
};
pub use crate::nodes::{NodeKey, NodeOutput, ProcessResult, TaskContext};
pub use crate::scheduler::{ExecutionRequest, ExecutionTermination, Scheduler};
pub use crate::session::{RunIdValue, Session, SessionValues};
pub use crate::tasks::{DisplayInfo, Intrinsic, Rule, Task, Tasks};
pub use crate::types::{Failure, Key, Params, TypeId, Value, throw};
