// Copyright (c) 2024-present, edspine
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! JWZ-style message threading: build a forest out of a flat, ordered list
//! of items using message-id/reference linking, optional subject grouping,
//! and optional date sorting.
//!
//! Grounded in `camel-folder-thread.c`'s `camel_folder_thread_messages`.

mod engine;
mod node;
mod subject;

pub use engine::{DumpEntry, Thread, ThreadConfig, ThreadableItem};
pub use node::NodeId;
