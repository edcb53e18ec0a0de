// Copyright 2024 The Huddle Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Common types shared between the Huddle SDK crates.
//!
//! This crate holds the opaque identifier newtypes and the slices of the
//! chat document model (rooms, subscriptions, messages) that the
//! encryption core reads and writes. The host application owns the full
//! documents; only the fields named here are part of the SDK contract.

#![warn(missing_debug_implementations)]

pub mod documents;
pub mod identifiers;

pub use documents::{
    E2eeState, Message, MessageAttachment, MessageKind, Room, RoomType, Subscription,
};
pub use identifiers::{MessageId, RoomId, UserId};
