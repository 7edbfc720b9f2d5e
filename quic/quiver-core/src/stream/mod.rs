// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream identity types shared by the send and receive machinery

mod id;
mod type_;

pub use id::StreamId;
pub use type_::StreamType;
