// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
pub mod buffer;
pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod event;
pub mod frame;
#[cfg(feature = "alloc")]
pub mod interval;
pub mod packet;
pub mod random;
pub mod recovery;
pub mod stream;
pub mod time;
pub mod transport;
pub mod varint;
