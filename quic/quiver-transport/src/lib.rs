// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection transport engine: streams, packet spaces, paths,
//! the packet builder, the worker scheduler, and the endpoint demultiplexer.

pub mod config;
pub mod connection;
pub mod crypto_stream;
pub mod endpoint;
pub mod path;
pub mod random;
pub mod registration;
pub mod space;
pub mod stream;
pub mod testing;
pub mod transmission;
pub mod worker;
