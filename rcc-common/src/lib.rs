// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types and facilities shared by the RCC fleet services
//!
//! The fleet consists of three services: the ownership registry
//! (`rcc-data`), the singleton control loop (`rcc-operator`), and the
//! horizontally scaled console workers (`rcc-worker`).  Everything they
//! agree on lives here: the wire representation of a node, the codec for
//! the shared targets file, environment-variable handling, and the
//! periodic-task machinery all three are built from.

pub mod api;
pub mod background;
pub mod env;
pub mod reaper;
pub mod targets;
