// Copyright 2026 Daniel Pelikan
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

//! Smart bottle BLE communication engine.
//!
//! Discovers and connects to the bottle, pulls its drink history in chunks,
//! runs the two-point scale calibration and sends one-shot commands. All
//! protocol state lives in a single [`engine::Engine`] task.

pub mod bluetooth;
pub mod calibration;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod engine;
pub mod events;
pub mod state;
pub mod storage;
pub mod sync;

pub use engine::{Engine, EngineHandle, EngineSettings};
pub use events::EngineUpdate;
