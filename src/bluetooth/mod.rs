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

//! Bluetooth Low Energy link to the bottle.
//!
//! Codec, radio abstraction with its BlueZ and mock backends, connection
//! lifecycle and protocol timers.

pub mod ble_constants;
pub mod bluez;
mod connection;
pub mod mock;
pub mod protocol;
mod radio;
pub mod timers;

pub use connection::{ConnectionManager, ConnectionPolicy, ConnectionState, DeviceHandle};
pub use radio::{CharacteristicKind, DeviceId, Radio, ScanFilter};
