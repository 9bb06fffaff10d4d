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

//! Command Dispatcher.
//!
//! Encodes one-shot device commands and writes them to the command channel.
//! Nothing is awaited here; the delete and calibration flows add their own
//! confirmation on top. A failed write is logged and returned, never retried.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bluetooth::protocol::DeviceCommand;
use crate::bluetooth::{CharacteristicKind, DeviceHandle, Radio};

/// Transient command failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("not connected to a bottle")]
    NotConnected,
    #[error("{command} write failed: {reason}")]
    WriteFailed {
        command: &'static str,
        reason: String,
    },
}

/// Encode `command` and queue it on the connected bottle.
pub fn dispatch(
    command: &DeviceCommand,
    device: Option<&DeviceHandle>,
    radio: &mut dyn Radio,
) -> Result<(), CommandError> {
    let Some(device) = device.filter(|d| d.has(CharacteristicKind::Command)) else {
        warn!("Dropping {} command, no bottle connected", command.name());
        return Err(CommandError::NotConnected);
    };

    let payload = command.encode();
    debug!(
        "Sending {} (0x{:02X}, {} bytes) to {}",
        command.name(),
        command.opcode(),
        payload.len(),
        device.id
    );

    radio
        .write(CharacteristicKind::Command, payload)
        .map_err(|e| {
            warn!("Command {} failed: {}", command.name(), e);
            CommandError::WriteFailed {
                command: command.name(),
                reason: e.to_string(),
            }
        })
}

/// Set-time command for `now`. The bottle keeps unsigned 32-bit seconds.
pub fn clock_sync(now: DateTime<Utc>) -> DeviceCommand {
    let seconds = u32::try_from(now.timestamp().max(0)).unwrap_or(u32::MAX);
    DeviceCommand::SetTime(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::mock::{MockRadio, RadioOp};
    use crate::bluetooth::DeviceId;
    use chrono::TimeZone;

    fn bottle() -> DeviceHandle {
        DeviceHandle {
            id: DeviceId::new("C0:FF:EE:00:00:01"),
            name: Some("Aquavate-0001".to_string()),
            characteristics: CharacteristicKind::MANDATORY.into_iter().collect(),
        }
    }

    #[test]
    fn test_dispatch_writes_encoded_command() {
        let mut radio = MockRadio::new();
        let device = bottle();

        dispatch(&DeviceCommand::Tare, Some(&device), &mut radio).unwrap();
        dispatch(&DeviceCommand::SetTime(1_700_000_000), Some(&device), &mut radio).unwrap();

        assert_eq!(
            radio.ops(),
            vec![
                RadioOp::Write(CharacteristicKind::Command, vec![0x01, 0, 0, 0]),
                RadioOp::Write(
                    CharacteristicKind::Command,
                    vec![0x10, 0x00, 0xF1, 0x53, 0x65]
                ),
            ]
        );
    }

    #[test]
    fn test_dispatch_without_bottle() {
        let mut radio = MockRadio::new();
        assert_eq!(
            dispatch(&DeviceCommand::Ping, None, &mut radio),
            Err(CommandError::NotConnected)
        );
        assert!(radio.ops().is_empty());
    }

    #[test]
    fn test_write_failure_is_reported() {
        let mut radio = MockRadio::new();
        radio.fail_next_write("link busy");

        let err = dispatch(&DeviceCommand::ResetDaily, Some(&bottle()), &mut radio).unwrap_err();
        assert!(matches!(
            err,
            CommandError::WriteFailed {
                command: "reset-daily",
                ..
            }
        ));
        assert!(err.to_string().contains("link busy"));

        // Not retried
        assert!(radio.ops().is_empty());
    }

    #[test]
    fn test_clock_sync() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(clock_sync(now), DeviceCommand::SetTime(1_700_000_000));
    }
}
