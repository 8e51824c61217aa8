//! Thorlabs Elliptec stage support (ELL14 rotation mount).
//!
//! Reference: ELLx modules protocol manual Issue 7-6
//!
//! Protocol Overview:
//! - Format: [Address][Command][Data (optional)] (ASCII encoded)
//! - Address: 0-9, A-F (usually '0' for first device)
//! - Encoding: Positions as 32-bit two's complement integers in hex
//! - Timing: Half-duplex request-response
//!
//! The encode/decode helpers are always available; the serial adapter
//! [`Ell14Stage`] needs the `instrument_thorlabs` feature.

use crate::core::DeviceKind;
use crate::error::DeviceError;

/// ELL14 encoder resolution: 143360 pulses per revolution.
pub const ELL14_PULSES_PER_DEGREE: f64 = 143_360.0 / 360.0;

/// Device status codes returned in `GS` replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    /// 0: no error
    Ok,
    /// 1: communication timeout
    CommunicationTimeout,
    /// 2: mechanical timeout
    MechanicalTimeout,
    /// 3: command not understood
    CommandError,
    /// 4: value out of range
    ValueOutOfRange,
    /// 9: busy (moving)
    Busy,
    /// Any other code (isolation, thermal, sensor, motor, over-current)
    Other(u8),
}

impl StatusCode {
    fn from_code(code: u8) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::CommunicationTimeout,
            2 => StatusCode::MechanicalTimeout,
            3 => StatusCode::CommandError,
            4 => StatusCode::ValueOutOfRange,
            9 => StatusCode::Busy,
            other => StatusCode::Other(other),
        }
    }

    /// Map a non-OK status to the adapter error taxonomy.
    pub fn into_result(self) -> Result<(), DeviceError> {
        match self {
            StatusCode::Ok => Ok(()),
            StatusCode::Busy => Err(DeviceError::Busy {
                device: DeviceKind::Stage,
            }),
            StatusCode::ValueOutOfRange => Err(DeviceError::invalid(
                DeviceKind::Stage,
                "value out of range",
            )),
            other => Err(DeviceError::fault(
                DeviceKind::Stage,
                format!("device status {other:?}"),
            )),
        }
    }
}

/// Reply to a command.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reply {
    /// `PO`: position in device units
    Position(f64),
    /// `GS`: status
    Status(StatusCode),
}

/// Build a bare command, e.g. `0gp`.
pub fn encode_command(address: char, command: &str) -> String {
    format!("{address}{command}")
}

/// Build a move-absolute command, e.g. `0ma00002000`.
pub fn encode_move_absolute(address: char, position: f64, pulses_per_unit: f64) -> String {
    let pulses = (position * pulses_per_unit).round() as i32;
    // Negative targets use the u32 two's complement representation
    format!("{address}ma{:08X}", pulses as u32)
}

/// Parse a `PO` or `GS` reply.
///
/// Example replies: "0PO00002000", "2POF" (short hex), "3PO" (position 0), "0GS09".
pub fn parse_reply(response: &str, pulses_per_unit: f64) -> Result<Reply, DeviceError> {
    let response = response.trim();
    // Minimum reply: address + two-letter code
    if response.len() < 3 {
        return Err(DeviceError::fault(
            DeviceKind::Stage,
            format!("reply too short: {response:?}"),
        ));
    }

    let code = response.get(1..3).ok_or_else(|| {
        DeviceError::fault(DeviceKind::Stage, format!("malformed reply: {response:?}"))
    })?;
    let payload = response.get(3..).unwrap_or_default().trim();
    match code {
        "PO" => {
            if payload.is_empty() {
                return Ok(Reply::Position(0.0));
            }
            let hex = payload.get(..payload.len().min(8)).unwrap_or(payload);
            let unsigned = u32::from_str_radix(hex, 16).map_err(|_| {
                DeviceError::fault(DeviceKind::Stage, format!("bad position hex {hex:?}"))
            })?;
            Ok(Reply::Position(f64::from(unsigned as i32) / pulses_per_unit))
        }
        "GS" => {
            if payload.is_empty() {
                return Ok(Reply::Status(StatusCode::Ok));
            }
            let hex = payload.get(..payload.len().min(2)).unwrap_or(payload);
            let code = u8::from_str_radix(hex, 16).map_err(|_| {
                DeviceError::fault(DeviceKind::Stage, format!("bad status hex {hex:?}"))
            })?;
            Ok(Reply::Status(StatusCode::from_code(code)))
        }
        other => Err(DeviceError::fault(
            DeviceKind::Stage,
            format!("unexpected reply code {other:?} in {response:?}"),
        )),
    }
}

#[cfg(feature = "instrument_thorlabs")]
pub use serial::Ell14Stage;

#[cfg(feature = "instrument_thorlabs")]
mod serial {
    use super::{encode_command, encode_move_absolute, parse_reply, Reply, ELL14_PULSES_PER_DEGREE};
    use crate::core::DeviceKind;
    use crate::error::DeviceError;
    use crate::hardware::{HardwareAdapter, StageCommand, StageSettings};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_serial::{SerialPortBuilderExt, SerialStream};
    use tracing::{debug, info};

    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

    /// ELL14 rotation mount over its RS-232/USB serial link.
    ///
    /// Motion completes when a `PO` reply arrives; the worker's stage timeout
    /// bounds the wait.
    pub struct Ell14Stage {
        port_path: String,
        address: char,
        pulses_per_degree: f64,
        port: Option<SerialStream>,
    }

    impl Ell14Stage {
        /// Stage on `port_path` (e.g. "/dev/ttyUSB0", "COM3") at `address` (usually '0').
        pub fn new(port_path: impl Into<String>, address: char) -> Self {
            Self {
                port_path: port_path.into(),
                address,
                pulses_per_degree: ELL14_PULSES_PER_DEGREE,
                port: None,
            }
        }

        /// Override the calibration (varies by device).
        pub fn with_calibration(mut self, pulses_per_degree: f64) -> Self {
            self.pulses_per_degree = pulses_per_degree;
            self
        }

        async fn send(&mut self, command: &str) -> Result<(), DeviceError> {
            let payload = encode_command(self.address, command);
            self.write_raw(&payload).await
        }

        async fn write_raw(&mut self, payload: &str) -> Result<(), DeviceError> {
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| DeviceError::fault(DeviceKind::Stage, "port not open"))?;
            port.write_all(payload.as_bytes())
                .await
                .map_err(|e| DeviceError::fault(DeviceKind::Stage, format!("write failed: {e}")))
        }

        /// Read one CRLF-terminated reply.
        async fn read_reply(&mut self) -> Result<Reply, DeviceError> {
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| DeviceError::fault(DeviceKind::Stage, "port not open"))?;
            let mut line = Vec::with_capacity(16);
            let mut byte = [0u8; 1];
            loop {
                match tokio::time::timeout(REPLY_TIMEOUT, port.read(&mut byte)).await {
                    Ok(Ok(1)) => {
                        if byte[0] == b'\n' {
                            break;
                        }
                        line.push(byte[0]);
                    }
                    Ok(Ok(_)) => {
                        return Err(DeviceError::fault(DeviceKind::Stage, "serial port closed"))
                    }
                    Ok(Err(e)) => {
                        return Err(DeviceError::fault(
                            DeviceKind::Stage,
                            format!("read failed: {e}"),
                        ))
                    }
                    Err(_) => {
                        return Err(DeviceError::Timeout {
                            device: DeviceKind::Stage,
                            operation: "reply",
                            after: REPLY_TIMEOUT,
                        })
                    }
                }
            }
            let text = String::from_utf8_lossy(&line);
            parse_reply(&text, self.pulses_per_degree)
        }

        /// Wait for the `PO` reply that ends a motion, tolerating busy status replies.
        async fn await_position(&mut self) -> Result<f64, DeviceError> {
            loop {
                match self.read_reply().await {
                    Ok(Reply::Position(position)) => return Ok(position),
                    Ok(Reply::Status(status)) => match status.into_result() {
                        Ok(()) => {}
                        Err(DeviceError::Busy { .. }) => tokio::time::sleep(POLL_INTERVAL).await,
                        Err(e) => return Err(e),
                    },
                    Err(DeviceError::Timeout { .. }) => {
                        // No reply while moving; ask again
                        self.send("gp").await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    #[async_trait]
    impl HardwareAdapter for Ell14Stage {
        type Settings = StageSettings;
        type Command = StageCommand;
        type Output = f64;

        fn kind(&self) -> DeviceKind {
            DeviceKind::Stage
        }

        async fn open(&mut self) -> Result<(), DeviceError> {
            if self.port.is_some() {
                return Ok(());
            }
            // No flow control (ELL14 manual)
            let port = tokio_serial::new(&self.port_path, 9600)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| DeviceError::Unavailable {
                    device: DeviceKind::Stage,
                    reason: format!("{}: {e}", self.port_path),
                })?;
            self.port = Some(port);
            info!(port = %self.port_path, address = %self.address, "ELL14 connected");
            Ok(())
        }

        async fn arm(&mut self, settings: &StageSettings) -> Result<(), DeviceError> {
            self.send("gs").await?;
            if let Reply::Status(status) = self.read_reply().await? {
                status.into_result()?;
            }
            if settings.home_on_arm {
                self.send("ho0").await?;
                let position = self.await_position().await?;
                debug!(position, "ELL14 homed");
            }
            Ok(())
        }

        async fn execute(&mut self, command: StageCommand) -> Result<f64, DeviceError> {
            match command {
                StageCommand::MoveTo(target) => {
                    let payload =
                        encode_move_absolute(self.address, target, self.pulses_per_degree);
                    self.write_raw(&payload).await?;
                    self.await_position().await
                }
                StageCommand::ReadPosition => {
                    self.send("gp").await?;
                    self.await_position().await
                }
            }
        }

        async fn close(&mut self) -> Result<(), DeviceError> {
            if self.port.take().is_some() {
                info!(port = %self.port_path, "ELL14 disconnected");
            }
            Ok(())
        }
    }
}
