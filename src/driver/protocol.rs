//! Wire format of the kernel filter's message and control ports.
//!
//! All integers are little-endian. Strings travel as UTF-16LE with a
//! `{sizeBytes: u32, offsetBytes: i32}` descriptor whose offset is
//! relative to the descriptor's own position; `sizeBytes` includes the
//! terminating NUL. Message framing mirrors the driver's structs field for
//! field.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Message-port operations.
pub const SERVICE_RESOLVE_FILE: u32 = 0x01;
pub const SERVICE_LOG_WRITE: u32 = 0x02;

/// Control-port operations.
pub const OPERATION_SET_TRACE_ENABLED: u32 = 0x01;
pub const OPERATION_GET_IS_CONNECTED: u32 = 0x02;
pub const OPERATION_GET_VERSION: u32 = 0x03;
pub const OPERATION_SET_FLAG: u32 = 0x04;
pub const OPERATION_OPEN_REPARSE_POINT: u32 = 0x05;
pub const OPERATION_CLOSE_REPARSE_POINT: u32 = 0x06;

/// Communication port names published by the filter.
pub const SERVICE_PORT_NAME: &str = r"\P4VFS_SERVICE_PORT_NAME";
pub const CONTROL_PORT_NAME: &str = r"\P4VFS_CONTROL_PORT_NAME";

/// Fixed width of a `SetFlag` name field, UTF-16 units.
pub const CONTROL_FLAG_LENGTH: usize = 32;

/// NT statuses carried in replies.
pub mod ntstatus {
    pub const SUCCESS: u32 = 0x0000_0000;
    pub const UNSUCCESSFUL: u32 = 0xC000_0001;
    pub const ACCESS_DENIED: u32 = 0xC000_0022;
    pub const RETRY: u32 = 0xC000_022D;
}

/// Decode failures; a malformed frame drops the message, not the port.
#[derive(Debug)]
pub enum ProtocolError {
    Io(std::io::Error),
    Truncated,
    UnknownOperation(u32),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Io(e) => write!(f, "protocol io: {e}"),
            ProtocolError::Truncated => write!(f, "truncated message"),
            ProtocolError::UnknownOperation(op) => write!(f, "unknown operation {op:#x}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// One request received on the message port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMessage {
    pub request_id: u32,
    pub operation: ServiceOperation,
}

/// The message-port payload union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOperation {
    ResolveFile(ResolveFileMessage),
    LogWrite(LogWriteMessage),
}

/// Hydration request raised by the filter for one file open.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveFileMessage {
    pub session_id: u32,
    pub volume_name: String,
    pub data_name: String,
    pub process_id: u32,
    pub thread_id: u32,
}

/// Kernel log text forwarded to the service log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogWriteMessage {
    pub text: String,
}

/// Reply to one message-port request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceReply {
    pub request_id: u32,
    pub request_result: u32,
}

/// Writes a `{sizeBytes, offsetBytes}` string into a frame under
/// construction. `descriptor_at` is the descriptor's byte position in the
/// frame; the string bytes go to the current end of the frame.
fn append_string(frame: &mut Vec<u8>, descriptor_at: usize, value: &str) {
    if value.is_empty() {
        return;
    }
    let start = frame.len();
    for unit in value.encode_utf16().chain(std::iter::once(0)) {
        frame.extend_from_slice(&unit.to_le_bytes());
    }
    let size = (frame.len() - start) as u32;
    let offset = start as i32 - descriptor_at as i32;
    frame[descriptor_at..descriptor_at + 4].copy_from_slice(&size.to_le_bytes());
    frame[descriptor_at + 4..descriptor_at + 8].copy_from_slice(&offset.to_le_bytes());
}

/// Reads the string referenced by the descriptor at `descriptor_at`.
fn read_string(frame: &[u8], descriptor_at: usize) -> Result<String> {
    let descriptor =
        frame.get(descriptor_at..descriptor_at + 8).ok_or(ProtocolError::Truncated)?;
    let size = u32::from_le_bytes(descriptor[0..4].try_into().unwrap()) as usize;
    let offset = i32::from_le_bytes(descriptor[4..8].try_into().unwrap());
    if size == 0 {
        return Ok(String::new());
    }
    let start = descriptor_at as i64 + offset as i64;
    let end = start + size as i64;
    if start < 0 || end as usize > frame.len() || size % 2 != 0 {
        return Err(ProtocolError::Truncated);
    }
    let bytes = &frame[start as usize..end as usize];
    let mut units = Vec::with_capacity(size / 2);
    for pair in bytes.chunks_exact(2) {
        units.push(u16::from_le_bytes([pair[0], pair[1]]));
    }
    let nul = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    Ok(String::from_utf16_lossy(&units[..nul]))
}

impl ServiceMessage {
    /// Frame layout: `size u32, requestID u32, operation u32, payload`.
    /// ResolveFile payload: `sessionId u32, volumeName desc, dataName
    /// desc, processId u32, threadId u32`; LogWrite payload: `text desc`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.write_u32::<LittleEndian>(0).unwrap(); // size, patched below
        frame.write_u32::<LittleEndian>(self.request_id).unwrap();
        match &self.operation {
            ServiceOperation::ResolveFile(msg) => {
                frame.write_u32::<LittleEndian>(SERVICE_RESOLVE_FILE).unwrap();
                frame.write_u32::<LittleEndian>(msg.session_id).unwrap();
                frame.extend_from_slice(&[0u8; 16]); // two descriptors
                frame.write_u32::<LittleEndian>(msg.process_id).unwrap();
                frame.write_u32::<LittleEndian>(msg.thread_id).unwrap();
                append_string(&mut frame, 16, &msg.volume_name);
                append_string(&mut frame, 24, &msg.data_name);
            }
            ServiceOperation::LogWrite(msg) => {
                frame.write_u32::<LittleEndian>(SERVICE_LOG_WRITE).unwrap();
                frame.extend_from_slice(&[0u8; 8]); // one descriptor
                append_string(&mut frame, 12, &msg.text);
            }
        }
        let size = frame.len() as u32;
        frame[0..4].copy_from_slice(&size.to_le_bytes());
        frame
    }

    pub fn parse(frame: &[u8]) -> Result<ServiceMessage> {
        let mut src = Cursor::new(frame);
        let size = src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?;
        if (size as usize) > frame.len() {
            return Err(ProtocolError::Truncated);
        }
        let request_id = src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?;
        let operation = src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?;
        match operation {
            SERVICE_RESOLVE_FILE => {
                let session_id =
                    src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?;
                let volume_name = read_string(frame, 16)?;
                let data_name = read_string(frame, 24)?;
                let mut tail = [0u8; 8];
                src.set_position(32);
                src.read_exact(&mut tail).map_err(|_| ProtocolError::Truncated)?;
                Ok(ServiceMessage {
                    request_id,
                    operation: ServiceOperation::ResolveFile(ResolveFileMessage {
                        session_id,
                        volume_name,
                        data_name,
                        process_id: u32::from_le_bytes(tail[0..4].try_into().unwrap()),
                        thread_id: u32::from_le_bytes(tail[4..8].try_into().unwrap()),
                    }),
                })
            }
            SERVICE_LOG_WRITE => Ok(ServiceMessage {
                request_id,
                operation: ServiceOperation::LogWrite(LogWriteMessage {
                    text: read_string(frame, 12)?,
                }),
            }),
            other => Err(ProtocolError::UnknownOperation(other)),
        }
    }
}

impl ServiceReply {
    /// Frame layout: `requestID u32, requestResult u32`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(8);
        frame.write_u32::<LittleEndian>(self.request_id).unwrap();
        frame.write_u32::<LittleEndian>(self.request_result).unwrap();
        frame
    }

    pub fn parse(frame: &[u8]) -> Result<ServiceReply> {
        let mut src = Cursor::new(frame);
        Ok(ServiceReply {
            request_id: src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?,
            request_result: src
                .read_u32::<LittleEndian>()
                .map_err(|_| ProtocolError::Truncated)?,
        })
    }
}

/// One request sent on the control port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    SetTraceEnabled { channels: u32 },
    GetIsConnected,
    GetVersion,
    SetFlag { name: String, value: u32 },
    OpenReparsePoint { file_path: String, access: u8, share: u8 },
    CloseReparsePoint { handle: u64 },
}

/// The matching control-port reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Empty,
    IsConnected { connected: bool },
    Version { major: u16, minor: u16, build: u16, revision: u16 },
    OpenReparsePoint { handle: u64, ntstatus: u32 },
    CloseReparsePoint { ntstatus: u32 },
}

/// Access bits of an `OpenReparsePoint` request.
pub mod open_access {
    pub const READ: u8 = 1 << 0;
    pub const WRITE: u8 = 1 << 1;
    pub const DELETE: u8 = 1 << 2;
}

/// Share bits of an `OpenReparsePoint` request.
pub mod open_share {
    pub const READ: u8 = 1 << 0;
    pub const WRITE: u8 = 1 << 1;
    pub const DELETE: u8 = 1 << 2;
    pub const ALL: u8 = READ | WRITE | DELETE;
}

impl ControlRequest {
    /// Frame layout: `operation u32` then the operation body.
    pub fn serialize(&self) -> Vec<u8> {
        let mut frame = Vec::new();
        match self {
            ControlRequest::SetTraceEnabled { channels } => {
                frame.write_u32::<LittleEndian>(OPERATION_SET_TRACE_ENABLED).unwrap();
                frame.write_u32::<LittleEndian>(*channels).unwrap();
            }
            ControlRequest::GetIsConnected => {
                frame.write_u32::<LittleEndian>(OPERATION_GET_IS_CONNECTED).unwrap();
            }
            ControlRequest::GetVersion => {
                frame.write_u32::<LittleEndian>(OPERATION_GET_VERSION).unwrap();
            }
            ControlRequest::SetFlag { name, value } => {
                frame.write_u32::<LittleEndian>(OPERATION_SET_FLAG).unwrap();
                let mut units: Vec<u16> =
                    name.encode_utf16().take(CONTROL_FLAG_LENGTH - 1).collect();
                units.resize(CONTROL_FLAG_LENGTH, 0);
                for unit in units {
                    frame.extend_from_slice(&unit.to_le_bytes());
                }
                frame.write_u32::<LittleEndian>(*value).unwrap();
            }
            ControlRequest::OpenReparsePoint { file_path, access, share } => {
                frame.write_u32::<LittleEndian>(OPERATION_OPEN_REPARSE_POINT).unwrap();
                frame.extend_from_slice(&[0u8; 8]); // descriptor
                frame.push(*access);
                frame.push(*share);
                frame.extend_from_slice(&[0u8; 2]); // pad
                append_string(&mut frame, 4, file_path);
            }
            ControlRequest::CloseReparsePoint { handle } => {
                frame.write_u32::<LittleEndian>(OPERATION_CLOSE_REPARSE_POINT).unwrap();
                frame.extend_from_slice(&[0u8; 4]); // pad to 8
                frame.write_u64::<LittleEndian>(*handle).unwrap();
            }
        }
        frame
    }

    pub fn parse(frame: &[u8]) -> Result<ControlRequest> {
        let mut src = Cursor::new(frame);
        let operation = src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?;
        match operation {
            OPERATION_SET_TRACE_ENABLED => Ok(ControlRequest::SetTraceEnabled {
                channels: src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?,
            }),
            OPERATION_GET_IS_CONNECTED => Ok(ControlRequest::GetIsConnected),
            OPERATION_GET_VERSION => Ok(ControlRequest::GetVersion),
            OPERATION_SET_FLAG => {
                let mut units = [0u16; CONTROL_FLAG_LENGTH];
                for unit in units.iter_mut() {
                    *unit =
                        src.read_u16::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?;
                }
                let nul = units.iter().position(|&u| u == 0).unwrap_or(units.len());
                let value =
                    src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?;
                Ok(ControlRequest::SetFlag {
                    name: String::from_utf16_lossy(&units[..nul]),
                    value,
                })
            }
            OPERATION_OPEN_REPARSE_POINT => {
                let file_path = read_string(frame, 4)?;
                let access = *frame.get(12).ok_or(ProtocolError::Truncated)?;
                let share = *frame.get(13).ok_or(ProtocolError::Truncated)?;
                Ok(ControlRequest::OpenReparsePoint { file_path, access, share })
            }
            OPERATION_CLOSE_REPARSE_POINT => {
                src.set_position(8);
                Ok(ControlRequest::CloseReparsePoint {
                    handle: src.read_u64::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?,
                })
            }
            other => Err(ProtocolError::UnknownOperation(other)),
        }
    }
}

impl ControlReply {
    /// Frame layout: `operation u32` then the operation body.
    pub fn serialize(&self, operation: u32) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.write_u32::<LittleEndian>(operation).unwrap();
        match self {
            ControlReply::Empty => {}
            ControlReply::IsConnected { connected } => {
                frame.write_u32::<LittleEndian>(*connected as u32).unwrap();
            }
            ControlReply::Version { major, minor, build, revision } => {
                frame.write_u16::<LittleEndian>(*major).unwrap();
                frame.write_u16::<LittleEndian>(*minor).unwrap();
                frame.write_u16::<LittleEndian>(*build).unwrap();
                frame.write_u16::<LittleEndian>(*revision).unwrap();
            }
            ControlReply::OpenReparsePoint { handle, ntstatus } => {
                frame.extend_from_slice(&[0u8; 4]); // pad to 8
                frame.write_u64::<LittleEndian>(*handle).unwrap();
                frame.write_u32::<LittleEndian>(*ntstatus).unwrap();
            }
            ControlReply::CloseReparsePoint { ntstatus } => {
                frame.write_u32::<LittleEndian>(*ntstatus).unwrap();
            }
        }
        frame
    }

    pub fn parse(frame: &[u8]) -> Result<ControlReply> {
        let mut src = Cursor::new(frame);
        let operation = src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?;
        match operation {
            OPERATION_SET_TRACE_ENABLED => Ok(ControlReply::Empty),
            OPERATION_GET_IS_CONNECTED => Ok(ControlReply::IsConnected {
                connected: src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?
                    != 0,
            }),
            OPERATION_GET_VERSION => Ok(ControlReply::Version {
                major: src.read_u16::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?,
                minor: src.read_u16::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?,
                build: src.read_u16::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?,
                revision: src.read_u16::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?,
            }),
            OPERATION_SET_FLAG => Ok(ControlReply::Empty),
            OPERATION_OPEN_REPARSE_POINT => {
                src.set_position(8);
                Ok(ControlReply::OpenReparsePoint {
                    handle: src.read_u64::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?,
                    ntstatus: src
                        .read_u32::<LittleEndian>()
                        .map_err(|_| ProtocolError::Truncated)?,
                })
            }
            OPERATION_CLOSE_REPARSE_POINT => Ok(ControlReply::CloseReparsePoint {
                ntstatus: src.read_u32::<LittleEndian>().map_err(|_| ProtocolError::Truncated)?,
            }),
            other => Err(ProtocolError::UnknownOperation(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resolve_file_round_trip() {
        let message = ServiceMessage {
            request_id: 42,
            operation: ServiceOperation::ResolveFile(ResolveFileMessage {
                session_id: 1,
                volume_name: r"\Device\HarddiskVolume3".to_string(),
                data_name: r"\Device\HarddiskVolume3\w\src\a.cpp".to_string(),
                process_id: 4321,
                thread_id: 8765,
            }),
        };
        let frame = message.serialize();
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize, frame.len());
        assert_eq!(ServiceMessage::parse(&frame).unwrap(), message);
    }

    #[test]
    fn test_log_write_round_trip() {
        let message = ServiceMessage {
            request_id: 7,
            operation: ServiceOperation::LogWrite(LogWriteMessage {
                text: "filter attached to volume".to_string(),
            }),
        };
        assert_eq!(ServiceMessage::parse(&message.serialize()).unwrap(), message);
    }

    #[test]
    fn test_truncated_message() {
        let frame = ServiceMessage {
            request_id: 9,
            operation: ServiceOperation::LogWrite(LogWriteMessage { text: "abc".to_string() }),
        }
        .serialize();
        assert!(matches!(
            ServiceMessage::parse(&frame[..10]),
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn test_unknown_operation() {
        let mut frame = vec![0u8; 12];
        frame[0..4].copy_from_slice(&12u32.to_le_bytes());
        frame[8..12].copy_from_slice(&0x99u32.to_le_bytes());
        assert!(matches!(
            ServiceMessage::parse(&frame),
            Err(ProtocolError::UnknownOperation(0x99))
        ));
    }

    #[test]
    fn test_service_reply_round_trip() {
        let reply = ServiceReply { request_id: 42, request_result: ntstatus::RETRY };
        assert_eq!(ServiceReply::parse(&reply.serialize()).unwrap(), reply);
    }

    #[test]
    fn test_control_round_trips() {
        let requests = [
            ControlRequest::SetTraceEnabled { channels: 0xF },
            ControlRequest::GetIsConnected,
            ControlRequest::GetVersion,
            ControlRequest::SetFlag { name: "SanitizeAttributes".to_string(), value: 1 },
            ControlRequest::OpenReparsePoint {
                file_path: r"\??\C:\w\src\a.cpp".to_string(),
                access: open_access::WRITE,
                share: open_share::ALL,
            },
            ControlRequest::CloseReparsePoint { handle: 0xDEAD_BEEF },
        ];
        for request in requests {
            assert_eq!(ControlRequest::parse(&request.serialize()).unwrap(), request);
        }

        let replies = [
            (OPERATION_GET_IS_CONNECTED, ControlReply::IsConnected { connected: true }),
            (
                OPERATION_GET_VERSION,
                ControlReply::Version { major: 1, minor: 27, build: 4, revision: 0 },
            ),
            (
                OPERATION_OPEN_REPARSE_POINT,
                ControlReply::OpenReparsePoint { handle: 99, ntstatus: ntstatus::SUCCESS },
            ),
            (
                OPERATION_CLOSE_REPARSE_POINT,
                ControlReply::CloseReparsePoint { ntstatus: ntstatus::SUCCESS },
            ),
        ];
        for (operation, reply) in replies {
            assert_eq!(ControlReply::parse(&reply.serialize(operation)).unwrap(), reply);
        }
    }
}
