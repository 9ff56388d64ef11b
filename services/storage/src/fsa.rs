//! # FSA Shim Protocol
//!
//! Wire format exchanged with the `/dev/fsa` device. Every command sends a
//! request record and receives a fixed-size response record. All integers
//! are big-endian; strings are NUL-padded fixed-width fields.
//!
//! ```text
//! request:  [command: u32][fields ...]
//! response: [payload ...][zero padding to FSA_RESPONSE_LEN]
//!
//! ioctl   (most commands): in = request, out = response
//! ioctlv  (read / write):  [request][data][response], 2 in + 1 out for
//!                          writes, 1 in + 2 out for reads
//! ```

use core::fmt;

use bitflags::bitflags;

/// Width of a path field.
pub const FSA_PATH_LEN: usize = 0x280;
/// Width of an open-mode string field.
pub const FSA_MODE_LEN: usize = 0x10;
/// Width of a directory entry name.
pub const FSA_NAME_LEN: usize = 0x100;
/// Width of each volume-info string.
pub const FSA_VOLUME_STR_LEN: usize = 0x80;
/// Size of the response record.
pub const FSA_RESPONSE_LEN: usize = 0x300;

/// FSA command codes. Doubles as the ioctl request number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FsaCommand {
    Mount = 0x1,
    Unmount = 0x2,
    GetVolumeInfo = 0x3,
    ChangeDir = 0x5,
    GetCwd = 0x6,
    MakeDir = 0x7,
    Remove = 0x8,
    Rename = 0x9,
    OpenDir = 0xA,
    ReadDir = 0xB,
    RewindDir = 0xC,
    CloseDir = 0xD,
    OpenFile = 0xE,
    ReadFile = 0xF,
    WriteFile = 0x10,
    GetPosFile = 0x11,
    SetPosFile = 0x12,
    IsEof = 0x13,
    StatFile = 0x14,
    CloseFile = 0x15,
    FlushFile = 0x17,
    TruncateFile = 0x1A,
    ChangeMode = 0x20,
}

impl FsaCommand {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0x1 => FsaCommand::Mount,
            0x2 => FsaCommand::Unmount,
            0x3 => FsaCommand::GetVolumeInfo,
            0x5 => FsaCommand::ChangeDir,
            0x6 => FsaCommand::GetCwd,
            0x7 => FsaCommand::MakeDir,
            0x8 => FsaCommand::Remove,
            0x9 => FsaCommand::Rename,
            0xA => FsaCommand::OpenDir,
            0xB => FsaCommand::ReadDir,
            0xC => FsaCommand::RewindDir,
            0xD => FsaCommand::CloseDir,
            0xE => FsaCommand::OpenFile,
            0xF => FsaCommand::ReadFile,
            0x10 => FsaCommand::WriteFile,
            0x11 => FsaCommand::GetPosFile,
            0x12 => FsaCommand::SetPosFile,
            0x13 => FsaCommand::IsEof,
            0x14 => FsaCommand::StatFile,
            0x15 => FsaCommand::CloseFile,
            0x17 => FsaCommand::FlushFile,
            0x1A => FsaCommand::TruncateFile,
            0x20 => FsaCommand::ChangeMode,
            _ => return None,
        })
    }

    /// Read and write carry a data vector and go through ioctlv.
    pub fn is_vectored(self) -> bool {
        matches!(self, FsaCommand::ReadFile | FsaCommand::WriteFile)
    }
}

bitflags! {
    /// Read/write request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FsReadFlag: u32 {
        /// Transfer at an explicit position instead of the file cursor.
        const WITH_POS = 1 << 0;
    }
}

/// Codec failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShimError {
    /// Record ended before all fields were read
    Truncated,
    UnknownCommand(u32),
    /// String does not fit its fixed-width field
    FieldTooLong { field: &'static str, len: usize, max: usize },
}

impl fmt::Display for ShimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShimError::Truncated => write!(f, "record truncated"),
            ShimError::UnknownCommand(command) => write!(f, "unknown FSA command {:#x}", command),
            ShimError::FieldTooLong { field, len, max } => {
                write!(f, "{} is {} bytes, field holds {}", field, len, max)
            }
        }
    }
}

/// Read or write transfer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsaTransfer {
    pub handle: u32,
    /// Bytes per element
    pub size: u32,
    /// Element count
    pub count: u32,
    /// File position, used with [`FsReadFlag::WITH_POS`]
    pub pos: u32,
    pub flags: FsReadFlag,
}

impl FsaTransfer {
    pub fn byte_len(&self) -> u32 {
        self.size.saturating_mul(self.count)
    }
}

/// Request record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsaRequest {
    Mount { source: String, target: String },
    Unmount { target: String },
    GetVolumeInfo { path: String },
    ChangeDir { path: String },
    GetCwd,
    MakeDir { path: String, permission: u32 },
    Remove { path: String },
    Rename { from: String, to: String },
    OpenDir { path: String },
    ReadDir { handle: u32 },
    RewindDir { handle: u32 },
    CloseDir { handle: u32 },
    OpenFile { path: String, mode: String },
    ReadFile(FsaTransfer),
    WriteFile(FsaTransfer),
    GetPosFile { handle: u32 },
    SetPosFile { handle: u32, pos: u32 },
    IsEof { handle: u32 },
    StatFile { handle: u32 },
    CloseFile { handle: u32 },
    FlushFile { handle: u32 },
    TruncateFile { handle: u32 },
    ChangeMode { path: String, mode: u32, mask: u32 },
}

impl FsaRequest {
    pub fn command(&self) -> FsaCommand {
        match self {
            FsaRequest::Mount { .. } => FsaCommand::Mount,
            FsaRequest::Unmount { .. } => FsaCommand::Unmount,
            FsaRequest::GetVolumeInfo { .. } => FsaCommand::GetVolumeInfo,
            FsaRequest::ChangeDir { .. } => FsaCommand::ChangeDir,
            FsaRequest::GetCwd => FsaCommand::GetCwd,
            FsaRequest::MakeDir { .. } => FsaCommand::MakeDir,
            FsaRequest::Remove { .. } => FsaCommand::Remove,
            FsaRequest::Rename { .. } => FsaCommand::Rename,
            FsaRequest::OpenDir { .. } => FsaCommand::OpenDir,
            FsaRequest::ReadDir { .. } => FsaCommand::ReadDir,
            FsaRequest::RewindDir { .. } => FsaCommand::RewindDir,
            FsaRequest::CloseDir { .. } => FsaCommand::CloseDir,
            FsaRequest::OpenFile { .. } => FsaCommand::OpenFile,
            FsaRequest::ReadFile(_) => FsaCommand::ReadFile,
            FsaRequest::WriteFile(_) => FsaCommand::WriteFile,
            FsaRequest::GetPosFile { .. } => FsaCommand::GetPosFile,
            FsaRequest::SetPosFile { .. } => FsaCommand::SetPosFile,
            FsaRequest::IsEof { .. } => FsaCommand::IsEof,
            FsaRequest::StatFile { .. } => FsaCommand::StatFile,
            FsaRequest::CloseFile { .. } => FsaCommand::CloseFile,
            FsaRequest::FlushFile { .. } => FsaCommand::FlushFile,
            FsaRequest::TruncateFile { .. } => FsaCommand::TruncateFile,
            FsaRequest::ChangeMode { .. } => FsaCommand::ChangeMode,
        }
    }

    /// Transfer parameters of a read or write.
    pub fn transfer(&self) -> Option<&FsaTransfer> {
        match self {
            FsaRequest::ReadFile(transfer) | FsaRequest::WriteFile(transfer) => Some(transfer),
            _ => None,
        }
    }

    pub fn transfer_mut(&mut self) -> Option<&mut FsaTransfer> {
        match self {
            FsaRequest::ReadFile(transfer) | FsaRequest::WriteFile(transfer) => Some(transfer),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ShimError> {
        let mut w = Writer::default();
        w.u32(self.command() as u32);

        match self {
            FsaRequest::Mount { source, target } => {
                w.str("source", source, FSA_PATH_LEN)?;
                w.str("target", target, FSA_PATH_LEN)?;
            }
            FsaRequest::Unmount { target: path }
            | FsaRequest::GetVolumeInfo { path }
            | FsaRequest::ChangeDir { path }
            | FsaRequest::Remove { path }
            | FsaRequest::OpenDir { path } => w.str("path", path, FSA_PATH_LEN)?,
            FsaRequest::GetCwd => {}
            FsaRequest::MakeDir { path, permission } => {
                w.str("path", path, FSA_PATH_LEN)?;
                w.u32(*permission);
            }
            FsaRequest::Rename { from, to } => {
                w.str("from", from, FSA_PATH_LEN)?;
                w.str("to", to, FSA_PATH_LEN)?;
            }
            FsaRequest::ReadDir { handle }
            | FsaRequest::RewindDir { handle }
            | FsaRequest::CloseDir { handle }
            | FsaRequest::GetPosFile { handle }
            | FsaRequest::IsEof { handle }
            | FsaRequest::StatFile { handle }
            | FsaRequest::CloseFile { handle }
            | FsaRequest::FlushFile { handle }
            | FsaRequest::TruncateFile { handle } => w.u32(*handle),
            FsaRequest::OpenFile { path, mode } => {
                w.str("path", path, FSA_PATH_LEN)?;
                w.str("mode", mode, FSA_MODE_LEN)?;
            }
            FsaRequest::ReadFile(transfer) | FsaRequest::WriteFile(transfer) => {
                w.u32(transfer.handle);
                w.u32(transfer.size);
                w.u32(transfer.count);
                w.u32(transfer.pos);
                w.u32(transfer.flags.bits());
            }
            FsaRequest::SetPosFile { handle, pos } => {
                w.u32(*handle);
                w.u32(*pos);
            }
            FsaRequest::ChangeMode { path, mode, mask } => {
                w.str("path", path, FSA_PATH_LEN)?;
                w.u32(*mode);
                w.u32(*mask);
            }
        }

        Ok(w.finish())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ShimError> {
        let mut r = Reader::new(data);
        let raw = r.u32()?;
        let command = FsaCommand::from_u32(raw).ok_or(ShimError::UnknownCommand(raw))?;

        Ok(match command {
            FsaCommand::Mount => FsaRequest::Mount {
                source: r.str(FSA_PATH_LEN)?,
                target: r.str(FSA_PATH_LEN)?,
            },
            FsaCommand::Unmount => FsaRequest::Unmount {
                target: r.str(FSA_PATH_LEN)?,
            },
            FsaCommand::GetVolumeInfo => FsaRequest::GetVolumeInfo {
                path: r.str(FSA_PATH_LEN)?,
            },
            FsaCommand::ChangeDir => FsaRequest::ChangeDir {
                path: r.str(FSA_PATH_LEN)?,
            },
            FsaCommand::GetCwd => FsaRequest::GetCwd,
            FsaCommand::MakeDir => FsaRequest::MakeDir {
                path: r.str(FSA_PATH_LEN)?,
                permission: r.u32()?,
            },
            FsaCommand::Remove => FsaRequest::Remove {
                path: r.str(FSA_PATH_LEN)?,
            },
            FsaCommand::Rename => FsaRequest::Rename {
                from: r.str(FSA_PATH_LEN)?,
                to: r.str(FSA_PATH_LEN)?,
            },
            FsaCommand::OpenDir => FsaRequest::OpenDir {
                path: r.str(FSA_PATH_LEN)?,
            },
            FsaCommand::ReadDir => FsaRequest::ReadDir { handle: r.u32()? },
            FsaCommand::RewindDir => FsaRequest::RewindDir { handle: r.u32()? },
            FsaCommand::CloseDir => FsaRequest::CloseDir { handle: r.u32()? },
            FsaCommand::OpenFile => FsaRequest::OpenFile {
                path: r.str(FSA_PATH_LEN)?,
                mode: r.str(FSA_MODE_LEN)?,
            },
            FsaCommand::ReadFile => FsaRequest::ReadFile(r.transfer()?),
            FsaCommand::WriteFile => FsaRequest::WriteFile(r.transfer()?),
            FsaCommand::GetPosFile => FsaRequest::GetPosFile { handle: r.u32()? },
            FsaCommand::SetPosFile => FsaRequest::SetPosFile {
                handle: r.u32()?,
                pos: r.u32()?,
            },
            FsaCommand::IsEof => FsaRequest::IsEof { handle: r.u32()? },
            FsaCommand::StatFile => FsaRequest::StatFile { handle: r.u32()? },
            FsaCommand::CloseFile => FsaRequest::CloseFile { handle: r.u32()? },
            FsaCommand::FlushFile => FsaRequest::FlushFile { handle: r.u32()? },
            FsaCommand::TruncateFile => FsaRequest::TruncateFile { handle: r.u32()? },
            FsaCommand::ChangeMode => FsaRequest::ChangeMode {
                path: r.str(FSA_PATH_LEN)?,
                mode: r.u32()?,
                mask: r.u32()?,
            },
        })
    }
}

/// File or directory attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsStat {
    pub flags: u32,
    pub permission: u32,
    pub owner: u32,
    pub group: u32,
    pub size: u32,
    pub alloc_size: u32,
    pub entry_id: u32,
    pub created: u64,
    pub modified: u64,
}

impl FsStat {
    /// Set in `flags` for directories.
    pub const DIRECTORY: u32 = 0x8000_0000;

    pub fn is_directory(&self) -> bool {
        self.flags & Self::DIRECTORY != 0
    }

    fn write(&self, w: &mut Writer) {
        w.u32(self.flags);
        w.u32(self.permission);
        w.u32(self.owner);
        w.u32(self.group);
        w.u32(self.size);
        w.u32(self.alloc_size);
        w.u32(self.entry_id);
        w.u64(self.created);
        w.u64(self.modified);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, ShimError> {
        Ok(Self {
            flags: r.u32()?,
            permission: r.u32()?,
            owner: r.u32()?,
            group: r.u32()?,
            size: r.u32()?,
            alloc_size: r.u32()?,
            entry_id: r.u32()?,
            created: r.u64()?,
            modified: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsDirEntry {
    pub stat: FsStat,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsVolumeInfo {
    pub flags: u32,
    pub media_state: u32,
    /// Normalized on copy-out to `[0, 0, -1, -1]`
    pub reserved: [i32; 4],
    pub volume_label: String,
    pub volume_id: String,
    pub dev_path: String,
    pub mount_path: String,
}

/// Response record, shaped by the command it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsaResponse {
    Empty,
    Handle(u32),
    Pos(u32),
    Stat(FsStat),
    DirEntry(FsDirEntry),
    Cwd(String),
    VolumeInfo(FsVolumeInfo),
}

impl FsaResponse {
    /// Encodes and zero-pads to [`FSA_RESPONSE_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>, ShimError> {
        let mut w = Writer::default();

        match self {
            FsaResponse::Empty => {}
            FsaResponse::Handle(value) | FsaResponse::Pos(value) => w.u32(*value),
            FsaResponse::Stat(stat) => stat.write(&mut w),
            FsaResponse::DirEntry(entry) => {
                entry.stat.write(&mut w);
                w.str("name", &entry.name, FSA_NAME_LEN)?;
            }
            FsaResponse::Cwd(path) => w.str("cwd", path, FSA_PATH_LEN)?,
            FsaResponse::VolumeInfo(info) => {
                w.u32(info.flags);
                w.u32(info.media_state);
                for value in info.reserved {
                    w.u32(value as u32);
                }
                w.str("volume_label", &info.volume_label, FSA_VOLUME_STR_LEN)?;
                w.str("volume_id", &info.volume_id, FSA_VOLUME_STR_LEN)?;
                w.str("dev_path", &info.dev_path, FSA_VOLUME_STR_LEN)?;
                w.str("mount_path", &info.mount_path, FSA_VOLUME_STR_LEN)?;
            }
        }

        let mut data = w.finish();
        data.resize(FSA_RESPONSE_LEN, 0);
        Ok(data)
    }

    /// Decodes the response to `command`.
    pub fn decode(command: FsaCommand, data: &[u8]) -> Result<Self, ShimError> {
        let mut r = Reader::new(data);

        Ok(match command {
            FsaCommand::OpenDir | FsaCommand::OpenFile => FsaResponse::Handle(r.u32()?),
            FsaCommand::GetPosFile => FsaResponse::Pos(r.u32()?),
            FsaCommand::StatFile => FsaResponse::Stat(FsStat::read(&mut r)?),
            FsaCommand::ReadDir => FsaResponse::DirEntry(FsDirEntry {
                stat: FsStat::read(&mut r)?,
                name: r.str(FSA_NAME_LEN)?,
            }),
            FsaCommand::GetCwd => FsaResponse::Cwd(r.str(FSA_PATH_LEN)?),
            FsaCommand::GetVolumeInfo => FsaResponse::VolumeInfo(FsVolumeInfo {
                flags: r.u32()?,
                media_state: r.u32()?,
                reserved: [r.u32()? as i32, r.u32()? as i32, r.u32()? as i32, r.u32()? as i32],
                volume_label: r.str(FSA_VOLUME_STR_LEN)?,
                volume_id: r.str(FSA_VOLUME_STR_LEN)?,
                dev_path: r.str(FSA_VOLUME_STR_LEN)?,
                mount_path: r.str(FSA_VOLUME_STR_LEN)?,
            }),
            _ => FsaResponse::Empty,
        })
    }
}

#[derive(Default)]
struct Writer {
    data: Vec<u8>,
}

impl Writer {
    fn u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    /// Fixed-width field; at least one NUL always follows the string.
    fn str(&mut self, field: &'static str, value: &str, width: usize) -> Result<(), ShimError> {
        let bytes = value.as_bytes();
        if bytes.len() >= width {
            return Err(ShimError::FieldTooLong {
                field,
                len: bytes.len(),
                max: width - 1,
            });
        }
        self.data.extend_from_slice(bytes);
        self.data.resize(self.data.len() + width - bytes.len(), 0);
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.data
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ShimError> {
        if self.pos + len > self.data.len() {
            return Err(ShimError::Truncated);
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32, ShimError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, ShimError> {
        let high = self.u32()? as u64;
        let low = self.u32()? as u64;
        Ok((high << 32) | low)
    }

    /// Reads a fixed-width field up to its first NUL. A field with no NUL
    /// is returned whole.
    fn str(&mut self, width: usize) -> Result<String, ShimError> {
        let bytes = self.take(width)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    fn transfer(&mut self) -> Result<FsaTransfer, ShimError> {
        Ok(FsaTransfer {
            handle: self.u32()?,
            size: self.u32()?,
            count: self.u32()?,
            pos: self.u32()?,
            flags: FsReadFlag::from_bits_truncate(self.u32()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let data = FsaRequest::SetPosFile { handle: 7, pos: 0x1234 }.encode().unwrap();
        assert_eq!(data, vec![0, 0, 0, 0x12, 0, 0, 0, 7, 0, 0, 0x12, 0x34]);

        let data = FsaRequest::OpenFile {
            path: "/vol/content/a".into(),
            mode: "r".into(),
        }
        .encode()
        .unwrap();
        assert_eq!(data.len(), 4 + FSA_PATH_LEN + FSA_MODE_LEN);
        assert_eq!(data[4 + FSA_PATH_LEN], b'r');
    }

    #[test]
    fn test_request_decode() {
        let request = FsaRequest::ReadFile(FsaTransfer {
            handle: 3,
            size: 0x40,
            count: 2,
            pos: 0x100,
            flags: FsReadFlag::WITH_POS,
        });
        let decoded = FsaRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.transfer().map(FsaTransfer::byte_len), Some(0x80));
    }

    #[test]
    fn test_path_must_leave_room_for_nul() {
        let path = "a".repeat(FSA_PATH_LEN);
        let result = FsaRequest::ChangeDir { path }.encode();
        assert!(matches!(result, Err(ShimError::FieldTooLong { field: "path", .. })));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(FsaRequest::decode(&[0, 0, 0, 0x4]), Err(ShimError::UnknownCommand(4)));
        assert_eq!(FsaRequest::decode(&[0, 0]), Err(ShimError::Truncated));
    }

    #[test]
    fn test_response_is_padded() {
        let data = FsaResponse::Handle(0x55).encode().unwrap();
        assert_eq!(data.len(), FSA_RESPONSE_LEN);
        assert_eq!(
            FsaResponse::decode(FsaCommand::OpenFile, &data),
            Ok(FsaResponse::Handle(0x55))
        );
        assert_eq!(
            FsaResponse::decode(FsaCommand::CloseFile, &data),
            Ok(FsaResponse::Empty)
        );
    }

    #[test]
    fn test_dir_entry_response() {
        let entry = FsDirEntry {
            stat: FsStat {
                flags: FsStat::DIRECTORY,
                size: 0,
                modified: 0x1_0000_0002,
                ..FsStat::default()
            },
            name: "save".into(),
        };
        let data = FsaResponse::DirEntry(entry.clone()).encode().unwrap();
        match FsaResponse::decode(FsaCommand::ReadDir, &data).unwrap() {
            FsaResponse::DirEntry(decoded) => {
                assert_eq!(decoded, entry);
                assert!(decoded.stat.is_directory());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_vectored_commands() {
        assert!(FsaCommand::ReadFile.is_vectored());
        assert!(FsaCommand::WriteFile.is_vectored());
        assert!(!FsaCommand::StatFile.is_vectored());
        assert_eq!(FsaCommand::from_u32(0x20), Some(FsaCommand::ChangeMode));
        assert_eq!(FsaCommand::from_u32(0x4), None);
    }
}
