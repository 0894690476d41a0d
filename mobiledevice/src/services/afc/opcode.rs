/// Operation carried in an AFC packet header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Status = 0x00000001,
    Data = 0x00000002,
    ReadDir = 0x00000003,
    RemovePath = 0x00000008,
    MakeDir = 0x00000009,
    GetFileInfo = 0x0000000a,
    GetDevInfo = 0x0000000b,
    FileOpen = 0x0000000d,
    FileOpenRes = 0x0000000e,
    Read = 0x0000000f,
    Write = 0x00000010,
    FileSeek = 0x00000011,
    FileTell = 0x00000012,
    FileTellRes = 0x00000013,
    FileClose = 0x00000014,
    FileSetSize = 0x00000015,
    RenamePath = 0x00000018,
    MakeLink = 0x0000001C,
    SetFileTime = 0x0000001E,
    RemovePathAndContents = 0x00000022,
}

/// How a file is opened
///
/// Mirrors the fopen mode strings the daemon understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcFopenMode {
    RdOnly = 0x00000001,   // r   O_RDONLY
    Rw = 0x00000002,       // r+  O_RDWR   | O_CREAT
    WrOnly = 0x00000003,   // w   O_WRONLY | O_CREAT  | O_TRUNC
    Wr = 0x00000004,       // w+  O_RDWR   | O_CREAT  | O_TRUNC
    Append = 0x00000005,   // a   O_WRONLY | O_APPEND | O_CREAT
    RdAppend = 0x00000006, // a+  O_RDWR   | O_APPEND | O_CREAT
}

impl AfcFopenMode {
    pub fn can_read(self) -> bool {
        !matches!(self, Self::WrOnly | Self::Append)
    }

    pub fn can_write(self) -> bool {
        !matches!(self, Self::RdOnly)
    }
}

impl TryFrom<u64> for AfcFopenMode {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::RdOnly),
            2 => Ok(Self::Rw),
            3 => Ok(Self::WrOnly),
            4 => Ok(Self::Wr),
            5 => Ok(Self::Append),
            6 => Ok(Self::RdAppend),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum LinkType {
    Hardlink = 0x00000001,
    Symlink = 0x00000002,
}

impl TryFrom<u64> for AfcOpcode {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0x00000001 => Ok(Self::Status),
            0x00000002 => Ok(Self::Data),
            0x00000003 => Ok(Self::ReadDir),
            0x00000008 => Ok(Self::RemovePath),
            0x00000009 => Ok(Self::MakeDir),
            0x0000000a => Ok(Self::GetFileInfo),
            0x0000000b => Ok(Self::GetDevInfo),
            0x0000000d => Ok(Self::FileOpen),
            0x0000000e => Ok(Self::FileOpenRes),
            0x0000000f => Ok(Self::Read),
            0x00000010 => Ok(Self::Write),
            0x00000011 => Ok(Self::FileSeek),
            0x00000012 => Ok(Self::FileTell),
            0x00000013 => Ok(Self::FileTellRes),
            0x00000014 => Ok(Self::FileClose),
            0x00000015 => Ok(Self::FileSetSize),
            0x00000018 => Ok(Self::RenamePath),
            0x0000001C => Ok(Self::MakeLink),
            0x0000001E => Ok(Self::SetFileTime),
            0x00000022 => Ok(Self::RemovePathAndContents),
            _ => Err(()),
        }
    }
}
