//! # drift-ipc
//!
//! Shared wire types: the single source of truth for every byte that
//! crosses a process boundary.
//!
//! - the one-byte control vocabulary spoken over the command fifos,
//! - the binary message record announced on `msg.fifo`,
//! - the operator line protocol (`211-` banners, `200`/`500`/`520`),
//! - the queue dump written on shutdown, and the process exit codes.

pub mod operator;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("unknown control byte {0}")]
    UnknownControlByte(u8),

    #[error("short message: {got} bytes, need {need}")]
    ShortMessage { got: usize, need: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dump codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, IpcError>;

/// The control-fifo vocabulary. Discriminants are wire bytes and must
/// never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCmd {
    Halt = 0,
    Stop = 1,
    Start = 2,
    SaveStop = 3,
    QuickStop = 4,
    Ackn = 5,
    NewData = 6,
    StartScanner = 7,
    StartDispatcher = 8,
    StopScanner = 9,
    StopDispatcher = 10,
    ScannerReady = 11,
    AcknStopped = 12,
    ProcTerm = 13,
    Debug = 14,
    Retry = 15,
    Queue = 16,
    Transfer = 17,
    IsAlive = 18,
    Shutdown = 19,
    TableAboutToChange = 20,
    CheckFileDir = 21,
    DisableMonitor = 22,
    EnableMonitor = 23,
    Trace = 24,
    FullTrace = 25,
    ExecStat = 26,
    SwitchMonitor = 27,
    ForceRemoteDirCheck = 28,
    GotLogClass = 29,
    ReloadInterfaceFile = 30,
    FlushMsgFifoDumpQueue = 31,
    CheckTableEntries = 32,
    DataReady = 33,
    BusyWorking = 34,
    ShutdownAll = 35,
    StartSystem = 36,
    StartSystemNoDirScan = 37,
    SearchOldFiles = 38,
}

impl ControlCmd {
    pub const MAX: u8 = ControlCmd::SearchOldFiles as u8;

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ControlCmd {
    type Error = IpcError;

    fn try_from(value: u8) -> Result<Self> {
        if value > Self::MAX {
            return Err(IpcError::UnknownControlByte(value));
        }
        // SAFETY: the enum is repr(u8) with contiguous discriminants
        // 0..=MAX, checked above.
        Ok(unsafe { std::mem::transmute::<u8, ControlCmd>(value) })
    }
}

/// Originator tags for [`SystemMsg`].
pub mod originator {
    pub const SCANNER: u8 = 0;
    pub const RETRY: u8 = 1;
    pub const OPERATOR: u8 = 2;
}

/// The binary record announced on `msg.fifo`, host byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMsg {
    pub creation_time: i64,
    pub file_size_to_send: i64,
    pub job_id: u32,
    pub dir_no: u32,
    pub unique_number: u32,
    pub files_to_send: u32,
    pub dir_flag: u16,
    pub priority: u8,
    pub originator: u8,
    pub _pad: [u8; 4],
}

/// Wire length of one [`SystemMsg`].
pub const MAX_BIN_MSG_LENGTH: usize = std::mem::size_of::<SystemMsg>();

const _: () = assert!(MAX_BIN_MSG_LENGTH == 40);

impl SystemMsg {
    pub fn to_bytes(&self) -> [u8; MAX_BIN_MSG_LENGTH] {
        // SAFETY: SystemMsg is repr(C) plain data of asserted size.
        unsafe { std::mem::transmute_copy(self) }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < MAX_BIN_MSG_LENGTH {
            return Err(IpcError::ShortMessage {
                got: buf.len(),
                need: MAX_BIN_MSG_LENGTH,
            });
        }
        let mut raw = [0u8; MAX_BIN_MSG_LENGTH];
        raw.copy_from_slice(&buf[..MAX_BIN_MSG_LENGTH]);
        // SAFETY: any bit pattern is a valid SystemMsg.
        Ok(unsafe { std::mem::transmute::<[u8; MAX_BIN_MSG_LENGTH], SystemMsg>(raw) })
    }
}

/// Queue state snapshot written on shutdown and read back on start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDump {
    pub written_at: i64,
    pub entries: Vec<DumpEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpEntry {
    pub msg_name: String,
    pub msg_number: f64,
    pub creation_time: i64,
    pub file_size_to_send: i64,
    pub files_to_send: u32,
    pub retries: u32,
    pub fsa_pos: i32,
    pub job_id: u32,
}

impl QueueDump {
    /// Serialize length-prefixed to `w`.
    pub fn write_to(&self, w: &mut impl std::io::Write) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        w.write_all(&(bytes.len() as u32).to_le_bytes())?;
        w.write_all(&bytes)?;
        Ok(())
    }

    pub fn read_from(r: &mut impl std::io::Read) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf)?;
        Ok(bincode::deserialize(&buf)?)
    }
}

/// Process exit codes shared by the binaries.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const INCORRECT: i32 = -1;
    pub const IS_ACTIVE: i32 = 5;
    pub const DISABLED_BY_SYSADM: i32 = 6;
    pub const NOT_RESPONDING: i32 = 9;
    pub const IS_NOT_ACTIVE: i32 = 10;
    pub const NOT_ON_CORRECT_HOST: i32 = 11;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_bytes_are_stable() {
        assert_eq!(ControlCmd::Halt.as_byte(), 0);
        assert_eq!(ControlCmd::Retry.as_byte(), 15);
        assert_eq!(ControlCmd::FlushMsgFifoDumpQueue.as_byte(), 31);
        assert_eq!(ControlCmd::SearchOldFiles.as_byte(), 38);
    }

    #[test]
    fn test_control_byte_roundtrip() {
        for b in 0..=ControlCmd::MAX {
            let cmd = ControlCmd::try_from(b).unwrap();
            assert_eq!(cmd.as_byte(), b);
        }
        assert!(matches!(
            ControlCmd::try_from(39),
            Err(IpcError::UnknownControlByte(39))
        ));
    }

    #[test]
    fn test_system_msg_roundtrip() {
        let msg = SystemMsg {
            creation_time: 0x5f3a2b10,
            file_size_to_send: 1500,
            job_id: 0xcafe,
            dir_no: 2,
            unique_number: 7,
            files_to_send: 3,
            dir_flag: 0x0001,
            priority: b'5',
            originator: originator::SCANNER,
            _pad: [0; 4],
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), MAX_BIN_MSG_LENGTH);
        assert_eq!(SystemMsg::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_system_msg_rejects_short_buffer() {
        assert!(matches!(
            SystemMsg::from_bytes(&[0u8; 10]),
            Err(IpcError::ShortMessage { got: 10, .. })
        ));
    }

    #[test]
    fn test_queue_dump_roundtrip() {
        let dump = QueueDump {
            written_at: 1_700_000_000,
            entries: vec![DumpEntry {
                msg_name: "5f3a2b10_0001_0".to_string(),
                msg_number: 1.5,
                creation_time: 0x5f3a2b10,
                file_size_to_send: 1000,
                files_to_send: 2,
                retries: 0,
                fsa_pos: 0,
                job_id: 0xcafe,
            }],
        };

        let mut buf = Vec::new();
        dump.write_to(&mut buf).unwrap();
        let back = QueueDump::read_from(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(back, dump);
    }
}
