//! Sync action records: the planner's view of one file modification.
//!
//! Sync output arrives either as tagged records or as console text; both
//! parse into [`SyncActionInfo`]. The canonical action names match the
//! server's tagged `action` values (`Added`, `Deleted`, ...).

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use super::revision::Revision;
use crate::logging::OperationLog;

/// What the server planned (or reported) for one file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncActionKind {
    None,
    Added,
    Deleted,
    Updated,
    Refreshed,
    Replaced,
    UpToDate,
    NoFilesFound,
    NoFileAtRevision,
    InvalidPattern,
    NotInClientView,
    OpenedNotChanged,
    CantClobber,
    NeedsResolve,
    GenericError,
}

impl SyncActionKind {
    pub fn from_name(name: &str) -> SyncActionKind {
        match name {
            _ if name.eq_ignore_ascii_case("added") => SyncActionKind::Added,
            _ if name.eq_ignore_ascii_case("deleted") => SyncActionKind::Deleted,
            _ if name.eq_ignore_ascii_case("updated") => SyncActionKind::Updated,
            _ if name.eq_ignore_ascii_case("refreshed") => SyncActionKind::Refreshed,
            _ if name.eq_ignore_ascii_case("replaced") => SyncActionKind::Replaced,
            _ if name.eq_ignore_ascii_case("uptodate") => SyncActionKind::UpToDate,
            _ if name.eq_ignore_ascii_case("nofilesfound") => SyncActionKind::NoFilesFound,
            _ if name.eq_ignore_ascii_case("nofileatrevision") => SyncActionKind::NoFileAtRevision,
            _ if name.eq_ignore_ascii_case("invalidpattern") => SyncActionKind::InvalidPattern,
            _ if name.eq_ignore_ascii_case("notinclientview") => SyncActionKind::NotInClientView,
            _ if name.eq_ignore_ascii_case("openednotchanged") => SyncActionKind::OpenedNotChanged,
            _ if name.eq_ignore_ascii_case("cantclobber") => SyncActionKind::CantClobber,
            _ if name.eq_ignore_ascii_case("needsresolve") => SyncActionKind::NeedsResolve,
            _ if name.eq_ignore_ascii_case("genericerror") => SyncActionKind::GenericError,
            _ => SyncActionKind::None,
        }
    }

    /// Kinds the engine treats as changing the local filesystem.
    pub fn is_local_changed(self) -> bool {
        matches!(
            self,
            SyncActionKind::Added
                | SyncActionKind::Updated
                | SyncActionKind::Refreshed
                | SyncActionKind::Replaced
        )
    }

    pub fn is_changed(self) -> bool {
        self.is_local_changed() || self == SyncActionKind::Deleted
    }
}

impl fmt::Display for SyncActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncActionKind::None => "None",
            SyncActionKind::Added => "Added",
            SyncActionKind::Deleted => "Deleted",
            SyncActionKind::Updated => "Updated",
            SyncActionKind::Refreshed => "Refreshed",
            SyncActionKind::Replaced => "Replaced",
            SyncActionKind::UpToDate => "UpToDate",
            SyncActionKind::NoFilesFound => "NoFilesFound",
            SyncActionKind::NoFileAtRevision => "NoFileAtRevision",
            SyncActionKind::InvalidPattern => "InvalidPattern",
            SyncActionKind::NotInClientView => "NotInClientView",
            SyncActionKind::OpenedNotChanged => "OpenedNotChanged",
            SyncActionKind::CantClobber => "CantClobber",
            SyncActionKind::NeedsResolve => "NeedsResolve",
            SyncActionKind::GenericError => "GenericError",
        };
        f.write_str(name)
    }
}

/// Per-action writability and link flags, a small bitset.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SyncActionFlags(u32);

impl SyncActionFlags {
    pub const NONE: SyncActionFlags = SyncActionFlags(0);
    /// Head revision has a writable file type (`+w`).
    pub const FILE_WRITE: SyncActionFlags = SyncActionFlags(1 << 0);
    /// Have revision has a writable file type.
    pub const HAVE_FILE_WRITE: SyncActionFlags = SyncActionFlags(1 << 1);
    /// Client spec carries `allwrite`.
    pub const CLIENT_WRITE: SyncActionFlags = SyncActionFlags(1 << 2);
    /// Client spec carries `clobber`.
    pub const CLIENT_CLOBBER: SyncActionFlags = SyncActionFlags(1 << 3);
    /// Either side is a symlink file type.
    pub const FILE_SYMLINK: SyncActionFlags = SyncActionFlags(1 << 4);

    pub fn contains(self, other: SyncActionFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: SyncActionFlags) {
        self.0 |= other.0;
    }
}

/// Options for one sync invocation, a small bitset.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SyncFlags(u32);

impl SyncFlags {
    pub const NORMAL: SyncFlags = SyncFlags(0);
    /// `-f`: force resynchronization, overwriting writable files.
    pub const FORCE: SyncFlags = SyncFlags(1 << 0);
    /// `-k`: update the have-table without transferring content.
    pub const FLUSH: SyncFlags = SyncFlags(1 << 1);
    /// `-n`: preview without changing anything.
    pub const PREVIEW: SyncFlags = SyncFlags(1 << 2);
    /// Discard the parsed output entirely.
    pub const IGNORE_OUTPUT: SyncFlags = SyncFlags(1 << 3);
    /// Use tagged output and suppress low-severity console lines.
    pub const QUIET: SyncFlags = SyncFlags(1 << 4);
    /// Install placeholders writable and allow clobbering writable files.
    pub const WRITEABLE: SyncFlags = SyncFlags(1 << 5);
    /// Ask the server for client-side file sizes (`sizes -C`).
    pub const CLIENT_SIZE: SyncFlags = SyncFlags(1 << 6);

    pub fn contains(self, other: SyncFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: SyncFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SyncFlags) {
        self.0 &= !other.0;
    }

    pub fn union(self, other: SyncFlags) -> SyncFlags {
        SyncFlags(self.0 | other.0)
    }
}

/// How the have-table is brought up to date by a virtual sync.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlushMode {
    /// One batch-wide `sync -k` performed by the plan command itself.
    Single,
    /// Each placeholder install is paired with its own per-file `sync -k`.
    Atomic,
}

impl FlushMode {
    pub fn from_name(name: &str) -> Option<FlushMode> {
        if name.eq_ignore_ascii_case("single") {
            Some(FlushMode::Single)
        } else if name.eq_ignore_ascii_case("atomic") {
            Some(FlushMode::Atomic)
        } else {
            None
        }
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlushMode::Single => "Single",
            FlushMode::Atomic => "Atomic",
        })
    }
}

/// One planned or reported file modification.
#[derive(Debug, Clone)]
pub struct SyncActionInfo {
    pub depot_file: String,
    pub client_file: String,
    pub file_size: i64,
    pub revision: Option<Revision>,
    pub kind: SyncActionKind,
    pub action_flags: SyncActionFlags,
    pub sync_flags: SyncFlags,
    pub flush_mode: FlushMode,
    pub is_always_resident: bool,
    pub virtual_file_size: i64,
    pub disk_file_size: i64,
    pub placeholder_time_ms: i64,
    pub flush_time_ms: i64,
    pub sync_time_ms: i64,
    pub message: String,
    pub sub_actions: Vec<SyncActionInfo>,
}

impl Default for SyncActionInfo {
    fn default() -> Self {
        Self {
            depot_file: String::new(),
            client_file: String::new(),
            file_size: 0,
            revision: None,
            kind: SyncActionKind::None,
            action_flags: SyncActionFlags::NONE,
            sync_flags: SyncFlags::NORMAL,
            flush_mode: FlushMode::Atomic,
            is_always_resident: false,
            virtual_file_size: 0,
            disk_file_size: 0,
            placeholder_time_ms: 0,
            flush_time_ms: 0,
            sync_time_ms: 0,
            message: String::new(),
            sub_actions: Vec::new(),
        }
    }
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static sync pattern"))
}

impl SyncActionInfo {
    /// The numeric file revision, 0 when absent or non-numeric.
    pub fn revision_number(&self) -> i32 {
        self.revision.as_ref().and_then(Revision::number).unwrap_or(0)
    }

    /// True when the engine may overwrite an existing writable file.
    pub fn can_modify_writable_file(&self) -> bool {
        if self.sync_flags.contains(SyncFlags::FORCE) {
            return true;
        }
        self.action_flags.contains(SyncActionFlags(
            SyncActionFlags::CLIENT_CLOBBER.0
                | SyncActionFlags::CLIENT_WRITE.0
                | SyncActionFlags::FILE_WRITE.0
                | SyncActionFlags::HAVE_FILE_WRITE.0
                | SyncActionFlags::FILE_SYMLINK.0,
        ))
    }

    /// True when the installed file should be left writable.
    pub fn can_set_writable_file(&self) -> bool {
        self.action_flags
            .contains(SyncActionFlags(SyncActionFlags::CLIENT_WRITE.0 | SyncActionFlags::FILE_WRITE.0))
    }

    pub fn is_preview(&self) -> bool {
        self.sync_flags.contains(SyncFlags::PREVIEW)
    }

    /// `//depot/file#rev` (or the client file when no depot file is known).
    pub fn file_spec(&self) -> String {
        let rev = Revision::to_spec_string(self.revision.as_ref());
        if !self.depot_file.is_empty() {
            format!("{}{}", self.depot_file, rev)
        } else if !self.client_file.is_empty() {
            format!("{}{}", self.client_file, rev)
        } else {
            String::new()
        }
    }

    /// Parses one tagged sync record. Unknown actions log and yield `None`.
    pub fn from_tagged(tag: &super::result::DepotTag, log: &OperationLog) -> Option<SyncActionInfo> {
        let action = tag.get("action");
        let kind = SyncActionKind::from_name(action);
        if kind == SyncActionKind::None {
            log.error(format!("Failed to parse action tag '{action}'"));
            return None;
        }
        Some(SyncActionInfo {
            kind,
            revision: Some(Revision::Number(tag.get_i32("rev"))),
            client_file: tag.get("clientFile").to_string(),
            depot_file: tag.get("depotFile").to_string(),
            file_size: tag.get_i64("fileSize"),
            ..Default::default()
        })
    }

    /// Parses one stdout sync line (`//depot/f#3 - updating c:\w\f`).
    pub fn from_info_output(text: &str, log: &OperationLog) -> Option<SyncActionInfo> {
        static FILE_REV: OnceLock<Regex> = OnceLock::new();
        static OPENED: OnceLock<Regex> = OnceLock::new();
        static DELETED: OnceLock<Regex> = OnceLock::new();
        static ADDED: OnceLock<Regex> = OnceLock::new();
        static UPDATED: OnceLock<Regex> = OnceLock::new();
        static RESOLVE: OnceLock<Regex> = OnceLock::new();

        let mut info = SyncActionInfo { message: text.trim_end().to_string(), ..Default::default() };

        if let Some(m) = regex(&FILE_REV, r"^([^#]*)(#\w+)? - (.+)").captures(text) {
            info.depot_file = m[1].to_string();
            info.revision = m.get(2).and_then(|r| Revision::parse(r.as_str()));
            let action = m[3].to_string();

            if regex(&OPENED, r"^is opened .+").is_match(&action) {
                info.kind = SyncActionKind::OpenedNotChanged;
            } else if let Some(m) = regex(&DELETED, r"^deleted as (.+)").captures(&action) {
                info.kind = SyncActionKind::Deleted;
                info.client_file = m[1].to_string();
            } else if let Some(m) = regex(&ADDED, r"^added as (.+)").captures(&action) {
                info.kind = SyncActionKind::Added;
                info.client_file = m[1].to_string();
            } else if let Some(m) = regex(&UPDATED, r"^updating (.+)").captures(&action) {
                info.kind = SyncActionKind::Updated;
                info.client_file = m[1].to_string();
            }
        } else if let Some(m) = regex(&RESOLVE, r"^(\.\.\.\s+)*(.*) - must resolve( (#\w+))? before submitting")
            .captures(text)
        {
            info.depot_file = m[2].to_string();
            info.revision = m.get(4).and_then(|r| Revision::parse(r.as_str()));
            info.kind = SyncActionKind::NeedsResolve;
        }

        if info.kind == SyncActionKind::None {
            log.error(format!("Failed to parse sync info output '{text}'"));
            return None;
        }
        Some(info)
    }

    /// Parses one stderr sync line. Unrecognized lines become
    /// [`SyncActionKind::GenericError`] carrying the message.
    pub fn from_error_output(text: &str) -> SyncActionInfo {
        static FILE_REV: OnceLock<Regex> = OnceLock::new();
        static NO_FILE_AT_REV: OnceLock<Regex> = OnceLock::new();
        static INVALID_PATTERN: OnceLock<Regex> = OnceLock::new();
        static NOT_IN_VIEW: OnceLock<Regex> = OnceLock::new();
        static NO_FILES_FOUND: OnceLock<Regex> = OnceLock::new();
        static UP_TO_DATE: OnceLock<Regex> = OnceLock::new();
        static CANT_CLOBBER: OnceLock<Regex> = OnceLock::new();

        let mut info = SyncActionInfo { message: text.trim_end().to_string(), ..Default::default() };

        if let Some(m) = regex(&FILE_REV, r"^([^#]*)(#\w+)? - (.+)").captures(text) {
            info.depot_file = m[1].to_string();
            info.revision = m.get(2).and_then(|r| Revision::parse(r.as_str()));
            let action = m[3].to_string();

            if regex(&NO_FILE_AT_REV, r"^no file\(s\) at that revision").is_match(&action) {
                info.kind = SyncActionKind::NoFileAtRevision;
            } else if regex(&INVALID_PATTERN, r"^no such file\(s\)").is_match(&action) {
                info.kind = SyncActionKind::InvalidPattern;
            } else if regex(&NOT_IN_VIEW, r"^file\(s\) not in client view").is_match(&action) {
                info.kind = SyncActionKind::NotInClientView;
            } else if regex(&NO_FILES_FOUND, r"^no file\(s\) at that changelist number").is_match(&action) {
                info.kind = SyncActionKind::NoFilesFound;
            } else if regex(&UP_TO_DATE, r"^file\(s\) up-to-date").is_match(&action) {
                info.kind = SyncActionKind::UpToDate;
            }
        } else if let Some(m) =
            regex(&CANT_CLOBBER, r"^Can't clobber writable file (.+)").captures(text)
        {
            info.client_file = m[1].to_string();
            info.kind = SyncActionKind::CantClobber;
        }

        if info.kind == SyncActionKind::None {
            info.kind = SyncActionKind::GenericError;
        }
        info
    }
}

impl fmt::Display for SyncActionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DepotFile='{}' ClientFile='{}' DepotRevision='{}' Action='{}'",
            self.depot_file,
            self.client_file,
            Revision::to_spec_string(self.revision.as_ref()),
            self.kind
        )
    }
}
