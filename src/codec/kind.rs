use super::checksum::{CRC_LEN_U16, CRC_LEN_U8};

/// WAL record kinds. Discriminants are the on-disk kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    Header = 1,
    NewLog = 2,
    DeleteLog = 3,
    Commit = 4,
    Abort = 5,
    Insert = 6,
    /// Insert that also records the row's next free-list link.
    InsertLinked = 7,
    Update = 8,
    Delete = 9,
    /// Delete that pushes the row onto the table's free list.
    DeleteLinked = 10,
    RowAdded = 11,
    RowFreed = 12,
    RecordMoved = 13,
    NoOp = 14,
    EndMarker = 15,
    Sync = 16,
}

impl RecordKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        use RecordKind::*;
        Some(match value {
            1 => Header,
            2 => NewLog,
            3 => DeleteLog,
            4 => Commit,
            5 => Abort,
            6 => Insert,
            7 => InsertLinked,
            8 => Update,
            9 => Delete,
            10 => DeleteLinked,
            11 => RowAdded,
            12 => RowFreed,
            13 => RecordMoved,
            14 => NoOp,
            15 => EndMarker,
            16 => Sync,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Small fixed-shape markers get a one-byte checksum.
    pub fn checksum_width(self) -> usize {
        match self {
            RecordKind::Commit
            | RecordKind::Abort
            | RecordKind::NoOp
            | RecordKind::EndMarker
            | RecordKind::Sync => CRC_LEN_U8,
            _ => CRC_LEN_U16,
        }
    }

    pub fn name(self) -> &'static str {
        use RecordKind::*;
        match self {
            Header => "header",
            NewLog => "new-log",
            DeleteLog => "delete-log",
            Commit => "commit",
            Abort => "abort",
            Insert => "insert",
            InsertLinked => "insert-linked",
            Update => "update",
            Delete => "delete",
            DeleteLinked => "delete-linked",
            RowAdded => "row-added",
            RowFreed => "row-freed",
            RecordMoved => "record-moved",
            NoOp => "no-op",
            EndMarker => "end-marker",
            Sync => "sync",
        }
    }
}
