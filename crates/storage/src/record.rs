use crate::{PageId, INVALID_PAGE_ID};

/// Delimiter byte used when joining record attributes into their wire form.
pub const RECORD_DELIMITER: char = '|';

/// A stored tuple: an integer id plus an ordered list of opaque attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: i64,
    pub attrs: Vec<String>,
}

impl Record {
    pub fn new(id: i64, attrs: Vec<String>) -> Self {
        Self { id, attrs }
    }

    /// Joins the attributes with the reserved delimiter.
    pub fn serialize(&self) -> String {
        self.attrs.join("|")
    }

    /// Rebuilds a record from its wire form. The empty string decodes to a
    /// single empty attribute, mirroring `serialize` of such a record.
    pub fn deserialize(id: i64, payload: &str) -> Self {
        let attrs = payload.split(RECORD_DELIMITER).map(str::to_owned).collect();
        Self { id, attrs }
    }
}

/// Durable location of a record: the page holding it and its slot there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordPtr {
    pub page_id: PageId,
    pub slot: u16,
}

impl RecordPtr {
    /// Sentinel pointer returned by failed lookups.
    pub const INVALID: RecordPtr = RecordPtr {
        page_id: INVALID_PAGE_ID,
        slot: 0,
    };

    pub fn new(page_id: PageId, slot: u16) -> Self {
        Self { page_id, slot }
    }

    pub fn is_valid(&self) -> bool {
        self.page_id != INVALID_PAGE_ID
    }
}
