use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Unknown label: {0}")]
    UnknownLabel(String),

    #[error("Row has no label")]
    MissingLabel,

    #[error("Label id out of range: {0}")]
    UnknownLabelId(usize),

    #[error("Duplicate label: {0}")]
    DuplicateLabel(String),

    #[error("Label ids are not dense 0..{len}: missing {missing}")]
    SparseLabelIds { len: usize, missing: usize },

    #[error("Unknown label scheme: {0}")]
    UnknownScheme(String),

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Malformed entity literal at offset {offset}: {reason}")]
    MalformedEntity { offset: usize, reason: String },

    #[error("Entity field missing: {0}")]
    MissingEntityField(&'static str),

    #[error("Entity span {start}..={end} is invalid for a sentence of {len} characters")]
    InvalidSpan { start: usize, end: usize, len: usize },

    #[error("Subject span {subject:?} overlaps object span {object:?}")]
    OverlappingSpans {
        subject: (usize, usize),
        object: (usize, usize),
    },

    #[error("Row {id}: {source}")]
    Row {
        id: String,
        #[source]
        source: Box<DataError>,
    },

    #[error("Invalid split: {0}")]
    InvalidSplit(String),
}

impl DataError {
    pub fn in_row(self, id: impl Into<String>) -> Self {
        DataError::Row {
            id: id.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
