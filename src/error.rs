/// Error surface shared by every engine layer.
///
/// Every failure is reported to the caller; nothing is silently recovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed query, unknown column, unsupported aggregate, bad type tag.
    Invalid(String),
    /// File open/read/write failures in persistence.
    Io(String),
    /// A literal could not be parsed with the column's type.
    Parse(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Invalid(msg) => write!(f, "{msg}"),
            EngineError::Io(msg) => write!(f, "io error: {msg}"),
            EngineError::Parse(msg) => write!(f, "parse error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        EngineError::Io(value.to_string())
    }
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Invalid(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        EngineError::Parse(msg.into())
    }
}
