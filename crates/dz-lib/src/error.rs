use thiserror::Error;

/// Domain failures surfaced by the library.
///
/// Library functions return `anyhow::Result`; these variants are attached as
/// the root cause so callers can `downcast_ref::<DzError>()` to tell a corrupt
/// archive apart from a bad query.
#[derive(Error, Debug)]
pub enum DzError {
    /// Bad magic, truncated data, malformed block or SAM line
    #[error("Format error: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown sample, unknown chromosome or a region with no block
    #[error("Query error: {0}")]
    Query(String),
}

impl DzError {
    pub(crate) fn format(msg: impl Into<String>) -> anyhow::Error {
        DzError::Format(msg.into()).into()
    }

    pub(crate) fn query(msg: impl Into<String>) -> anyhow::Error {
        DzError::Query(msg.into()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_from_anyhow() {
        let err = DzError::format("bad magic");
        assert!(matches!(err.downcast_ref::<DzError>(), Some(DzError::Format(_))));
        assert_eq!(err.to_string(), "Format error: bad magic");
    }

    #[test]
    fn test_query_message() {
        let err = DzError::query("region not found");
        assert!(matches!(err.downcast_ref::<DzError>(), Some(DzError::Query(m)) if m == "region not found"));
    }
}
