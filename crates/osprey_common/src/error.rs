use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias for `Result<T, OspreyError>`.
pub type OspreyResult<T> = Result<T, OspreyError>;

/// Top-level error type that the subsystem errors convert into.
#[derive(Error, Debug)]
pub enum OspreyError {
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// A memory or fanout budget could not be satisfied.
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the block stream engine.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not an osprey stream (bad magic or malformed header).
    #[error("Bad stream format: {0}")]
    Format(String),

    #[error("Stream version mismatch: found {found}, expected {expected}")]
    Version { found: u64, expected: u64 },

    /// Item or block geometry does not match what the caller asked for.
    #[error("Stream shape mismatch: {0}")]
    Shape(String),

    /// The stream was not sealed by a clean close; its tail may be truncated.
    #[error("Stream was not closed properly: {0}")]
    UncleanClose(PathBuf),

    #[error("Read past end of stream")]
    EndOfStream,

    /// Read on a write-only stream or write on a read-only stream.
    #[error("Access mode violation: {0}")]
    Access(String),

    #[error("Record serialization failed: {0}")]
    Serialization(String),
}

/// Errors raised by the pipeline runtime.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A phase has no node with in-degree zero under push/pull edges.
    #[error("Phase '{0}' has no initiator")]
    NoInitiator(String),

    /// A phase has more than one initiator. The graph is ill-formed.
    #[error("Phase '{0}' has multiple initiators")]
    MultipleInitiators(String),

    /// The depends-on relation between phases is cyclic.
    #[error("Phase dependency cycle involving '{0}'")]
    PhaseCycle(String),

    /// The push/pull relation inside a single phase is cyclic.
    #[error("Push/pull cycle inside phase '{0}'")]
    NodeCycle(String),

    #[error("Unknown node id {0}")]
    UnknownNode(u64),

    /// An operator failed while the phase was running.
    #[error("Operator '{name}' failed: {source}")]
    Operator {
        name: String,
        #[source]
        source: Box<OspreyError>,
    },
}

impl OspreyError {
    /// True if the error is end-of-stream; callers that probe instead of
    /// checking `can_read` use this to translate back to an option.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, OspreyError::Stream(StreamError::EndOfStream))
    }

    /// Wrap an operator failure with the operator's name for phase unwinding.
    pub fn in_operator(self, name: impl Into<String>) -> Self {
        OspreyError::Pipeline(PipelineError::Operator {
            name: name.into(),
            source: Box::new(self),
        })
    }
}

/// Map an `io::Error` from an `open` call to the typed taxonomy, keeping the
/// offending path.
pub fn open_error(err: std::io::Error, path: &std::path::Path) -> StreamError {
    match err.kind() {
        std::io::ErrorKind::NotFound => StreamError::NotFound(path.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => StreamError::PermissionDenied(path.to_path_buf()),
        _ => StreamError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_not_found() {
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        let e = open_error(io, std::path::Path::new("/no/such/stream"));
        assert!(matches!(e, StreamError::NotFound(_)));
    }

    #[test]
    fn test_open_error_permission() {
        let io = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let e = open_error(io, std::path::Path::new("/root/stream"));
        assert!(matches!(e, StreamError::PermissionDenied(_)));
    }

    #[test]
    fn test_open_error_other_is_io() {
        let io = std::io::Error::from(std::io::ErrorKind::Interrupted);
        let e = open_error(io, std::path::Path::new("x"));
        assert!(matches!(e, StreamError::Io(_)));
    }

    #[test]
    fn test_end_of_stream_predicate() {
        let e: OspreyError = StreamError::EndOfStream.into();
        assert!(e.is_end_of_stream());
        let e: OspreyError = StreamError::Format("junk".into()).into();
        assert!(!e.is_end_of_stream());
    }

    #[test]
    fn test_in_operator_wraps() {
        let e: OspreyError = StreamError::EndOfStream.into();
        let wrapped = e.in_operator("writer");
        match wrapped {
            OspreyError::Pipeline(PipelineError::Operator { name, source }) => {
                assert_eq!(name, "writer");
                assert!(source.is_end_of_stream());
            }
            other => panic!("expected Operator error, got {other}"),
        }
    }

    #[test]
    fn test_version_message() {
        let e = StreamError::Version {
            found: 2,
            expected: 1,
        };
        assert_eq!(
            e.to_string(),
            "Stream version mismatch: found 2, expected 1"
        );
    }
}
