//! Error types

use crate::StreamState;
use notify_fsevents_types::StreamFlags;
use std::error::Error as StdError;
use std::path::PathBuf;
use std::result::Result as StdResult;
use std::{fmt, io};

/// Type alias to use this library's [`Error`] type in a Result
pub type Result<T> = StdResult<T, Error>;

/// Error kinds
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error
    ///
    /// May be used in cases where a platform specific error is mapped to this type, or for opaque
    /// internal errors.
    Generic(String),

    /// I/O errors.
    Io(io::Error),

    /// A stream was requested without any directory to watch.
    NoDirectories,

    /// A path cannot be represented in the form the native service expects.
    InvalidPath,

    /// The native service does not support these stream flags on this host.
    UnsupportedFlags(StreamFlags),

    /// The native service declined to start the stream, or it was not scheduled.
    ///
    /// The stream keeps its previous state.
    CouldNotStartStream,

    /// The native service rejected the exclusion directories.
    ///
    /// At most eight directories may be excluded, and only from a stream that was not
    /// invalidated.
    CouldNotExcludeDirectories,

    /// The operation is not allowed in the stream's current state.
    InvalidState(StreamState),
}

/// Notify-fsevents error type.
///
/// Errors are emitted either at creation time of an [`EventStream`](crate::EventStream) or by
/// its lifecycle operations. The handler never receives errors.
#[derive(Debug)]
pub struct Error {
    /// Kind of the error.
    pub kind: ErrorKind,

    /// Relevant paths to the error, if any.
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Adds a path to the error.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Replaces the paths for the error.
    pub fn set_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }

    /// Creates a new Error with empty paths given its kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a new generic Error from a message.
    pub fn generic(msg: &str) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates a new i/o Error from a stdlib `io::Error`.
    pub fn io(err: io::Error) -> Self {
        Self::new(ErrorKind::Io(err))
    }

    /// Creates a new "no directories" error.
    pub fn no_directories() -> Self {
        Self::new(ErrorKind::NoDirectories)
    }

    /// Creates a new "invalid path" error.
    pub fn invalid_path() -> Self {
        Self::new(ErrorKind::InvalidPath)
    }

    /// Creates a new "unsupported flags" error.
    pub fn unsupported_flags(flags: StreamFlags) -> Self {
        Self::new(ErrorKind::UnsupportedFlags(flags))
    }

    /// Creates a new "could not start stream" error.
    pub fn could_not_start_stream() -> Self {
        Self::new(ErrorKind::CouldNotStartStream)
    }

    /// Creates a new "could not exclude directories" error.
    pub fn could_not_exclude_directories() -> Self {
        Self::new(ErrorKind::CouldNotExcludeDirectories)
    }

    /// Creates a new "invalid state" error.
    pub fn invalid_state(state: StreamState) -> Self {
        Self::new(ErrorKind::InvalidState(state))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let error = match self.kind {
            ErrorKind::Generic(ref err) => err.clone(),
            ErrorKind::Io(ref err) => err.to_string(),
            ErrorKind::NoDirectories => "No directories to watch".into(),
            ErrorKind::InvalidPath => "Path cannot be passed to the native service".into(),
            ErrorKind::UnsupportedFlags(flags) => format!("Unsupported stream flags {flags}"),
            ErrorKind::CouldNotStartStream => "Could not start event stream".into(),
            ErrorKind::CouldNotExcludeDirectories => "Could not exclude directories".into(),
            ErrorKind::InvalidState(state) => {
                format!("Operation not allowed while the stream is {state}")
            }
        };

        if self.paths.is_empty() {
            write!(f, "{error}")
        } else {
            write!(f, "{} about {:?}", error, self.paths)
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self.kind {
            ErrorKind::Io(ref cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}

#[test]
fn display_formatted_errors() {
    let expected = "Could not start event stream";
    assert_eq!(expected, format!("{}", Error::could_not_start_stream()));

    let expected = "Unsupported stream flags [fileEvents, markSelf]";
    assert_eq!(
        expected,
        format!(
            "{}",
            Error::unsupported_flags(StreamFlags::FILE_EVENTS | StreamFlags::MARK_SELF)
        )
    );

    let expected = "Operation not allowed while the stream is created";
    assert_eq!(
        expected,
        format!("{}", Error::invalid_state(StreamState::Created))
    );

    let err = Error::could_not_exclude_directories().add_path(PathBuf::from("/a"));
    assert_eq!(
        r#"Could not exclude directories about ["/a"]"#,
        format!("{err}")
    );
}
