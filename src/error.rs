//! Error type shared by the library and the `photoba` binary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing input files, unknown file extensions, invalid option values.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Inconsistent input data, e.g. an observation referencing a camera that does not exist.
    #[error("data error: {0}")]
    Data(String),

    /// The optimizer hit a singular or degenerate system.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("image error: {0}")]
    Image(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Configuration(e.to_string())
    }
}

/// Convert the extension of `path` into a lowercase string, failing with a configuration error if
/// there is none.
pub(crate) fn extension_of(path: &std::path::Path) -> Result<String> {
    path.extension()
        .and_then(|x| x.to_str())
        .map(|x| x.to_lowercase())
        .ok_or_else(|| {
            Error::Configuration(format!("{} has no file extension", path.display()))
        })
}

#[test]
fn test_error_display() {
    let e = Error::Configuration("camera position sigma must be positive".to_string());
    assert_eq!(
        e.to_string(),
        "configuration error: camera position sigma must be positive"
    );
}

#[test]
fn test_extension_of() {
    use std::path::Path;
    assert_eq!(extension_of(Path::new("a/b.CNET")).unwrap(), "cnet");
    assert!(extension_of(Path::new("a/b")).is_err());
}
