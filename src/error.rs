use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BigFileError {
    #[error("no such block or file: {name}")]
    #[diagnostic(help("run `bigfile ls <path>` to see which blocks exist"))]
    NotFound { name: String },

    #[error("block '{name}' already exists with a different layout")]
    #[diagnostic(help("a block's dtype, size and file count are fixed at creation"))]
    Exists { name: String },

    #[error("file handle is closed")]
    Closed,

    #[error("block handle is closed")]
    BlockClosed,

    #[error("dtype error: {message}")]
    Dtype { message: String },

    #[error("out of bounds: {message}")]
    Bounds { message: String },

    #[error("malformed {path}: {message}")]
    Format { path: String, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("collective operation failed: {message}")]
    #[diagnostic(help("a peer rank reported failure; check its log"))]
    Collective { message: String },
}
