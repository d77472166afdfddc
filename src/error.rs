use std::{fmt, io, sync::Arc};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` covers everything that can go wrong while reading or writing the
/// primary store and the catalogue page files. Invariant violations (an
/// order below the minimum, `minimum`/`maximum` on an empty tree) are
/// programmer errors and panic instead of surfacing here.
#[derive(Clone, Debug)]
pub enum Error {
	Io(Arc<io::Error>),
	Serialization(String),
	Deserialization(String),
	CorruptedPageFile(usize),
	UnknownNode(String),
	InvalidArgument(String),
	Corruption(String),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Io(err) => write!(f, "IO error: {err}"),
			Error::Serialization(msg) => write!(f, "Serialization error: {msg}"),
			Error::Deserialization(msg) => write!(f, "Deserialization error: {msg}"),
			Error::CorruptedPageFile(page) => write!(f, "Corrupted page file {page}"),
			Error::UnknownNode(id) => write!(f, "Unknown node identifier {id}"),
			Error::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
			Error::Corruption(msg) => write!(f, "Data corruption detected: {msg}"),
		}
	}
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(Arc::new(e))
	}
}
