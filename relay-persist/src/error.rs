#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("i/o error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("both the primary file and its .old backup were empty or unparseable at {path}")]
    NoUsableBackup { path: std::path::PathBuf },
    #[error("path segment is not a map")]
    NotAMap,
    #[error("path segment is not a list")]
    NotAList,
    #[error("list index {0} out of bounds")]
    IndexOutOfBounds(usize),
}
