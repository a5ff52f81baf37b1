#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no schema registered for message type {0:?}")]
    NoSchema(String),

    #[error("message is missing required key \"type\"")]
    MissingType,

    #[error("schema coercion failed for {type_}: {reason}")]
    Coercion { type_: String, reason: String },

    #[error(transparent)]
    Persist(#[from] relay_persist::PersistError),
}
