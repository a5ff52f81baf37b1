#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Store(#[from] relay_message_store::StoreError),
    #[error(transparent)]
    ExchangeStore(#[from] relay_exchange_store::ExchangeStoreError),
    #[error(transparent)]
    Transport(#[from] relay_transport::TransportError),
    #[error(transparent)]
    Persist(#[from] relay_persist::PersistError),
    #[error("registration failed: {reason}")]
    RegistrationFailed { reason: String },
}
