use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventsError {
    #[error("empty connection string")]
    EmptyConnectionString,
    #[error("implementation not recognized: {0}")]
    UnknownScheme(String),
    #[error("queue already started")]
    AlreadyStarted,
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
