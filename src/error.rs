use snafu::Snafu;

use crate::message::MessageId;

/// The store primitive an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    CreateQueue,
    DropQueue,
    ListQueues,
    Enqueue,
    EnqueueBatch,
    Read,
    Pop,
    Delete,
    DeleteBatch,
    Archive,
    ArchiveBatch,
    Metrics,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Queue {queue} does not exist"))]
    QueueNotFound { queue: String },

    #[snafu(display("Queue {queue} already exists"))]
    QueueExists { queue: String },

    #[snafu(display("Failed to {operation} on queue {queue}"))]
    Store {
        operation: Operation,
        queue: String,
        source: sqlx::Error,
    },

    #[snafu(display("No message id returned for message sent to queue {queue}"))]
    MissingMessageId { queue: String },

    #[snafu(display("Failed to decode message {id} from queue {queue}"))]
    Decode {
        queue: String,
        id: MessageId,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to encode message for queue {queue}"))]
    Encode {
        queue: String,
        source: serde_json::Error,
    },

    #[snafu(display("Dispatcher is shut down"))]
    DispatcherClosed,

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl Error {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// True for errors raised before any store call was made.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidParameter { .. })
    }

    /// The queue the failing operation targeted, when there was one.
    pub fn queue(&self) -> Option<&str> {
        match self {
            Self::QueueNotFound { queue }
            | Self::QueueExists { queue }
            | Self::Store { queue, .. }
            | Self::MissingMessageId { queue }
            | Self::Decode { queue, .. }
            | Self::Encode { queue, .. } => Some(queue),
            _ => None,
        }
    }
}
