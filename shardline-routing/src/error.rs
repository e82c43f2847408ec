use std::fmt::Debug;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
/// The reason a sub-request of a scatter-gather call produced no result.
pub enum CallError<E: Debug> {
    #[error("The service returned an error: {0:?}")]
    Service(E),

    #[error("The call did not complete within {0:?}")]
    Timeout(Duration),

    #[error("The call was aborted before it could be dispatched.")]
    Aborted,
}
