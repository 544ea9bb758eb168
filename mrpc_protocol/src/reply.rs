use crate::{Error, Result};

/// Outcome of a handler that may produce data and fail at the same time.
///
/// On the server both halves travel back: `value` as the response body and
/// `error` as the response error. A client never sees a partial value.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    pub value: Option<T>,
    pub error: Option<Error>,
}

impl<T> Reply<T> {
    pub fn ok(value: T) -> Reply<T> {
        Reply {
            value: Some(value),
            error: None,
        }
    }

    pub fn err(error: Error) -> Reply<T> {
        Reply {
            value: None,
            error: Some(error),
        }
    }

    pub fn partial(value: T, error: Error) -> Reply<T> {
        Reply {
            value: Some(value),
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Drops a value that came with an error.
    pub fn into_result(self) -> Result<T>
    where
        T: Default,
    {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.value.unwrap_or_default()),
        }
    }
}

impl<T> From<Result<T>> for Reply<T> {
    fn from(res: Result<T>) -> Self {
        match res {
            Ok(value) => Reply::ok(value),
            Err(err) => Reply::err(err),
        }
    }
}
