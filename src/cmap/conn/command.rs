use bson::{Bson, Document};
use serde::Deserialize;

use crate::{
    error::{CommandError, Error, ErrorKind, Result},
    options::ServerAddress,
};

/// A command to be sent to the server. The body is an opaque document; this
/// layer only cares about routing and the retry marker.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,

    pub(crate) target_db: String,

    pub(crate) body: Document,

    /// Whether the command is a write attempt that the pipeline marked as
    /// eligible for a retry. Network failures of such commands get the
    /// retryable-write label attached client side.
    pub(crate) retryable_write: bool,
}

impl Command {
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            retryable_write: false,
        }
    }
}

/// A raw response body as received from a server.
#[derive(Clone, Debug)]
pub(crate) struct CommandResponse {
    source: ServerAddress,
    body: Document,
}

impl CommandResponse {
    pub(crate) fn new(source: ServerAddress, body: Document) -> Self {
        Self { source, body }
    }

    pub(crate) fn is_success(&self) -> bool {
        get_int(self.body.get("ok")) == Some(1)
    }

    /// Converts the response into the success body or the server error it
    /// describes, including any error labels the server attached.
    pub(crate) fn into_result(self) -> Result<Document> {
        if self.is_success() {
            return Ok(self.body);
        }
        let error_body: CommandErrorBody = bson::from_document(self.body).map_err(|_| {
            Error::invalid_response(format!(
                "server at {} returned a malformed error response",
                self.source
            ))
        })?;
        Err(error_body.into())
    }
}

/// A response body useful for deserializing command errors.
#[derive(Debug, Deserialize)]
pub(crate) struct CommandErrorBody {
    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,

    #[serde(flatten)]
    pub(crate) command_error: CommandError,
}

impl From<CommandErrorBody> for Error {
    fn from(body: CommandErrorBody) -> Error {
        Error::new(
            ErrorKind::Command(body.command_error),
            body.error_labels,
        )
    }
}

fn get_int(value: Option<&Bson>) -> Option<i64> {
    match value {
        Some(Bson::Int32(i)) => Some(i64::from(*i)),
        Some(Bson::Int64(i)) => Some(*i),
        Some(Bson::Double(d)) if (d - d.floor()).abs() < f64::EPSILON => Some(*d as i64),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    #[test]
    fn success_bodies_pass_through() {
        let response = CommandResponse::new(ServerAddress::default(), doc! { "ok": 1, "n": 4 });
        assert!(response.is_success());
        let body = response.into_result().unwrap();
        assert_eq!(body.get_i32("n").unwrap(), 4);
    }

    #[test]
    fn error_bodies_become_command_errors() {
        let response = CommandResponse::new(
            ServerAddress::default(),
            doc! {
                "ok": 0,
                "code": 10107,
                "codeName": "NotWritablePrimary",
                "errmsg": "not primary",
                "errorLabels": ["RetryableWriteError"],
            },
        );
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code(), Some(10107));
        assert!(err.is_write_retryable());
        assert!(err.is_server_error());
    }

    #[test]
    fn malformed_error_bodies_are_invalid_responses() {
        let response = CommandResponse::new(ServerAddress::default(), doc! { "ok": 0 });
        let err = response.into_result().unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::InvalidResponse { .. }
        ));
    }
}
