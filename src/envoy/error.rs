use rocket::http::{ContentType, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use std::io::Cursor;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Request(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("envoy responded {0}")]
    Status(http::StatusCode),
    /// Response body and the decoder's complaint about it.
    #[error("invalid response ({1}): {0}")]
    InvalidResponse(String, String),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("unable to encode metrics")]
    FormatError,
    #[error("internal error: {0}")]
    InternalError(String),
}

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        log::error!("{}", self);
        let (status, title) = match self {
            Error::Timeout(_) => (Status::GatewayTimeout, "504 Gateway Timeout"),
            Error::Request(_) | Error::Status(_) => (Status::BadGateway, "502 Bad Gateway"),
            _ => (Status::InternalServerError, "500 Internal Server Error"),
        };
        let error = format!(
            "<html><body><h3>{}</h3><code>{}</code></body></html>",
            title,
            crate::routes::escape_html(&self.to_string())
        );
        Response::build()
            .status(status)
            .sized_body(error.len(), Cursor::new(error))
            .header(ContentType::HTML)
            .ok()
    }
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn status_error_names_the_code() {
        let error = Error::Status(http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!("envoy responded 500 Internal Server Error", error.to_string());
    }

    #[test]
    fn invalid_response_carries_decoder_message() {
        let error = Error::InvalidResponse("<html>".into(), "expected value".into());
        assert_eq!("invalid response (expected value): <html>", error.to_string());
    }
}
