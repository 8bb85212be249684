//! Error responses of the autoupdate HTTP API.
//!
//! Every error renders as `{"error":{"type":"<Kind>","msg":"<text>"}}`, both
//! as a 4xx/5xx response body and as the final object of an already running
//! stream.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;

use crate::autoupdate::{keyrequest::RequestError, SubscriptionError};

/// An error shown to the client.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    kind: &'static str,
    msg: String,
}

impl AppError {
    /// Creates an error with an explicit status and kind.
    pub fn new(status: StatusCode, kind: &'static str, msg: impl ToString) -> Self {
        Self {
            status,
            kind,
            msg: msg.to_string(),
        }
    }

    /// A request without a usable user.
    pub fn unauthorized(msg: impl ToString) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "AuthError", msg)
    }

    /// Encodes the `{"error":…}` object, newline terminated so it can close
    /// a payload stream.
    pub fn to_body(&self) -> Bytes {
        #[derive(Serialize)]
        struct Body<'a> {
            error: Error<'a>,
        }
        #[derive(Serialize)]
        struct Error<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
            msg: &'a str,
        }
        let body = Body {
            error: Error {
                kind: self.kind,
                msg: &self.msg,
            },
        };
        let mut out = serde_json::to_vec(&body).expect("json objects serialize");
        out.push(b'\n');
        Bytes::from(out)
    }
}

impl From<RequestError> for AppError {
    fn from(err: RequestError) -> Self {
        let status = match err {
            RequestError::Fetch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.kind(), err)
    }
}

impl From<SubscriptionError> for AppError {
    fn from(err: SubscriptionError) -> Self {
        match err {
            SubscriptionError::Request(err) => err.into(),
            err @ SubscriptionError::Fetch(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "FetchError", err)
            }
            err @ SubscriptionError::Restrict(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", err)
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "InternalError", err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            self.to_body(),
        )
            .into_response()
    }
}
