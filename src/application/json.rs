//! JSON encoder installed on every application.

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::application::error::HttpError;

/// Serialises handler payloads; timestamps use RFC 3339 through their serde attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonEncoder {
    pretty: bool,
}

impl JsonEncoder {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    pub fn is_pretty(&self) -> bool {
        self.pretty
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, serde_json::Error> {
        if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        }
    }

    pub fn response<T: Serialize + ?Sized>(
        &self,
        status: StatusCode,
        value: &T,
    ) -> Result<Response, HttpError> {
        let body = self.encode(value).map_err(|err| {
            HttpError::from_error(
                "application::json::JsonEncoder::response",
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &err,
            )
        })?;
        let mut response = (status, body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(response)
    }
}
