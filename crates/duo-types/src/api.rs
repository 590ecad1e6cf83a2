use serde::{Deserialize, Serialize};

use crate::events::UserSummary;

// -- Methods --

pub const AUTHENTICATE: &str = "authenticate";
pub const SEND_MESSAGE: &str = "sendMessage";

// -- Auth --

/// Data of the handshake request. Must be the first frame on a connection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateParams {
    pub auth_key: String,
}

#[derive(Debug, Serialize)]
pub struct AuthenticateResult {
    pub user: UserSummary,
}

// -- Messages --

#[derive(Debug, Deserialize)]
pub struct SendMessageParams {
    #[serde(alias = "username")]
    pub recipient: String,
    pub body: String,
}

// -- Error codes --

/// Numeric `code` carried by error responses.
pub mod error_code {
    pub const SELF_MESSAGE: i32 = 1;
    pub const RECIPIENT_NOT_FOUND: i32 = 5;
    pub const EMPTY_BODY: i32 = 7;
    pub const INVALID_PARAMS: i32 = -400;
    pub const METHOD_NOT_FOUND: i32 = -404;
    pub const INTERNAL: i32 = -500;
}
