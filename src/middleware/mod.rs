pub mod auth;
pub mod request_id;
pub mod response;
pub mod version;

pub use auth::{token_middleware, AuthToken, Caller, ClientAddr, MaybeToken};
pub use request_id::{request_id_middleware, RequestId};
pub use response::{list_or_no_content, ApiResponse};
pub use version::version_headers_middleware;
