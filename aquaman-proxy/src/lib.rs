pub mod daemon;
pub mod oauth;
pub mod pipeline;

pub use daemon::ProxyDaemon;
pub use oauth::OAuthTokenCache;
pub use pipeline::{AuditSink, CLIENT_TOKEN_HEADER, ProxyContext, build_router};
