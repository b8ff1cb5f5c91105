//! Typed easy handle options.

use std::path::PathBuf;
use std::time::Duration;

use curl::easy::{Easy2, Handler, HttpVersion};

/// An option applied to a request's easy handle.
///
/// Requests keep every option they were given so a duplicate can replay
/// them onto a fresh handle.
#[derive(Debug, Clone)]
pub enum RequestOption {
    Url(String),
    Get,
    Post,
    /// Upload with PUT semantics.
    Upload,
    /// Send the headers only, no body.
    NoBody(bool),
    CustomRequest(String),
    /// Announced request body size for `Post`.
    PostFieldSize(u64),
    /// Announced request body size for `Upload`.
    InFileSize(u64),
    /// Fixed request body, copied into the handle.
    PostFields(Vec<u8>),
    FollowLocation(bool),
    MaxRedirections(u32),
    UserAgent(String),
    Timeout(Duration),
    ConnectTimeout(Duration),
    /// Accepted content encodings, empty for everything libcurl supports.
    AcceptEncoding(String),
    CookieFile(PathBuf),
    CookieJar(PathBuf),
    Username(String),
    Password(String),
    SslVerifyPeer(bool),
    SslVerifyHost(bool),
    Verbose(bool),
    FailOnError(bool),
    HttpVersion(HttpVersion),
    TcpNoDelay(bool),
}

impl RequestOption {
    pub fn name(&self) -> &'static str {
        match self {
            RequestOption::Url(_) => "url",
            RequestOption::Get => "get",
            RequestOption::Post => "post",
            RequestOption::Upload => "upload",
            RequestOption::NoBody(_) => "nobody",
            RequestOption::CustomRequest(_) => "custom_request",
            RequestOption::PostFieldSize(_) => "post_field_size",
            RequestOption::InFileSize(_) => "in_filesize",
            RequestOption::PostFields(_) => "post_fields",
            RequestOption::FollowLocation(_) => "follow_location",
            RequestOption::MaxRedirections(_) => "max_redirections",
            RequestOption::UserAgent(_) => "useragent",
            RequestOption::Timeout(_) => "timeout",
            RequestOption::ConnectTimeout(_) => "connect_timeout",
            RequestOption::AcceptEncoding(_) => "accept_encoding",
            RequestOption::CookieFile(_) => "cookie_file",
            RequestOption::CookieJar(_) => "cookie_jar",
            RequestOption::Username(_) => "username",
            RequestOption::Password(_) => "password",
            RequestOption::SslVerifyPeer(_) => "ssl_verify_peer",
            RequestOption::SslVerifyHost(_) => "ssl_verify_host",
            RequestOption::Verbose(_) => "verbose",
            RequestOption::FailOnError(_) => "fail_on_error",
            RequestOption::HttpVersion(_) => "http_version",
            RequestOption::TcpNoDelay(_) => "tcp_nodelay",
        }
    }

    pub(crate) fn apply<H: Handler>(&self, easy: &mut Easy2<H>) -> Result<(), curl::Error> {
        match self {
            RequestOption::Url(url) => easy.url(url),
            RequestOption::Get => easy.get(true),
            RequestOption::Post => easy.post(true),
            RequestOption::Upload => easy.upload(true),
            RequestOption::NoBody(enable) => easy.nobody(*enable),
            RequestOption::CustomRequest(method) => easy.custom_request(method),
            RequestOption::PostFieldSize(size) => easy.post_field_size(*size),
            RequestOption::InFileSize(size) => easy.in_filesize(*size),
            RequestOption::PostFields(data) => easy.post_fields_copy(data),
            RequestOption::FollowLocation(enable) => easy.follow_location(*enable),
            RequestOption::MaxRedirections(max) => easy.max_redirections(*max),
            RequestOption::UserAgent(agent) => easy.useragent(agent),
            RequestOption::Timeout(timeout) => easy.timeout(*timeout),
            RequestOption::ConnectTimeout(timeout) => easy.connect_timeout(*timeout),
            RequestOption::AcceptEncoding(encoding) => easy.accept_encoding(encoding),
            RequestOption::CookieFile(path) => easy.cookie_file(path),
            RequestOption::CookieJar(path) => easy.cookie_jar(path),
            RequestOption::Username(user) => easy.username(user),
            RequestOption::Password(pass) => easy.password(pass),
            RequestOption::SslVerifyPeer(enable) => easy.ssl_verify_peer(*enable),
            RequestOption::SslVerifyHost(enable) => easy.ssl_verify_host(*enable),
            RequestOption::Verbose(enable) => easy.verbose(*enable),
            RequestOption::FailOnError(enable) => easy.fail_on_error(*enable),
            RequestOption::HttpVersion(version) => easy.http_version(*version),
            RequestOption::TcpNoDelay(enable) => easy.tcp_nodelay(*enable),
        }
    }
}
