//! Async HTTP transfers on libcurl's multi interface.
//!
//! libcurl drives many transfers through one multi handle, calling back into
//! the application to open sockets, watch them, arm a timer and move body
//! bytes. This crate runs that machinery on a dedicated driver thread backed
//! by a tokio reactor and exposes each transfer as a [`Request`] (the body
//! sent) and a [`Response`] (headers, body received, outcome) with plain
//! `async fn`s.
//!
//! # Example
//!
//! ```no_run
//! use crucible_curl::{quick, Request, RequestOption, Session};
//!
//! # async fn example() -> Result<(), crucible_curl::Error> {
//! let session = Session::new()?;
//!
//! let mut request = Request::post("http://127.0.0.1:8080/echo")?;
//! request.set_option(RequestOption::PostFieldSize(5))?;
//! request.append_header("Content-Type: text/plain")?;
//! let response = session.start(&mut request).await?;
//!
//! quick::write_all(&request, b"hello").await?;
//! request.shutdown().await?;
//!
//! let headers = response.wait_last_headers().await?;
//! let body = quick::read_to_string(&response).await?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod command;
mod driver;
mod headers;
mod info;
mod option;
mod request;
mod response;
mod session;
mod socket;
mod transfer;

pub mod config;
pub mod error;
pub mod logging;
pub mod quick;

pub use config::{Config, SessionConfig};
pub use curl::easy::HttpVersion;
pub use error::{Error, ErrorKind, Result};
pub use headers::{FieldName, Headers};
pub use info::{Info, InfoValue};
pub use option::RequestOption;
pub use request::Request;
pub use response::Response;
pub use session::{Session, SessionStats};
pub use socket::SocketStats;
