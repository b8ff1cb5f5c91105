//! Convenience readers and writers built on the plain request/response
//! operations.

use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;

const CHUNK: usize = 16 * 1024;

/// Read the whole body, then wait for the transfer to complete so engine
/// errors are not mistaken for a short body.
pub async fn read_to_end(response: &Response) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let chunk = response.read_chunk(CHUNK).await?;
        if chunk.is_empty() {
            break;
        }
        body.extend_from_slice(&chunk);
    }
    response.wait_completion().await?;
    Ok(body)
}

pub async fn read_to_string(response: &Response) -> Result<String> {
    let body = read_to_end(response).await?;
    String::from_utf8(body).map_err(|e| Error::Body(e.to_string()))
}

/// Drain and discard the body. Returns the number of bytes discarded.
pub async fn ignore_all(response: &Response) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let chunk = response.read_chunk(CHUNK).await?;
        if chunk.is_empty() {
            break;
        }
        total += chunk.len() as u64;
    }
    response.wait_completion().await?;
    Ok(total)
}

/// Write all of `data` as request body. Does not end the body.
pub async fn write_all(request: &Request, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let n = request.write_some(data).await?;
        if n == 0 {
            // the transfer ended before taking the whole body
            return Err(Error::RequestNotActive);
        }
        data = &data[n..];
    }
    Ok(())
}

pub async fn read_json(response: &Response) -> Result<json::JsonValue> {
    let body = read_to_string(response).await?;
    json::parse(&body).map_err(|e| Error::Body(e.to_string()))
}

/// Write `value` as the complete request body and end it.
pub async fn write_json(request: &Request, value: &json::JsonValue) -> Result<()> {
    write_all(request, value.dump().as_bytes()).await?;
    request.shutdown().await
}

/// URL-encode `params` as an `application/x-www-form-urlencoded` body.
pub fn construct_form<'a>(params: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut easy = curl::easy::Easy::new();
    let mut form = String::new();
    for (key, value) in params {
        if !form.is_empty() {
            form.push('&');
        }
        form.push_str(&easy.url_encode(key.as_bytes()));
        form.push('=');
        form.push_str(&easy.url_encode(value.as_bytes()));
    }
    form
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construct_form_escapes() {
        let form = construct_form([("name", "a b"), ("q", "x&y=z")]);
        assert_eq!(form, "name=a%20b&q=x%26y%3Dz");
    }

    #[test]
    fn test_construct_form_empty() {
        assert_eq!(construct_form(Vec::<(&str, &str)>::new()), "");
    }
}
