//! Transfer metadata read through `curl_easy_getinfo`.

use std::ffi::CStr;
use std::ptr;

use libc::{c_char, c_double, c_long};

use crate::socket::cvt;

/// Metadata that can be queried from a running or finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Info {
    /// Last received HTTP status code, 0 if none yet.
    ResponseCode,
    /// Announced body length, -1 when unknown.
    ContentLength,
    ContentType,
    /// URL of the last hop.
    EffectiveUrl,
    /// Seconds from start to finish.
    TotalTime,
    RedirectCount,
    PrimaryIp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InfoValue {
    Long(i64),
    Double(f64),
    Text(Option<String>),
}

impl InfoValue {
    pub fn as_long(&self) -> Option<i64> {
        match self {
            InfoValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            InfoValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            InfoValue::Text(v) => v,
            _ => None,
        }
    }
}

const CURLINFO_OFF_T: curl_sys::CURLINFO = 0x600000;
const CURLINFO_CONTENT_LENGTH_DOWNLOAD_T: curl_sys::CURLINFO = CURLINFO_OFF_T + 15;

/// Query `info` from a raw easy handle.
///
/// # Safety
///
/// `raw` must be a live easy handle, only touched from the session driver.
pub(crate) unsafe fn query(raw: *mut curl_sys::CURL, info: Info) -> Result<InfoValue, curl::Error> {
    match info {
        Info::ResponseCode => long(raw, curl_sys::CURLINFO_RESPONSE_CODE),
        Info::RedirectCount => long(raw, curl_sys::CURLINFO_REDIRECT_COUNT),
        Info::ContentLength => offset(raw, CURLINFO_CONTENT_LENGTH_DOWNLOAD_T),
        Info::TotalTime => double(raw, curl_sys::CURLINFO_TOTAL_TIME),
        Info::ContentType => text(raw, curl_sys::CURLINFO_CONTENT_TYPE),
        Info::EffectiveUrl => text(raw, curl_sys::CURLINFO_EFFECTIVE_URL),
        Info::PrimaryIp => text(raw, curl_sys::CURLINFO_PRIMARY_IP),
    }
}

unsafe fn long(raw: *mut curl_sys::CURL, info: curl_sys::CURLINFO) -> Result<InfoValue, curl::Error> {
    let mut value: c_long = 0;
    cvt(curl_sys::curl_easy_getinfo(raw, info, &mut value))?;
    Ok(InfoValue::Long(value as i64))
}

unsafe fn offset(raw: *mut curl_sys::CURL, info: curl_sys::CURLINFO) -> Result<InfoValue, curl::Error> {
    let mut value: curl_sys::curl_off_t = 0;
    cvt(curl_sys::curl_easy_getinfo(raw, info, &mut value))?;
    Ok(InfoValue::Long(value))
}

unsafe fn double(raw: *mut curl_sys::CURL, info: curl_sys::CURLINFO) -> Result<InfoValue, curl::Error> {
    let mut value: c_double = 0.0;
    cvt(curl_sys::curl_easy_getinfo(raw, info, &mut value))?;
    Ok(InfoValue::Double(value))
}

unsafe fn text(raw: *mut curl_sys::CURL, info: curl_sys::CURLINFO) -> Result<InfoValue, curl::Error> {
    let mut value: *const c_char = ptr::null();
    cvt(curl_sys::curl_easy_getinfo(raw, info, &mut value))?;
    if value.is_null() {
        return Ok(InfoValue::Text(None));
    }
    let text = CStr::from_ptr(value).to_string_lossy().into_owned();
    Ok(InfoValue::Text(Some(text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_handle_defaults() {
        let easy = curl::easy::Easy::new();
        let code = unsafe { query(easy.raw(), Info::ResponseCode) }.unwrap();
        assert_eq!(code, InfoValue::Long(0));
        // unknown until a response says otherwise
        let length = unsafe { query(easy.raw(), Info::ContentLength) }.unwrap();
        assert_eq!(length, InfoValue::Long(-1));
        let kind = unsafe { query(easy.raw(), Info::ContentType) }.unwrap();
        assert_eq!(kind.into_text(), None);
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(InfoValue::Long(3).as_long(), Some(3));
        assert_eq!(InfoValue::Long(3).as_double(), None);
        assert_eq!(InfoValue::Double(1.5).as_double(), Some(1.5));
        assert_eq!(InfoValue::Text(Some("a".into())).into_text().as_deref(), Some("a"));
    }
}
