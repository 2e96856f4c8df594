//! HTTP method as a typed enum.
//!
//! Covers the RFC 9110 methods. Anything else is rejected at the server level
//! with `405 Method Not Allowed` before it reaches the pipeline.

use std::fmt;
use std::str::FromStr;

/// A known HTTP method.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum Method {
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Trace,
}

impl Method {
    /// Returns the uppercase wire representation (e.g. `"GET"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Delete  => "DELETE",
            Self::Get     => "GET",
            Self::Head    => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch   => "PATCH",
            Self::Post    => "POST",
            Self::Put     => "PUT",
            Self::Trace   => "TRACE",
        }
    }

    /// Read-only methods: CSRF checks skip these.
    pub fn is_safe(self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options)
    }

    /// Methods that run inside a database transaction when a database is
    /// attached: everything except `GET` and `HEAD`.
    pub fn is_transactional(self) -> bool {
        !matches!(self, Self::Get | Self::Head)
    }

    pub(crate) fn from_http(method: &http::Method) -> Option<Self> {
        method.as_str().parse().ok()
    }
}

/// Parses an uppercase method string (e.g. `"GET"`). Case-sensitive per RFC 9110 §9.1.
impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Self::Connect),
            "DELETE"  => Ok(Self::Delete),
            "GET"     => Ok(Self::Get),
            "HEAD"    => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "PATCH"   => Ok(Self::Patch),
            "POST"    => Ok(Self::Post),
            "PUT"     => Ok(Self::Put),
            "TRACE"   => Ok(Self::Trace),
            _         => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsing_is_case_sensitive() {
        assert_eq!("GET".parse::<Method>(), Ok(Method::Get));
        assert!("get".parse::<Method>().is_err());
    }

    #[test]
    fn classification() {
        assert!(Method::Options.is_safe());
        assert!(!Method::Post.is_safe());
        assert!(!Method::Head.is_transactional());
        assert!(Method::Delete.is_transactional());
        assert!(Method::Options.is_transactional());
    }

    #[test]
    fn from_http_rejects_extension_methods() {
        assert_eq!(Method::from_http(&http::Method::PATCH), Some(Method::Patch));
        let purge = http::Method::from_bytes(b"PURGE").unwrap();
        assert_eq!(Method::from_http(&purge), None);
    }
}
