//! Change-tracked cookie jar.
//!
//! Parsed from the request's `Cookie` header on first access. Only cookies
//! that were set or removed during the request are serialised back as
//! `Set-Cookie` headers.

use std::collections::{BTreeMap, BTreeSet};

/// `SameSite` attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax    => "Lax",
            Self::None   => "None",
        }
    }
}

/// A cookie value plus its attributes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cookie {
    pub value: String,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<SameSite>,
    pub max_age: Option<u64>,
    pub path: Option<String>,
    pub domain: Option<String>,
}

impl Cookie {
    /// A cookie with the secure defaults: `HttpOnly`, `SameSite=Strict`, and
    /// `Secure` unless `secure` is false (local development).
    pub fn new(value: impl Into<String>, secure: bool) -> Self {
        Self {
            value: value.into(),
            http_only: true,
            secure,
            same_site: Some(SameSite::Strict),
            max_age: None,
            path: Some("/".to_owned()),
            domain: None,
        }
    }

    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Renders a `Set-Cookie` header value.
    pub fn serialize(&self, name: &str) -> String {
        let mut out = format!("{name}={}", self.value);
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={max_age}"));
        }
        if let Some(domain) = &self.domain {
            out.push_str(&format!("; Domain={domain}"));
        }
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path={path}"));
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if let Some(same_site) = self.same_site {
            out.push_str(&format!("; SameSite={}", same_site.as_str()));
        }
        out
    }
}

/// Request cookies, with a record of what changed.
#[derive(Clone, Debug, Default)]
pub struct CookieJar {
    cookies: BTreeMap<String, Cookie>,
    changed: BTreeSet<String>,
    secure: bool,
}

impl CookieJar {
    /// Parses a `Cookie` header. Malformed pairs are skipped; the first
    /// occurrence of a name wins.
    pub fn parse(header: &str, secure: bool) -> Self {
        let mut cookies = BTreeMap::new();
        for pair in header.split(';') {
            let Some((name, value)) = pair.split_once('=') else { continue };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            cookies
                .entry(name.to_owned())
                .or_insert_with(|| Cookie::new(value, secure));
        }
        Self { cookies, changed: BTreeSet::new(), secure }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(|c| c.value.as_str())
    }

    /// Sets a cookie with the jar's secure defaults.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let cookie = Cookie::new(value, self.secure);
        self.set_cookie(name, cookie);
    }

    pub fn set_cookie(&mut self, name: &str, cookie: Cookie) {
        self.changed.insert(name.to_owned());
        self.cookies.insert(name.to_owned(), cookie);
    }

    pub fn remove(&mut self, name: &str) {
        self.changed.insert(name.to_owned());
        self.cookies.remove(name);
    }

    pub fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }

    /// `Set-Cookie` values for every changed cookie. Removed cookies are
    /// expired in place.
    pub fn collect(&self) -> Vec<String> {
        self.changed
            .iter()
            .map(|name| match self.cookies.get(name) {
                Some(cookie) => cookie.serialize(name),
                None => format!(
                    "{name}=null; Max-Age=0; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly"
                ),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pairs_and_strips_quotes() {
        let jar = CookieJar::parse(r#"sid=abc; theme="dark"; junk; =x"#, false);
        assert_eq!(jar.get("sid"), Some("abc"));
        assert_eq!(jar.get("theme"), Some("dark"));
        assert_eq!(jar.get("junk"), None);
        assert!(!jar.is_changed());
        assert!(jar.collect().is_empty());
    }

    #[test]
    fn only_changed_cookies_are_collected() {
        let mut jar = CookieJar::parse("a=1; b=2", true);
        jar.set("a", "3");
        jar.remove("b");
        let collected = jar.collect();
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0], "a=3; Path=/; HttpOnly; Secure; SameSite=Strict");
        assert!(collected[1].starts_with("b=null; Max-Age=0"));
    }

    #[test]
    fn secure_flag_follows_the_jar() {
        let mut jar = CookieJar::default();
        jar.set("x", "y");
        assert_eq!(jar.collect(), vec!["x=y; Path=/; HttpOnly; SameSite=Strict".to_owned()]);
    }
}
