//! `WWW-Authenticate: Bearer ...` challenge parsing.
//!
//! Example:
//! `Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull"`

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme, params) = header
            .split_once(char::is_whitespace)
            .unwrap_or((header, ""));
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(Error::InvalidChallenge(format!(
                "unsupported auth scheme '{scheme}'"
            )));
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (name, value) in split_params(params)? {
            match name.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        let realm = realm
            .filter(|r| !r.is_empty())
            .ok_or_else(|| Error::InvalidChallenge("missing realm".to_string()))?;
        Ok(Self {
            realm,
            service,
            scope,
        })
    }

    /// Repository named by the first `repository:<name>:<actions>` scope.
    pub fn repository(&self) -> Option<&str> {
        self.scope.as_deref()?.split(' ').find_map(|scope| {
            let rest = scope.strip_prefix("repository:")?;
            let (name, _actions) = rest.rsplit_once(':')?;
            Some(name)
        })
    }
}

/// Split `a="x",b=y` into pairs, honoring commas inside quoted values.
fn split_params(params: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = params.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut name = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            name.push(c);
        }
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(Error::InvalidChallenge(format!(
                "malformed parameter list '{params}'"
            )));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(Error::InvalidChallenge(format!(
                    "unterminated quoted value for '{name}'"
                )));
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        pairs.push((name, value));
    }
    Ok(pairs)
}
