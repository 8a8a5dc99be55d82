//! Backend access tokens.
//!
//! A token comes either from the environment (add-on installations get one
//! from the supervisor) or from the settings file written when the hub was
//! paired with the backend. Sources are asked again on every connect, so a
//! token rotated on disk is picked up by the next attempt.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Environment variable holding the supervisor token.
pub const SUPERVISOR_TOKEN_VAR: &str = "SUPERVISOR_TOKEN";

/// Longest client address in a settings file. Longer first fields mean the
/// file holds nothing but a token.
const MAX_ADDR_LEN: usize = 16;

/// Errors reading a token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Environment variable not set.
    #[error("environment variable {0} not set")]
    MissingVar(String),

    /// Settings file unreadable.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Settings file malformed.
    #[error("malformed settings file: {0}")]
    Malformed(&'static str),
}

/// Something that hands out backend access tokens.
pub trait TokenSource: Send + Sync {
    /// Fetch the current token.
    fn token(&self) -> Result<String, TokenError>;
}

/// A fixed token.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn token(&self) -> Result<String, TokenError> {
        Ok(self.0.clone())
    }
}

/// Token read from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    /// Read from `var`.
    pub fn new(var: impl Into<String>) -> Self {
        EnvToken { var: var.into() }
    }

    /// Read from `SUPERVISOR_TOKEN`.
    pub fn supervisor() -> Self {
        Self::new(SUPERVISOR_TOKEN_VAR)
    }
}

impl TokenSource for EnvToken {
    fn token(&self) -> Result<String, TokenError> {
        std::env::var(&self.var).map_err(|_| TokenError::MissingVar(self.var.clone()))
    }
}

/// Contents of the pairing settings file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Address of the paired client, if recorded.
    pub client_addr: Option<String>,
    /// Address of the backend, if recorded.
    pub backend_addr: Option<String>,
    /// Access token.
    pub token: String,
}

impl Settings {
    /// Parse a settings file.
    ///
    /// The layout is three length-prefixed fields: client address, backend
    /// address, token. A first length byte beyond any address length means
    /// the whole file is a bare token. With `mac` given, the token is
    /// unscrambled with the hub's MAC address.
    pub fn parse(bytes: &[u8], mac: Option<[u8; 6]>) -> Result<Self, TokenError> {
        let first = *bytes.first().ok_or(TokenError::Malformed("empty file"))? as usize;
        if first > MAX_ADDR_LEN {
            let token: String = latin1(bytes).chars().filter(|&c| c != '\n').collect();
            return Ok(Settings {
                client_addr: None,
                backend_addr: None,
                token,
            });
        }

        let mut rest = bytes;
        let client = take_field(&mut rest).ok_or(TokenError::Malformed("client address"))?;
        let backend = take_field(&mut rest).ok_or(TokenError::Malformed("backend address"))?;
        let token = take_field(&mut rest).ok_or(TokenError::Malformed("token"))?;

        let token = match mac {
            Some(mac) => unscramble(token, mac),
            None => token.to_vec(),
        };
        Ok(Settings {
            client_addr: non_empty(latin1(client)),
            backend_addr: non_empty(latin1(backend)),
            token: latin1(&token),
        })
    }
}

fn take_field<'a>(rest: &mut &'a [u8]) -> Option<&'a [u8]> {
    let (&len, tail) = rest.split_first()?;
    let len = len as usize;
    if tail.len() < len {
        return None;
    }
    let (field, tail) = tail.split_at(len);
    *rest = tail;
    Some(field)
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

/// Undo the MAC-based token scrambling.
///
/// For each MAC byte in order, the last token byte moves to index
/// `byte & 0x7f` when that index lies inside the token.
pub fn unscramble(token: &[u8], mac: [u8; 6]) -> Vec<u8> {
    let mut token = token.to_vec();
    for b in mac {
        let idx = (b & 0x7f) as usize;
        if idx < token.len() {
            if let Some(last) = token.pop() {
                token.insert(idx, last);
            }
        }
    }
    token
}

/// Parse a MAC address in `aa:bb:cc:dd:ee:ff` notation.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

/// Token read from the pairing settings file.
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
    mac: Option<[u8; 6]>,
}

impl SettingsFile {
    /// Read `path`, unscrambling with `mac` if given.
    pub fn new(path: impl Into<PathBuf>, mac: Option<[u8; 6]>) -> Self {
        SettingsFile {
            path: path.into(),
            mac,
        }
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the whole file.
    pub fn load(&self) -> Result<Settings, TokenError> {
        let bytes = std::fs::read(&self.path).map_err(|source| TokenError::Io {
            path: self.path.clone(),
            source,
        })?;
        Settings::parse(&bytes, self.mac)
    }
}

impl TokenSource for SettingsFile {
    fn token(&self) -> Result<String, TokenError> {
        Ok(self.load()?.token)
    }
}

/// Tries each source in order, returning the first token found.
pub struct FirstOf(pub Vec<Box<dyn TokenSource>>);

impl TokenSource for FirstOf {
    fn token(&self) -> Result<String, TokenError> {
        let mut last = TokenError::Malformed("no token source configured");
        for source in &self.0 {
            match source.token() {
                Ok(token) => return Ok(token),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}
