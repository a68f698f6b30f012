use std::fmt;
use thiserror::Error;

/// A container image reference split at its tag and digest separators.
///
/// No normalization happens: `istio/proxyv2:1.0` and `docker.io/istio/proxyv2:1.0`
/// stay different repositories.
#[derive(Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("image reference is empty")]
    Empty,
    #[error("repository is missing in image reference {0}")]
    MissingRepository(String),
    #[error("invalid image format: {0}")]
    InvalidFormat(String),
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        let (name, digest) = match s.split_once('@') {
            Some((_, "")) => return Err(ParseError::InvalidFormat(s.to_string())),
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (s, None),
        };

        // A colon before the last slash belongs to a registry port, not a tag
        let last_slash = name.rfind('/');
        let (repository, tag) = match name.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                let tag = &name[pos + 1..];
                if tag.is_empty() {
                    return Err(ParseError::InvalidFormat(s.to_string()));
                }
                (&name[..pos], Some(tag.to_string()))
            }
            _ => (name, None),
        };

        if repository.is_empty() || repository.ends_with('/') {
            return Err(ParseError::MissingRepository(s.to_string()));
        }

        Ok(Self {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }
}
