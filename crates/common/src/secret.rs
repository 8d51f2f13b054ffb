//! Secret wrapper for credential tokens

use std::fmt;
use std::path::Path;

use zeroize::Zeroize;

use crate::{Error, Result};

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Resolve a token for credential `name`.
    ///
    /// Resolution order:
    /// 1. `env_var`, when set and non-empty
    /// 2. contents of `file`, trimmed
    ///
    /// Fails when neither source yields a value.
    pub fn resolve(name: &str, env_var: Option<&str>, file: Option<&Path>) -> Result<Self> {
        if let Some(var) = env_var {
            if let Ok(value) = std::env::var(var) {
                let value = value.trim().to_owned();
                if !value.is_empty() {
                    return Ok(Self::new(value));
                }
            }
        }

        if let Some(path) = file {
            let contents = std::fs::read_to_string(path).map_err(|e| Error::Secret {
                name: name.to_owned(),
                reason: format!("failed to read {}: {e}", path.display()),
            })?;
            let value = contents.trim().to_owned();
            if !value.is_empty() {
                return Ok(Self::new(value));
            }
            return Err(Error::Secret {
                name: name.to_owned(),
                reason: format!("{} is empty", path.display()),
            });
        }

        let reason = match env_var {
            Some(var) => format!("{var} is not set"),
            None => "no token_env or token_file configured".to_owned(),
        };
        Err(Error::Secret {
            name: name.to_owned(),
            reason,
        })
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
