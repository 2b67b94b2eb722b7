//! Hello gate
//!
//! A peer must present one of the shared secrets, connect from an address that
//! is not banned, and claim an id that is not reserved.

use std::collections::HashSet;

use crate::collector::events::Hello;
use crate::error::CollectorError;
use crate::registry::geo::normalize_ip;
use crate::types::PeerId;

#[derive(Debug, Clone, Default)]
pub struct Gate {
    secrets: HashSet<String>,
    banned_ips: HashSet<String>,
    reserved_ids: HashSet<String>,
}

impl Gate {
    /// An empty secret list disables the secret check
    pub fn new(
        secrets: impl IntoIterator<Item = String>,
        banned_ips: impl IntoIterator<Item = String>,
        reserved_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            secrets: secrets.into_iter().collect(),
            banned_ips: banned_ips.into_iter().collect(),
            reserved_ids: reserved_ids.into_iter().collect(),
        }
    }

    /// Admit a hello, returning the claimed peer id
    pub fn check(&self, hello: &Hello, ip: &str) -> Result<PeerId, CollectorError> {
        if !self.secrets.is_empty() {
            match hello.secret.as_deref() {
                None => return Err(CollectorError::Unauthorized("missing secret".into())),
                Some(secret) if !self.secrets.contains(secret) => {
                    return Err(CollectorError::Unauthorized("wrong secret".into()))
                }
                Some(_) => {}
            }
        }

        if self.banned_ips.contains(normalize_ip(ip)) {
            return Err(CollectorError::Unauthorized("banned address".into()));
        }

        let id = hello
            .id
            .clone()
            .ok_or_else(|| CollectorError::Unauthorized("missing id".into()))?;

        if self.reserved_ids.contains(&id) {
            return Err(CollectorError::Unauthorized(format!("reserved id {}", id)));
        }

        Ok(id)
    }
}
