//! Recovery link parameters.
//!
//! Recovery emails have shipped several link formats over time:
//! ```text
//! /reset-password#access_token=..&refresh_token=..&type=recovery   (implicit grant)
//! /reset-password?code=..                                         (PKCE)
//! /reset-password?token_hash=..&type=recovery                      (OTP hash)
//! /reset-password?token=..&email=..&type=recovery                  (legacy OTP)
//! ```
//! Values may sit in the fragment or the query string; the fragment wins.

use std::collections::HashMap;
use url::{form_urlencoded, Url};

/// Parameters recognized on a recovery link. All optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryUrlParams {
    /// The `type` parameter; `"recovery"` for password resets.
    pub link_type: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub code: Option<String>,
    pub token_hash: Option<String>,
    pub legacy_token: Option<String>,
    pub email: Option<String>,
}

/// How to turn the link into a session, chosen by priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EstablishStrategy {
    Tokens {
        access_token: String,
        refresh_token: String,
    },
    CodeExchange {
        code: String,
    },
    TokenHash {
        token_hash: String,
    },
    LegacyToken {
        email: String,
        token: String,
    },
}

impl EstablishStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            EstablishStrategy::Tokens { .. } => "tokens",
            EstablishStrategy::CodeExchange { .. } => "code_exchange",
            EstablishStrategy::TokenHash { .. } => "token_hash",
            EstablishStrategy::LegacyToken { .. } => "legacy_token",
        }
    }
}

fn pairs(raw: &str) -> HashMap<String, String> {
    form_urlencoded::parse(raw.as_bytes())
        .into_owned()
        .filter(|(_, v)| !v.is_empty())
        .collect()
}

impl RecoveryUrlParams {
    pub fn from_url(url: &Url) -> Self {
        // hash routers put their own query after the fragment path: "#/reset?x=1"
        let fragment = url
            .fragment()
            .map(|f| f.split_once('?').map_or(f, |(_, query)| query))
            .map(pairs)
            .unwrap_or_default();
        let query = url.query().map(pairs).unwrap_or_default();

        let pick = |name: &str| fragment.get(name).or_else(|| query.get(name)).cloned();

        Self {
            link_type: pick("type"),
            access_token: pick("access_token"),
            refresh_token: pick("refresh_token"),
            code: pick("code"),
            token_hash: pick("token_hash"),
            legacy_token: pick("token"),
            email: pick("email"),
        }
    }

    pub fn is_recovery_type(&self) -> bool {
        self.link_type.as_deref() == Some("recovery")
    }

    pub fn looks_like_recovery(&self) -> bool {
        self.is_recovery_type()
            || self.code.is_some()
            || self.token_hash.is_some()
            || self.access_token.is_some()
            || self.refresh_token.is_some()
    }

    /// Highest-priority strategy the link supports.
    pub fn strategy(&self) -> Option<EstablishStrategy> {
        if let (Some(access_token), Some(refresh_token)) = (&self.access_token, &self.refresh_token) {
            return Some(EstablishStrategy::Tokens {
                access_token: access_token.clone(),
                refresh_token: refresh_token.clone(),
            });
        }
        if let Some(code) = &self.code {
            return Some(EstablishStrategy::CodeExchange { code: code.clone() });
        }
        if let Some(token_hash) = &self.token_hash {
            return Some(EstablishStrategy::TokenHash {
                token_hash: token_hash.clone(),
            });
        }
        if let (Some(token), Some(email)) = (&self.legacy_token, &self.email) {
            return Some(EstablishStrategy::LegacyToken {
                email: email.clone(),
                token: token.clone(),
            });
        }
        None
    }
}

/// The URL shown once a recovery session exists: canonical path, query kept, fragment cleared.
pub fn canonical_recovery_url(url: &Url, canonical_path: &str) -> Url {
    let mut canonical = url.clone();
    canonical.set_path(canonical_path);
    canonical.set_fragment(None);
    canonical
}
