//! Account identities as stored in commits, footers and notes.
//!
//! An account is written as `Account <id> <<id>@<server-id>>`. Only the
//! email-like part is significant: the id is recovered from it and the host
//! must equal the configured server id, so identities survive a round trip
//! without any account directory lookup. The display name is cosmetic.

use chrono::{DateTime, Utc};

use crate::config::IdentityConfig;
use crate::model::AccountId;
use crate::repo::PersonIdent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCodec {
    server_id: String,
    server_name: String,
    server_email: String,
}

impl IdentityCodec {
    #[must_use]
    pub fn new(config: &IdentityConfig) -> Self {
        Self {
            server_id: config.server_id.clone(),
            server_name: config.server_name.clone(),
            server_email: config.server_email.clone(),
        }
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// `<id>@<server-id>`
    #[must_use]
    pub fn email_for(&self, account: AccountId) -> String {
        format!("{account}@{}", self.server_id)
    }

    /// Commit ident for an account.
    #[must_use]
    pub fn account_ident(&self, account: AccountId, when: DateTime<Utc>) -> PersonIdent {
        PersonIdent::new(format!("Account {account}"), self.email_for(account), when)
    }

    /// Committer ident, also used as author for server-made commits.
    #[must_use]
    pub fn server_ident(&self, when: DateTime<Utc>) -> PersonIdent {
        PersonIdent::new(&self.server_name, &self.server_email, when)
    }

    /// Whether a commit ident is the server's own.
    #[must_use]
    pub fn is_server(&self, ident: &PersonIdent) -> bool {
        ident.name == self.server_name && ident.email == self.server_email
    }

    /// Recover the account from `<id>@<server-id>`.
    #[must_use]
    pub fn parse_email(&self, email: &str) -> Option<AccountId> {
        let (id, host) = email.split_once('@')?;
        if host != self.server_id {
            return None;
        }
        id.parse().ok()
    }

    #[must_use]
    pub fn parse_ident(&self, ident: &PersonIdent) -> Option<AccountId> {
        self.parse_email(&ident.email)
    }

    /// Footer form `Account <id> <<id>@<server-id>>`.
    #[must_use]
    pub fn format_footer(&self, account: AccountId) -> String {
        format!("Account {account} <{}>", self.email_for(account))
    }

    /// Parse the footer form; the name part may be anything.
    #[must_use]
    pub fn parse_footer(&self, value: &str) -> Option<AccountId> {
        let value = value.trim();
        let open = value.rfind('<')?;
        let email = value[open + 1..].strip_suffix('>')?;
        self.parse_email(email)
    }
}
