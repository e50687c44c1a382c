//! Account and principal naming.

use std::fmt;

/// Organization-qualified account plus principal that assertions are minted for.
///
/// Both parts are normalised on construction so that the qualified name used in
/// the `sub`/`iss` claims matches what the platform expects:
/// - the account keeps only the segment before the first `.` (so a full
///   account host such as `myorg-acct.snowflakecomputing.com` is accepted),
///   with `-` replaced by `_`, upper-cased;
/// - the principal is upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    account: String,
    principal: String,
}

impl Identity {
    /// Creates a new identity from an account identifier (or account host) and a principal name.
    pub fn new(account: impl AsRef<str>, principal: impl AsRef<str>) -> Self {
        Self {
            account: normalize_account(account.as_ref()),
            principal: principal.as_ref().trim().to_uppercase(),
        }
    }

    /// Returns the normalised account identifier (e.g. `MYORG_ACCT`).
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Returns the normalised principal name.
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Returns `ACCOUNT.PRINCIPAL`, the `sub` claim of every assertion.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.account, self.principal)
    }

    /// Returns the account URL derived from the account identifier.
    ///
    /// The platform's hostnames use `-` where account identifiers use `_`.
    pub fn default_account_url(&self) -> String {
        format!(
            "https://{}.snowflakecomputing.com",
            self.account.replace('_', "-").to_lowercase()
        )
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.account, self.principal)
    }
}

fn normalize_account(account: &str) -> String {
    let trimmed = account.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let prefix = without_scheme.split('.').next().unwrap_or(without_scheme);
    prefix.replace('-', "_").to_uppercase()
}
