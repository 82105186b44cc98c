//! Enterprise identity broker seam.
//!
//! Brokered profiles authenticate with a bearer token obtained through a
//! device-code login. Token acquisition and publishing live outside this
//! crate; [`IdentityBroker`] is the boundary.

use crate::error::{ErrorKind, VpnError, VpnResult};

/// What the user must enter on another device to complete a login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCode {
    pub verification_uri: String,
    pub user_code: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct BrokerToken {
    pub access_token: String,
    /// Account name the token was issued to.
    pub account: String,
}

impl std::fmt::Debug for BrokerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerToken")
            .field("access_token", &"<redacted>")
            .field("account", &self.account)
            .finish()
    }
}

pub trait IdentityBroker: Send + Sync {
    /// Runs the login flow. `on_device_code` is called when the user has to
    /// act on another device.
    fn login(&self, on_device_code: &mut dyn FnMut(&DeviceCode)) -> VpnResult<BrokerToken>;

    /// Hands the token to the VPN backend for `account`.
    fn publish(&self, account: &str, token: &str) -> VpnResult<()>;
}

/// Broker for a token that was acquired out of band. Publishing is left to
/// whoever issued the token.
pub struct StaticTokenBroker {
    token: BrokerToken,
}

impl StaticTokenBroker {
    pub fn new(access_token: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            token: BrokerToken {
                access_token: access_token.into(),
                account: account.into(),
            },
        }
    }
}

impl IdentityBroker for StaticTokenBroker {
    fn login(&self, _on_device_code: &mut dyn FnMut(&DeviceCode)) -> VpnResult<BrokerToken> {
        if self.token.access_token.trim().is_empty() {
            return Err(VpnError::new(ErrorKind::Broker, "no access token provided"));
        }
        Ok(self.token.clone())
    }

    fn publish(&self, account: &str, _token: &str) -> VpnResult<()> {
        log::debug!("Token for {} was issued out of band, not publishing", account);
        Ok(())
    }
}
