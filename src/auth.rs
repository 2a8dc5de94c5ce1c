use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_TENANT_NAME_LEN;
use crate::observability::AUTH_FAILURES_TOTAL;
use crate::tenant::wal_file_stem;

/// Shared cleartext password for every organization. The database name in the
/// startup packet selects the organization and is checked before the password.
#[derive(Debug)]
pub struct AllotAuthSource {
    password: String,
}

impl AllotAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for AllotAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if let Some(org) = login.database() {
            let rejected = if org.len() > MAX_TENANT_NAME_LEN {
                Some("organization name too long".to_string())
            } else {
                wal_file_stem(org).err().map(|e| e.to_string())
            };
            if let Some(reason) = rejected {
                metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!(user = login.user(), %reason, "rejected login");
                return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    "3D000".into(),
                    reason,
                ))));
            }
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
