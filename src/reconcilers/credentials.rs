use std::fmt;

use k8s_openapi::api::core::v1::Secret;

use crate::{store::Store, Error, Result};

pub const ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENDPOINT_URL: &str = "AWS_ENDPOINT_URL";
pub const REGION: &str = "AWS_REGION";

/// S3 credentials read from a secret
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: String,
    pub region: String,
}

impl Credentials {
    /// Look up the secret `name` and extract the credentials from it.
    ///
    /// A missing secret is `Ok(None)` since it may still show up; a secret
    /// lacking one of the keys is an error.
    pub async fn resolve<S: Store>(store: &S, namespace: &str, name: &str) -> Result<Option<Self>> {
        match store.get::<Secret>(Some(namespace), name).await? {
            Some(secret) => Self::from_secret(name, &secret).map(Some),
            None => Ok(None),
        }
    }

    pub fn from_secret(name: &str, secret: &Secret) -> Result<Self> {
        let field = |key: &'static str| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .and_then(|value| String::from_utf8(value.0.clone()).ok())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| Error::InvalidCredential(name.into(), key))
        };

        Ok(Self {
            access_key_id: field(ACCESS_KEY_ID)?,
            secret_access_key: field(SECRET_ACCESS_KEY)?,
            endpoint_url: field(ENDPOINT_URL)?,
            region: field(REGION)?,
        })
    }
}

// Keep the secret key out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .finish()
    }
}
