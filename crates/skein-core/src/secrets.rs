use futures::future::BoxFuture;

use crate::error::{Result, SkeinError};
use crate::traits::SecretStore;

/// Secret store backed by environment variables.
///
/// A key `backend.key` for project `billing` resolves from
/// `SKEIN_SECRET_BILLING_BACKEND_KEY`, falling back to the unscoped
/// `SKEIN_SECRET_BACKEND_KEY`. All-or-nothing: one missing variable fails
/// the whole fetch.
pub struct EnvSecrets {
    prefix: String,
}

impl EnvSecrets {
    pub fn new() -> Self {
        Self::with_prefix("SKEIN_SECRET")
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, scope: Option<&str>, key: &str) -> String {
        let mut name = self.prefix.clone();
        if let Some(scope) = scope {
            name.push('_');
            name.push_str(&sanitize(scope));
        }
        name.push('_');
        name.push_str(&sanitize(key));
        name
    }
}

impl Default for EnvSecrets {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl SecretStore for EnvSecrets {
    fn secrets(&self, project_id: &str, keys: &[String]) -> BoxFuture<'_, Result<Vec<String>>> {
        let project_id = project_id.to_string();
        let keys = keys.to_vec();
        Box::pin(async move {
            let mut values = Vec::with_capacity(keys.len());
            for key in &keys {
                let scoped = std::env::var(self.var_name(Some(&project_id), key));
                let value = match scoped {
                    Ok(value) => value,
                    Err(_) => std::env::var(self.var_name(None, key))
                        .map_err(|_| SkeinError::SecretResolution(key.clone()))?,
                };
                values.push(value);
            }
            Ok(values)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scoped_then_unscoped_lookup() {
        std::env::set_var("T1_BILLING_API_KEY", "scoped");
        std::env::set_var("T1_OTHER_KEY", "unscoped");

        let secrets = EnvSecrets::with_prefix("T1");
        let values = secrets
            .secrets("billing", &["api.key".into(), "other-key".into()])
            .await
            .unwrap();
        assert_eq!(values, vec!["scoped".to_string(), "unscoped".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_variable_fails_whole_fetch() {
        std::env::set_var("T2_PRESENT", "yes");

        let secrets = EnvSecrets::with_prefix("T2");
        let err = secrets
            .secrets("p", &["present".into(), "absent".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, SkeinError::SecretResolution(_)));
    }
}
